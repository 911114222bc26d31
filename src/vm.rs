use crate::{
    error::{format_traceback_line, RuntimeError},
    memory::Heap,
    object::HeapObject,
    Compiler, Lexer, Opcode, Value,
};
use anyhow::{bail, Result};
use std::{
    collections::HashMap,
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::trace;

pub const FRAMES_MAX: usize = 400;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Activation record: the function's heap handle, the instruction pointer
/// into its chunk, and the stack index of local slot 0 (the function).
#[derive(Debug, Clone)]
struct CallFrame {
    function: u32,
    ip: usize,
    base: usize,
}

pub struct VirtualMachine {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    last_pop: Value,
    file: String,
    interrupt: Arc<AtomicBool>,
    out: Box<dyn Write>,
}

impl VirtualMachine {
    pub fn new(file: impl Into<String>) -> Self {
        Self::with_output(file, Box::new(io::stdout()))
    }

    pub fn with_output(file: impl Into<String>, out: Box<dyn Write>) -> Self {
        Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            last_pop: Value::Nil,
            file: file.into(),
            interrupt: Arc::new(AtomicBool::new(false)),
            out,
        }
    }

    /// The value most recently discarded by a top-level statement; the REPL
    /// echoes it when it is not nil.
    pub fn last_popped(&self) -> Value {
        self.last_pop
    }

    pub fn stringify(&self, value: Value) -> String {
        value.stringify(&self.heap)
    }

    /// Cooperative interrupt flag, checked before every instruction.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Lex, compile, run. Globals and the heap survive across calls so a
    /// REPL can build on earlier lines; the stacks are reset every time.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        self.last_pop = Value::Nil;
        let mut lexer = Lexer::new(source, &self.file);
        let tokens = lexer.tokenize();
        if lexer.had_error() {
            bail!("syntax errors detected");
        }
        let compiler = Compiler::new(&tokens, source, &self.file, &mut self.heap);
        let script = compiler.compile()?;
        self.run(script)
    }

    pub fn run(&mut self, script: Value) -> Result<()> {
        let Value::HeapRef(handle) = script else {
            bail!("script is not executable");
        };
        self.stack.clear();
        self.frames.clear();
        self.stack.push(script);
        self.frames.push(CallFrame {
            function: handle,
            ip: 0,
            base: 0,
        });
        match self.dispatch() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.report_runtime_error(&error);
                self.stack.clear();
                self.frames.clear();
                Err(error.into())
            }
        }
    }

    fn dispatch(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.interrupt.swap(false, Ordering::Relaxed) {
                return Err(RuntimeError::new("InterruptedError", "execution interrupted"));
            }
            let opcode = Opcode::try_from(self.read_byte()?).map_err(|byte| {
                RuntimeError::new("RuntimeError", format!("unknown opcode {}", byte))
            })?;
            trace!(?opcode, depth = self.stack.len(), "dispatch");
            match opcode {
                Opcode::Constant => {
                    let value = self.read_constant(false)?;
                    self.push(value)?;
                }
                Opcode::ConstantLong => {
                    let value = self.read_constant(true)?;
                    self.push(value)?;
                }
                Opcode::True => self.push(Value::Bool(true))?,
                Opcode::False => self.push(Value::Bool(false))?,
                Opcode::Nil => self.push(Value::Nil)?,
                Opcode::Inf => self.push(Value::Infinity { negative: false })?,
                Opcode::Nan => self.push(Value::Nan)?,
                Opcode::Pop => {
                    let value = self.pop()?;
                    if self.frames.len() == 1 {
                        self.last_pop = value;
                    }
                }
                Opcode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame().base;
                    let value = *self
                        .stack
                        .get(base + slot)
                        .ok_or_else(|| internal_error("local slot out of range"))?;
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame().base;
                    let value = self.peek(0)?;
                    match self.stack.get_mut(base + slot) {
                        Some(target) => *target = value,
                        None => return Err(internal_error("local slot out of range")),
                    }
                }
                Opcode::GetGlobal | Opcode::GetGlobalLong => {
                    let name = self.read_name(opcode == Opcode::GetGlobalLong)?;
                    let value = self.globals.get(&name).copied();
                    match value {
                        Some(value) => self.push(value)?,
                        None => return Err(undefined_name(&name)),
                    }
                }
                Opcode::SetGlobal | Opcode::SetGlobalLong => {
                    let name = self.read_name(opcode == Opcode::SetGlobalLong)?;
                    if !self.globals.contains_key(&name) {
                        return Err(undefined_name(&name));
                    }
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                }
                Opcode::DefineGlobal | Opcode::DefineGlobalLong => {
                    let name = self.read_name(opcode == Opcode::DefineGlobalLong)?;
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                    self.pop()?;
                }
                Opcode::DeleteGlobal | Opcode::DeleteGlobalLong => {
                    let name = self.read_name(opcode == Opcode::DeleteGlobalLong)?;
                    if self.globals.remove(&name).is_none() {
                        return Err(undefined_name(&name));
                    }
                }
                Opcode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = a.equals(b, &self.heap);
                    self.push(Value::Bool(equal))?;
                }
                Opcode::NotEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = a.equals(b, &self.heap);
                    self.push(Value::Bool(!equal))?;
                }
                Opcode::Less
                | Opcode::LessEqual
                | Opcode::Greater
                | Opcode::GreaterEqual => self.comparison(opcode)?,
                Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Modulo
                | Opcode::Pow
                | Opcode::BitAnd
                | Opcode::BitOr
                | Opcode::BitXor
                | Opcode::ShiftLeft
                | Opcode::ShiftRight => self.binary(opcode)?,
                Opcode::Not => {
                    let value = self.pop()?;
                    let falsey = value.is_falsey(&self.heap);
                    self.push(Value::Bool(falsey))?;
                }
                Opcode::Negate => {
                    let value = self.pop()?;
                    match value.negate()? {
                        Some(negated) => self.push(negated)?,
                        None => return Err(self.unary_type_error("-", value)),
                    }
                }
                Opcode::BitNot => {
                    let value = self.pop()?;
                    match value.bitnot() {
                        Some(inverted) => self.push(inverted)?,
                        None => return Err(self.unary_type_error("~", value)),
                    }
                }
                Opcode::Jump => {
                    let offset = self.read_u16_operand()? as usize;
                    self.frame_mut().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_u16_operand()? as usize;
                    if self.peek(0)?.is_falsey(&self.heap) {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_u16_operand()? as usize;
                    self.frame_mut().ip -= offset;
                }
                Opcode::Call => {
                    let argc = self.read_byte()? as usize;
                    self.call_value(argc)?;
                }
                Opcode::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().ok_or_else(|| internal_error("no frame"))?;
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                Opcode::Print => {
                    let value = self.pop()?;
                    let text = value.stringify(&self.heap);
                    let _ = writeln!(self.out, "{}", text);
                    let _ = self.out.flush();
                }
            }
        }
    }

    // Stack and frame helpers

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::new("RecursionError", "stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| internal_error("stack underflow"))
    }

    fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|index| self.stack.get(index))
            .copied()
            .ok_or_else(|| internal_error("stack underflow"))
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let frame = self.frames.last_mut().expect("no active frame");
        let HeapObject::Function(function) = self.heap.get(frame.function) else {
            return Err(internal_error("frame does not hold a function"));
        };
        let byte = function
            .chunk
            .code
            .get(frame.ip)
            .copied()
            .ok_or_else(|| internal_error("instruction pointer out of range"))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16_operand(&mut self) -> Result<u16, RuntimeError> {
        let low = self.read_byte()?;
        let high = self.read_byte()?;
        Ok(u16::from(low) | (u16::from(high) << 8))
    }

    fn read_u24_operand(&mut self) -> Result<usize, RuntimeError> {
        let low = self.read_byte()?;
        let mid = self.read_byte()?;
        let high = self.read_byte()?;
        Ok(usize::from(low) | (usize::from(mid) << 8) | (usize::from(high) << 16))
    }

    fn read_constant(&mut self, long: bool) -> Result<Value, RuntimeError> {
        let index = if long {
            self.read_u24_operand()?
        } else {
            self.read_byte()? as usize
        };
        let frame = self.frames.last().expect("no active frame");
        let HeapObject::Function(function) = self.heap.get(frame.function) else {
            return Err(internal_error("frame does not hold a function"));
        };
        function
            .chunk
            .constants
            .get(index)
            .copied()
            .ok_or_else(|| internal_error("constant index out of range"))
    }

    fn read_name(&mut self, long: bool) -> Result<String, RuntimeError> {
        let constant = self.read_constant(long)?;
        self.heap
            .string_text(constant)
            .map(str::to_string)
            .ok_or_else(|| internal_error("name constant is not a string"))
    }

    fn comparison(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        use std::cmp::Ordering;
        let b = self.pop()?;
        let a = self.pop()?;
        let Some(ordering) = a.numeric_cmp(b) else {
            return Err(self.binary_type_error(operator_symbol(opcode), a, b));
        };
        // Unordered (NaN) compares false everywhere.
        let result = match opcode {
            Opcode::Less => ordering == Some(Ordering::Less),
            Opcode::LessEqual => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Opcode::Greater => ordering == Some(Ordering::Greater),
            Opcode::GreaterEqual => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            _ => return Err(internal_error("not a comparison opcode")),
        };
        self.push(Value::Bool(result))
    }

    fn binary(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match opcode {
            Opcode::Add => a.add(b, &mut self.heap)?,
            Opcode::Subtract => a.subtract(b)?,
            Opcode::Multiply => a.multiply(b, &mut self.heap)?,
            Opcode::Divide => a.divide(b)?,
            Opcode::Modulo => a.modulo(b)?,
            Opcode::Pow => a.power(b)?,
            Opcode::BitAnd => a.bitand(b)?,
            Opcode::BitOr => a.bitor(b)?,
            Opcode::BitXor => a.bitxor(b)?,
            Opcode::ShiftLeft => a.shift_left(b)?,
            Opcode::ShiftRight => a.shift_right(b)?,
            _ => return Err(internal_error("not a binary opcode")),
        };
        match result {
            Some(value) => self.push(value),
            None => Err(self.binary_type_error(operator_symbol(opcode), a, b)),
        }
    }

    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(argc)?;
        let Value::HeapRef(handle) = callee else {
            return Err(self.not_callable(callee));
        };
        let (arity, required, defaults, name) = match self.heap.get(handle) {
            HeapObject::Function(function) => (
                function.arity,
                function.required_arity(),
                function.defaults.clone(),
                function
                    .name
                    .clone()
                    .unwrap_or_else(|| "<code object>".to_string()),
            ),
            _ => return Err(self.not_callable(callee)),
        };
        if argc < required || argc > arity {
            let expectation = if required == arity {
                format!("exactly {}", arity)
            } else {
                format!("from {} to {}", required, arity)
            };
            return Err(RuntimeError::new(
                "TypeError",
                format!(
                    "function '{}' takes {} arguments, got {}",
                    name, expectation, argc
                ),
            ));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            ));
        }
        for default in defaults.iter().skip(argc - required) {
            self.push(*default)?;
        }
        let base = self.stack.len() - arity - 1;
        self.frames.push(CallFrame {
            function: handle,
            ip: 0,
            base,
        });
        Ok(())
    }

    // Error construction and reporting

    fn binary_type_error(&self, operator: &str, a: Value, b: Value) -> RuntimeError {
        RuntimeError::new(
            "TypeError",
            format!(
                "unsupported binary operator '{}' for objects of type '{}' and '{}'",
                operator,
                a.type_name(&self.heap),
                b.type_name(&self.heap)
            ),
        )
    }

    fn unary_type_error(&self, operator: &str, value: Value) -> RuntimeError {
        RuntimeError::new(
            "TypeError",
            format!(
                "unsupported unary operator '{}' for object of type '{}'",
                operator,
                value.type_name(&self.heap)
            ),
        )
    }

    fn not_callable(&self, callee: Value) -> RuntimeError {
        RuntimeError::new(
            "TypeError",
            format!(
                "object of type '{}' is not callable",
                callee.type_name(&self.heap)
            ),
        )
    }

    fn frame_line(&self, frame: &CallFrame) -> usize {
        match self.heap.function(frame.function) {
            Some(function) if !function.chunk.lines.is_empty() => {
                let index = frame.ip.saturating_sub(1).min(function.chunk.lines.len() - 1);
                function.chunk.lines[index]
            }
            _ => 0,
        }
    }

    /// Prints the full traceback, outermost frame first, then unwinds.
    fn report_runtime_error(&mut self, error: &RuntimeError) {
        let mut text = String::from("Traceback (most recent call last):");
        for frame in &self.frames {
            text.push('\n');
            text.push_str(&format_traceback_line(self.frame_line(frame), &self.file));
        }
        let exception = self
            .heap
            .alloc_exception(error.name, error.message.clone());
        text.push('\n');
        text.push_str(&exception.stringify(&self.heap));
        eprintln!("{}", text);
        if let Value::HeapRef(handle) = exception {
            self.heap.free(handle);
        }
    }
}

fn internal_error(message: &str) -> RuntimeError {
    RuntimeError::new("RuntimeError", message.to_string())
}

fn undefined_name(name: &str) -> RuntimeError {
    RuntimeError::new("ReferenceError", format!("undefined name '{}'", name))
}

fn operator_symbol(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Add => "+",
        Opcode::Subtract => "-",
        Opcode::Multiply => "*",
        Opcode::Divide => "/",
        Opcode::Modulo => "%",
        Opcode::Pow => "**",
        Opcode::BitAnd => "&",
        Opcode::BitOr => "|",
        Opcode::BitXor => "^",
        Opcode::ShiftLeft => "<<",
        Opcode::ShiftRight => ">>",
        Opcode::Less => "<",
        Opcode::LessEqual => "<=",
        Opcode::Greater => ">",
        Opcode::GreaterEqual => ">=",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Clone, Default)]
    struct CaptureBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for CaptureBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CaptureBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).expect("non-utf8 output")
        }
    }

    fn run_vm_test(source: &str) -> Result<Value> {
        let mut vm = VirtualMachine::new("test");
        vm.interpret(source)?;
        Ok(vm.last_popped())
    }

    fn run_vm_output(source: &str) -> Result<String> {
        let buffer = CaptureBuffer::default();
        let mut vm = VirtualMachine::with_output("test", Box::new(buffer.clone()));
        vm.interpret(source)?;
        Ok(buffer.text())
    }

    fn run_vm_error(source: &str) -> RuntimeError {
        let mut vm = VirtualMachine::new("test");
        let error = vm.interpret(source).expect_err("expected a runtime error");
        error
            .downcast::<RuntimeError>()
            .expect("not a runtime error")
    }

    #[test]
    fn test_integer_arithmetic() -> Result<()> {
        let tests = [
            ("1;", Value::Integer(1)),
            ("1 + 2;", Value::Integer(3)),
            ("1 + 2 * 3;", Value::Integer(7)),
            ("(1 + 2) * 3;", Value::Integer(9)),
            ("50 / 2 * 2 + 10 - 5;", Value::Integer(55)),
            ("7 / 2;", Value::Integer(3)),
            ("7 % 3;", Value::Integer(1)),
            ("2 ** 10;", Value::Integer(1024)),
            ("2 ** 3 ** 2;", Value::Integer(512)),
            ("-5 + 10;", Value::Integer(5)),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_test(source)?, expected, "failed for: {}", source);
        }
        Ok(())
    }

    #[test]
    fn test_float_arithmetic_and_promotion() -> Result<()> {
        let tests = [
            ("1.5 + 2.5;", Value::Float(4.0)),
            ("1 + 0.5;", Value::Float(1.5)),
            ("1.0 / 4;", Value::Float(0.25)),
            ("2 ** -1;", Value::Float(0.5)),
            ("1 / 0.0;", Value::Infinity { negative: false }),
            ("-1 / 0.0;", Value::Infinity { negative: true }),
            ("0.0 / 0.0;", Value::Nan),
            ("1 + inf;", Value::Infinity { negative: false }),
            ("inf - inf;", Value::Nan),
            ("-inf;", Value::Infinity { negative: true }),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_test(source)?, expected, "failed for: {}", source);
        }
        Ok(())
    }

    #[test]
    fn test_comparisons_and_equality() -> Result<()> {
        let tests = [
            ("1 < 2;", true),
            ("2 <= 2;", true),
            ("1 > 2;", false),
            ("2 >= 3;", false),
            ("1 == 1;", true),
            ("1 == 1.0;", true),
            ("1 != 2;", true),
            ("nan == nan;", false),
            ("nan < 1;", false),
            ("nan >= 1;", false),
            ("inf > 1000000;", true),
            ("-inf < 0;", true),
            ("\"hi\" == \"hi\";", true),
            ("\"hi\" == \"ho\";", false),
            ("\"1\" == 1;", false),
            ("nil == nil;", true),
            ("true == true;", true),
            ("!true;", false),
            ("!0;", true),
            ("!\"\";", true),
        ];
        for (source, expected) in tests {
            assert_eq!(
                run_vm_test(source)?,
                Value::Bool(expected),
                "failed for: {}",
                source
            );
        }
        Ok(())
    }

    #[test]
    fn test_bitwise_operators() -> Result<()> {
        let tests = [
            ("6 & 3;", 2),
            ("6 | 3;", 7),
            ("6 ^ 3;", 5),
            ("1 << 4;", 16),
            ("-16 >> 2;", -4),
            ("~0;", -1),
        ];
        for (source, expected) in tests {
            assert_eq!(
                run_vm_test(source)?,
                Value::Integer(expected),
                "failed for: {}",
                source
            );
        }
        Ok(())
    }

    #[test]
    fn test_logical_operators_short_circuit() -> Result<()> {
        // The right operand of a short-circuited 'and'/'or' is never
        // evaluated, so an undefined name there cannot raise.
        let tests = [
            ("false and missing;", Value::Bool(false)),
            ("true or missing;", Value::Bool(true)),
            ("1 and 2;", Value::Integer(2)),
            ("0 or 3;", Value::Integer(3)),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_test(source)?, expected, "failed for: {}", source);
        }
        let mut vm = VirtualMachine::new("test");
        vm.interpret("nil or \"fallback\";")?;
        assert_eq!(vm.heap.string_text(vm.last_popped()), Some("fallback"));
        Ok(())
    }

    #[test]
    fn test_string_operators() -> Result<()> {
        let mut vm = VirtualMachine::new("test");
        vm.interpret("\"ab\" + \"cd\";")?;
        assert_eq!(vm.heap.string_text(vm.last_popped()), Some("abcd"));

        vm.interpret("\"ab\" * 3;")?;
        assert_eq!(vm.heap.string_text(vm.last_popped()), Some("ababab"));

        vm.interpret("2 * \"ab\";")?;
        assert_eq!(vm.heap.string_text(vm.last_popped()), Some("abab"));
        Ok(())
    }

    #[test]
    fn test_globals() -> Result<()> {
        let tests = [
            ("var a = 1; a;", Value::Integer(1)),
            ("var a = 1; var b = 2; a + b;", Value::Integer(3)),
            ("var a = 1; a = a + 2; a;", Value::Integer(3)),
            ("var a = 1; var a = 2; a;", Value::Integer(2)),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_test(source)?, expected, "failed for: {}", source);
        }
        Ok(())
    }

    #[test]
    fn test_delete_global() {
        assert!(run_vm_test("var a = 1; del a;").is_ok());
        let error = run_vm_error("var a = 1; del a; a;");
        assert_eq!(error.name, "ReferenceError");
        let error = run_vm_error("del neverDefined;");
        assert_eq!(error.name, "ReferenceError");
    }

    #[test]
    fn test_locals_and_scoping() -> Result<()> {
        let output = run_vm_output(
            "var x = \"global\";\n{\n  var x = \"outer\";\n  {\n    var x = \"inner\";\n    print x;\n  }\n  print x;\n}\nprint x;\n",
        )?;
        assert_eq!(output, "inner\nouter\nglobal\n");
        Ok(())
    }

    #[test]
    fn test_if_else() -> Result<()> {
        let tests = [
            ("if (true) print 1; else print 2;", "1\n"),
            ("if (false) print 1; else print 2;", "2\n"),
            ("if (1 < 2) print \"yes\";", "yes\n"),
            ("if (\"\") print 1; else print 2;", "2\n"),
            ("if (0.0) print 1; else print 2;", "2\n"),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_output(source)?, expected, "failed for: {}", source);
        }
        Ok(())
    }

    #[test]
    fn test_while_loop() -> Result<()> {
        let output = run_vm_output("var n = 0; while (n < 3) { print n; n = n + 1; }")?;
        assert_eq!(output, "0\n1\n2\n");
        Ok(())
    }

    #[test]
    fn test_for_loop() -> Result<()> {
        let output = run_vm_output("for (var i = 0; i < 4; i = i + 1) print i;")?;
        assert_eq!(output, "0\n1\n2\n3\n");
        Ok(())
    }

    #[test]
    fn test_break_and_continue() -> Result<()> {
        let output = run_vm_output(
            "for (var i = 0; i < 10; i = i + 1) {\n  if (i % 2 == 1) continue;\n  if (i > 6) break;\n  print i;\n}",
        )?;
        assert_eq!(output, "0\n2\n4\n6\n");

        let output = run_vm_output(
            "var n = 0; while (true) { n = n + 1; if (n == 3) break; } print n;",
        )?;
        assert_eq!(output, "3\n");
        Ok(())
    }

    #[test]
    fn test_function_calls() -> Result<()> {
        let tests = [
            ("fun add(a, b) { return a + b; } add(1, 2);", Value::Integer(3)),
            ("fun ret() { return; } ret();", Value::Nil),
            ("fun implicit() {} implicit();", Value::Nil),
            (
                "fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } fact(5);",
                Value::Integer(120),
            ),
            (
                "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } fib(10);",
                Value::Integer(55),
            ),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_test(source)?, expected, "failed for: {}", source);
        }
        Ok(())
    }

    #[test]
    fn test_default_arguments() -> Result<()> {
        let source = "fun scale(n, factor = 10) { return n * factor; }";
        let tests = [
            (format!("{} scale(3);", source), Value::Integer(30)),
            (format!("{} scale(3, 2);", source), Value::Integer(6)),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_test(&source)?, expected, "failed for: {}", source);
        }
        Ok(())
    }

    #[test]
    fn test_arity_errors() {
        let source = "fun scale(n, factor = 10) { return n * factor; }";
        let too_few = run_vm_error(&format!("{} scale();", source));
        assert_eq!(too_few.name, "TypeError");
        assert!(too_few.message.contains("from 1 to 2"));

        let too_many = run_vm_error(&format!("{} scale(1, 2, 3);", source));
        assert_eq!(too_many.name, "TypeError");

        let exact = run_vm_error("fun pair(a, b) { return a; } pair(1);");
        assert!(exact.message.contains("exactly 2"));
    }

    #[test]
    fn test_runtime_errors() {
        let tests = [
            ("1 / 0;", "ZeroDivisionError"),
            ("1 % 0;", "ZeroDivisionError"),
            ("undefinedName;", "ReferenceError"),
            ("missing = 1;", "ReferenceError"),
            ("1 + \"x\";", "TypeError"),
            ("-\"x\";", "TypeError"),
            ("~1.5;", "TypeError"),
            ("\"a\" < \"b\";", "TypeError"),
            ("var a = 1; a();", "TypeError"),
            ("9223372036854775807 + 1;", "OverflowError"),
            ("9223372036854775807 * 2;", "OverflowError"),
            ("1 << 64;", "OverflowError"),
            ("fun loop() { return loop(); } loop();", "RecursionError"),
        ];
        for (source, expected) in tests {
            let error = run_vm_error(source);
            assert_eq!(error.name, expected, "failed for: {}", source);
        }
    }

    #[test]
    fn test_reference_error_message() {
        let error = run_vm_error("undefinedName;");
        assert_eq!(error.to_string(), "ReferenceError: undefined name 'undefinedName'");
    }

    #[test]
    fn test_interrupt_flag_raises() {
        let mut vm = VirtualMachine::new("test");
        vm.interrupt_handle().store(true, Ordering::Relaxed);
        let error = vm
            .interpret("1 + 1;")
            .expect_err("expected an interrupt")
            .downcast::<RuntimeError>()
            .expect("not a runtime error");
        assert_eq!(error.name, "InterruptedError");

        // The flag is consumed; the next run proceeds normally.
        assert!(vm.interpret("1 + 1;").is_ok());
    }

    #[test]
    fn test_stack_is_balanced_after_statements() -> Result<()> {
        let mut vm = VirtualMachine::new("test");
        vm.interpret(
            "var a = 1; print a; { var b = a + 1; print b; } fun f(x) { return x; } f(3); 4;",
        )?;
        assert_eq!(vm.stack_depth(), 0);
        Ok(())
    }

    #[test]
    fn test_globals_survive_across_interpret_calls() -> Result<()> {
        let mut vm = VirtualMachine::new("test");
        vm.interpret("var total = 1;")?;
        vm.interpret("total = total + 2;")?;
        vm.interpret("total;")?;
        assert_eq!(vm.last_popped(), Value::Integer(3));
        Ok(())
    }

    #[test]
    fn test_last_pop_resets_between_evaluations() -> Result<()> {
        let mut vm = VirtualMachine::new("test");
        vm.interpret("42;")?;
        assert_eq!(vm.last_popped(), Value::Integer(42));
        vm.interpret("var quiet = 1;")?;
        assert_eq!(vm.last_popped(), Value::Nil);
        Ok(())
    }

    #[test]
    fn test_repl_state_survives_a_runtime_error() -> Result<()> {
        let mut vm = VirtualMachine::new("test");
        vm.interpret("var a = 7;")?;
        assert!(vm.interpret("1 / 0;").is_err());
        assert_eq!(vm.stack_depth(), 0);
        vm.interpret("a;")?;
        assert_eq!(vm.last_popped(), Value::Integer(7));
        Ok(())
    }

    #[test]
    fn test_print_stringifies_values() -> Result<()> {
        let tests = [
            ("print 1 + 2 * 3;", "7\n"),
            ("print 2.5;", "2.5\n"),
            ("print true;", "true\n"),
            ("print nil;", "nil\n"),
            ("print inf;", "inf\n"),
            ("print -inf;", "-inf\n"),
            ("print nan;", "nan\n"),
            ("print \"hi\";", "hi\n"),
            ("fun f() {} print f;", "<function f>\n"),
            ("print 1 / 0.0;", "inf\n"),
        ];
        for (source, expected) in tests {
            assert_eq!(run_vm_output(source)?, expected, "failed for: {}", source);
        }
        Ok(())
    }

    #[test]
    fn test_string_equality_scenario() -> Result<()> {
        let output = run_vm_output("var a = \"hi\"; var b = \"hi\"; print a == b;")?;
        assert_eq!(output, "true\n");
        Ok(())
    }

    #[test]
    fn test_factorial_scenario() -> Result<()> {
        let output = run_vm_output(
            "fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } print fact(5);",
        )?;
        assert_eq!(output, "120\n");
        Ok(())
    }

    #[test]
    fn test_functions_as_values() -> Result<()> {
        let output = run_vm_output(
            "fun twice(f, x) { return f(f(x)); } fun inc(n) { return n + 1; } print twice(inc, 5);",
        )?;
        assert_eq!(output, "7\n");
        Ok(())
    }

    #[test]
    fn test_deep_recursion_is_not_a_stack_overflow() -> Result<()> {
        // 399 nested calls fit under FRAMES_MAX, one more would not.
        let source = "fun down(n) { if (n == 0) return 0; return down(n - 1); } down(398);";
        assert_eq!(run_vm_test(source)?, Value::Integer(0));
        Ok(())
    }
}
