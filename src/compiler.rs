use crate::{
    debug::disassemble_chunk,
    error::report_syntax_error,
    lexer::{Literal, Token, TokenKind},
    memory::Heap,
    object::Function,
    Opcode, Value,
};
use anyhow::{bail, Result};
use tracing::debug;

/// Local slots and call arity both travel in a single operand byte.
const LOCALS_MAX: usize = 256;
const ARGS_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Power,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Power,
            Power => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn = for<'a, 'b> fn(&'a mut Compiler<'b>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

fn grouping_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::grouping(c, can_assign)
}
fn call_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::call(c, can_assign)
}
fn unary_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::unary(c, can_assign)
}
fn binary_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::binary(c, can_assign)
}
fn and_operator_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::and_operator(c, can_assign)
}
fn or_operator_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::or_operator(c, can_assign)
}
fn variable_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::variable(c, can_assign)
}
fn string_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::string(c, can_assign)
}
fn number_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::number(c, can_assign)
}
fn literal_fn<'a, 'b>(c: &'a mut Compiler<'b>, can_assign: bool) {
    Compiler::literal(c, can_assign)
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule::new(Some(grouping_fn), Some(call_fn), Precedence::Call),
        Minus => ParseRule::new(Some(unary_fn), Some(binary_fn), Precedence::Term),
        Plus => ParseRule::new(None, Some(binary_fn), Precedence::Term),
        Star | Slash | Percent => ParseRule::new(None, Some(binary_fn), Precedence::Factor),
        StarStar => ParseRule::new(None, Some(binary_fn), Precedence::Power),
        Bang | Tilde => ParseRule::new(Some(unary_fn), None, Precedence::None),
        EqualEqual | BangEqual => ParseRule::new(None, Some(binary_fn), Precedence::Equality),
        Less | LessEqual | Greater | GreaterEqual => {
            ParseRule::new(None, Some(binary_fn), Precedence::Comparison)
        }
        Pipe => ParseRule::new(None, Some(binary_fn), Precedence::BitOr),
        Caret => ParseRule::new(None, Some(binary_fn), Precedence::BitXor),
        Ampersand => ParseRule::new(None, Some(binary_fn), Precedence::BitAnd),
        ShiftLeft | ShiftRight => ParseRule::new(None, Some(binary_fn), Precedence::Shift),
        And => ParseRule::new(None, Some(and_operator_fn), Precedence::And),
        Or => ParseRule::new(None, Some(or_operator_fn), Precedence::Or),
        Identifier => ParseRule::new(Some(variable_fn), None, Precedence::None),
        Str => ParseRule::new(Some(string_fn), None, Precedence::None),
        Integer | Float => ParseRule::new(Some(number_fn), None, Precedence::None),
        True | False | Nil | Inf | Nan => ParseRule::new(Some(literal_fn), None, Precedence::None),
        _ => ParseRule::new(None, None, Precedence::None),
    }
}

#[derive(Debug)]
struct Local {
    name: String,
    /// `None` while declared but not yet initialized.
    depth: Option<usize>,
}

#[derive(Debug)]
struct LoopContext {
    continue_target: usize,
    scope_depth: usize,
    breaks: Vec<usize>,
}

/// One function being compiled; the innermost unit owns the chunk under
/// construction. Slot 0 of every unit is reserved for the function value.
#[derive(Debug)]
struct CompileUnit {
    function: Function,
    locals: Vec<Local>,
    scope_depth: usize,
    loops: Vec<LoopContext>,
}

impl CompileUnit {
    fn new(name: Option<String>) -> Self {
        Self {
            function: Function::new(name),
            locals: vec![Local {
                name: String::new(),
                depth: Some(0),
            }],
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// Single-pass Pratt compiler: tokens in, bytecode out, no AST stage.
pub struct Compiler<'a> {
    tokens: &'a [Token],
    source: &'a str,
    file: &'a str,
    heap: &'a mut Heap,
    current: usize,
    units: Vec<CompileUnit>,
    had_error: bool,
    panic_mode: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(tokens: &'a [Token], source: &'a str, file: &'a str, heap: &'a mut Heap) -> Self {
        Self {
            tokens,
            source,
            file,
            heap,
            current: 0,
            units: Vec::new(),
            had_error: false,
            panic_mode: false,
        }
    }

    /// Compiles the whole token stream into a script function. Parse errors
    /// are reported as they occur; any error fails the compile after the
    /// full stream has been checked.
    pub fn compile(mut self) -> Result<Value> {
        self.units.push(CompileUnit::new(None));
        while !self.matches(TokenKind::EndOfFile) {
            self.declaration();
        }
        let script = self.end_unit();
        if self.had_error {
            bail!("compilation failed");
        }
        Ok(self.heap.alloc_function(script))
    }

    // Token plumbing

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn current_token(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn current_kind(&self) -> TokenKind {
        self.current_token().kind
    }

    fn advance(&mut self) {
        if self.current < self.tokens.len() {
            self.current += 1;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current_kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    // Error reporting

    fn error(&mut self, message: &str) {
        let token = self.previous().clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current_token().clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let context = if token.kind == TokenKind::EndOfFile {
            "<eof>"
        } else {
            token.lexeme(self.source)
        };
        report_syntax_error(self.file, token.line, context, "SyntaxError", message);
    }

    /// Panic-mode recovery: discard tokens until a statement boundary.
    fn synchronize(&mut self) {
        use TokenKind::*;
        self.panic_mode = false;
        while !self.check(EndOfFile) {
            if self.previous().kind == Semicolon {
                return;
            }
            match self.current_kind() {
                Class | Fun | Var | For | If | While | Print | Return | Del | Break
                | Continue => return,
                _ => {}
            }
            self.advance();
        }
    }

    // Emission

    fn unit(&self) -> &CompileUnit {
        self.units.last().expect("no active compile unit")
    }

    fn unit_mut(&mut self) -> &mut CompileUnit {
        self.units.last_mut().expect("no active compile unit")
    }

    fn chunk_len(&self) -> usize {
        self.unit().function.chunk.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous().line;
        self.unit_mut().function.chunk.write(byte, line);
    }

    fn emit_opcode(&mut self, opcode: Opcode) {
        self.emit_byte(opcode as u8);
    }

    fn emit_jump(&mut self, opcode: Opcode) -> usize {
        self.emit_opcode(opcode);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("too much code to jump over");
            return;
        }
        let code = &mut self.unit_mut().function.chunk.code;
        code[offset] = (jump & 0xff) as u8;
        code[offset + 1] = ((jump >> 8) & 0xff) as u8;
    }

    fn emit_loop(&mut self, target: usize) {
        self.emit_opcode(Opcode::Loop);
        let offset = self.chunk_len() - target + 2;
        if offset > u16::MAX as usize {
            self.error("loop body is too large");
        }
        self.emit_byte((offset & 0xff) as u8);
        self.emit_byte(((offset >> 8) & 0xff) as u8);
    }

    /// Emits a constant-pool access, switching to the 24-bit form when the
    /// pool has outgrown one byte.
    fn emit_indexed(&mut self, short: Opcode, long: Opcode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_opcode(short);
            self.emit_byte(index as u8);
        } else if index < (1 << 24) {
            self.emit_opcode(long);
            self.emit_byte((index & 0xff) as u8);
            self.emit_byte(((index >> 8) & 0xff) as u8);
            self.emit_byte(((index >> 16) & 0xff) as u8);
        } else {
            self.error("too many constants in one chunk");
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.unit_mut().function.chunk.add_constant(value);
        self.emit_indexed(Opcode::Constant, Opcode::ConstantLong, index);
    }

    /// String constants are interned per chunk: textually equal literals
    /// share one pool slot and one heap object.
    fn string_constant(&mut self, text: &str) -> usize {
        let unit = self.units.last_mut().expect("no active compile unit");
        for (index, constant) in unit.function.chunk.constants.iter().enumerate() {
            if self.heap.string_text(*constant) == Some(text) {
                return index;
            }
        }
        let value = self.heap.alloc_string(text);
        unit.function.chunk.add_constant(value)
    }

    fn end_unit(&mut self) -> Function {
        self.emit_opcode(Opcode::Nil);
        self.emit_opcode(Opcode::Return);
        let unit = self.units.pop().expect("no active compile unit");
        if !self.had_error && tracing::enabled!(tracing::Level::DEBUG) {
            let label = unit
                .function
                .name
                .clone()
                .unwrap_or_else(|| "<script>".to_string());
            debug!(
                "\n{}",
                disassemble_chunk(&unit.function.chunk, self.heap, &label)
            );
        }
        unit.function
    }

    // Declarations and statements

    fn declaration(&mut self) {
        if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        use TokenKind::*;
        if self.matches(Print) {
            self.print_statement();
        } else if self.matches(If) {
            self.if_statement();
        } else if self.matches(While) {
            self.while_statement();
        } else if self.matches(For) {
            self.for_statement();
        } else if self.matches(Return) {
            self.return_statement();
        } else if self.matches(Break) {
            self.break_statement();
        } else if self.matches(Continue) {
            self.continue_statement();
        } else if self.matches(Del) {
            self.del_statement();
        } else if self.matches(LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected a variable name");
        let name = self.previous().lexeme(self.source).to_string();
        let is_local = self.unit().scope_depth > 0;
        if is_local {
            self.declare_local(&name);
        }
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_opcode(Opcode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "expected ';' after variable declaration",
        );
        if is_local {
            self.mark_initialized();
        } else {
            let index = self.string_constant(&name);
            self.emit_indexed(Opcode::DefineGlobal, Opcode::DefineGlobalLong, index);
        }
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected a function name");
        let name = self.previous().lexeme(self.source).to_string();
        let is_local = self.unit().scope_depth > 0;
        if is_local {
            self.declare_local(&name);
            // Initialized up front so the body may recurse.
            self.mark_initialized();
        }
        self.function(&name);
        if !is_local {
            let index = self.string_constant(&name);
            self.emit_indexed(Opcode::DefineGlobal, Opcode::DefineGlobalLong, index);
        }
    }

    fn function(&mut self, name: &str) {
        self.units.push(CompileUnit::new(Some(name.to_string())));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.unit().function.arity >= ARGS_MAX {
                    self.error_at_current("a function cannot take more than 255 parameters");
                }
                self.unit_mut().function.arity += 1;
                self.consume(TokenKind::Identifier, "expected a parameter name");
                let parameter = self.previous().lexeme(self.source).to_string();
                self.declare_local(&parameter);
                self.mark_initialized();
                if self.matches(TokenKind::Equal) {
                    match self.default_value() {
                        Some(value) => self.unit_mut().function.defaults.push(value),
                        None => self.error("default arguments must be literal values"),
                    }
                } else if !self.unit().function.defaults.is_empty() {
                    self.error("a parameter without a default follows one with a default");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();
        let function = self.end_unit();
        let value = self.heap.alloc_function(function);
        self.emit_constant(value);
    }

    /// Default parameter values are literals evaluated at compile time.
    fn default_value(&mut self) -> Option<Value> {
        self.advance();
        let kind = self.previous().kind;
        let literal = self.previous().literal.clone();
        match kind {
            TokenKind::Integer | TokenKind::Float => match literal {
                Literal::Integer(value) => Some(Value::Integer(value)),
                Literal::Float(value) => Some(Value::from_float(value)),
                _ => None,
            },
            TokenKind::Str => match literal {
                Literal::Str(text) => Some(self.heap.alloc_string(text)),
                _ => None,
            },
            TokenKind::True => Some(Value::Bool(true)),
            TokenKind::False => Some(Value::Bool(false)),
            TokenKind::Nil => Some(Value::Nil),
            TokenKind::Inf => Some(Value::Infinity { negative: false }),
            TokenKind::Nan => Some(Value::Nan),
            TokenKind::Minus => {
                self.advance();
                let negated = self.previous().literal.clone();
                match negated {
                    Literal::Integer(value) => Some(Value::Integer(-value)),
                    Literal::Float(value) => Some(Value::from_float(-value)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::EndOfFile) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_opcode(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_opcode(Opcode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_opcode(Opcode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_opcode(Opcode::Pop);
        self.end_loop();
    }

    /// for (initializer; condition; increment) body — the increment runs
    /// after the body via a jump pair, and `continue` targets it.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_opcode(Opcode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_opcode(Opcode::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_opcode(Opcode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn begin_loop(&mut self, continue_target: usize) {
        let scope_depth = self.unit().scope_depth;
        self.unit_mut().loops.push(LoopContext {
            continue_target,
            scope_depth,
            breaks: Vec::new(),
        });
    }

    fn end_loop(&mut self) {
        let context = self
            .unit_mut()
            .loops
            .pop()
            .expect("end_loop without begin_loop");
        for offset in context.breaks {
            self.patch_jump(offset);
        }
    }

    /// Pops the values of locals declared inside the loop body before a
    /// break/continue transfers control out of it.
    fn discard_loop_locals(&mut self) {
        let unit = self.unit();
        let loop_depth = match unit.loops.last() {
            Some(context) => context.scope_depth,
            None => return,
        };
        let count = unit
            .locals
            .iter()
            .filter(|local| matches!(local.depth, Some(depth) if depth > loop_depth))
            .count();
        for _ in 0..count {
            self.emit_opcode(Opcode::Pop);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "expected ';' after 'break'");
        if self.unit().loops.is_empty() {
            self.error("'break' outside a loop");
            return;
        }
        self.discard_loop_locals();
        let jump = self.emit_jump(Opcode::Jump);
        self.unit_mut()
            .loops
            .last_mut()
            .expect("loop context vanished")
            .breaks
            .push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "expected ';' after 'continue'");
        let target = self.unit().loops.last().map(|context| context.continue_target);
        let Some(target) = target else {
            self.error("'continue' outside a loop");
            return;
        };
        self.discard_loop_locals();
        self.emit_loop(target);
    }

    fn return_statement(&mut self) {
        if self.units.len() == 1 {
            self.error("cannot return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_opcode(Opcode::Nil);
            self.emit_opcode(Opcode::Return);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_opcode(Opcode::Return);
        }
    }

    fn del_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expected a name after 'del'");
        let name = self.previous().lexeme(self.source).to_string();
        if self.resolve_local(&name).is_some() {
            self.error("cannot delete a local variable");
        } else {
            let index = self.string_constant(&name);
            self.emit_indexed(Opcode::DeleteGlobal, Opcode::DeleteGlobalLong, index);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after 'del' statement");
    }

    // Scopes and locals

    fn begin_scope(&mut self) {
        self.unit_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let unit = self.units.last_mut().expect("no active compile unit");
        unit.scope_depth -= 1;
        let mut pops = 0;
        while let Some(local) = unit.locals.last() {
            match local.depth {
                Some(depth) if depth > unit.scope_depth => {
                    unit.locals.pop();
                    pops += 1;
                }
                _ => break,
            }
        }
        for _ in 0..pops {
            self.emit_opcode(Opcode::Pop);
        }
    }

    fn declare_local(&mut self, name: &str) {
        let unit = self.units.last().expect("no active compile unit");
        let mut duplicate = false;
        for local in unit.locals.iter().rev() {
            if matches!(local.depth, Some(depth) if depth < unit.scope_depth) {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error(&format!(
                "a variable named '{}' already exists in this scope",
                name
            ));
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &str) {
        if self.unit().locals.len() >= LOCALS_MAX {
            self.error("too many local variables in function");
            return;
        }
        self.unit_mut().locals.push(Local {
            name: name.to_string(),
            depth: None,
        });
    }

    fn mark_initialized(&mut self) {
        let unit = self.units.last_mut().expect("no active compile unit");
        if unit.scope_depth == 0 {
            return;
        }
        if let Some(local) = unit.locals.last_mut() {
            local.depth = Some(unit.scope_depth);
        }
    }

    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        let unit = self.units.last().expect("no active compile unit");
        let mut found = None;
        for (slot, local) in unit.locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((slot, local.depth.is_none()));
                break;
            }
        }
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("cannot read a local variable in its own initializer");
        }
        Some(slot as u8)
    }

    // Expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous().kind).prefix else {
            self.error("expected an expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current_kind()).precedence {
            self.advance();
            let infix = rule(self.previous().kind).infix;
            if let Some(infix) = infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn number(&mut self, _can_assign: bool) {
        let literal = self.previous().literal.clone();
        match literal {
            Literal::Integer(value) => self.emit_constant(Value::Integer(value)),
            Literal::Float(value) => self.emit_constant(Value::Float(value)),
            _ => self.error("expected a number literal"),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let literal = self.previous().literal.clone();
        let Literal::Str(text) = literal else {
            self.error("expected a string literal");
            return;
        };
        let index = self.string_constant(&text);
        self.emit_indexed(Opcode::Constant, Opcode::ConstantLong, index);
    }

    fn literal(&mut self, _can_assign: bool) {
        let kind = self.previous().kind;
        match kind {
            TokenKind::True => self.emit_opcode(Opcode::True),
            TokenKind::False => self.emit_opcode(Opcode::False),
            TokenKind::Nil => self.emit_opcode(Opcode::Nil),
            TokenKind::Inf => self.emit_opcode(Opcode::Inf),
            TokenKind::Nan => self.emit_opcode(Opcode::Nan),
            _ => self.error("expected a literal"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous().lexeme(self.source).to_string();
        if let Some(slot) = self.resolve_local(&name) {
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_opcode(Opcode::SetLocal);
                self.emit_byte(slot);
            } else {
                self.emit_opcode(Opcode::GetLocal);
                self.emit_byte(slot);
            }
        } else {
            let index = self.string_constant(&name);
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_indexed(Opcode::SetGlobal, Opcode::SetGlobalLong, index);
            } else {
                self.emit_indexed(Opcode::GetGlobal, Opcode::GetGlobalLong, index);
            }
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous().kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_opcode(Opcode::Negate),
            TokenKind::Bang => self.emit_opcode(Opcode::Not),
            TokenKind::Tilde => self.emit_opcode(Opcode::BitNot),
            _ => self.error("expected a unary operator"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        use TokenKind::*;
        let operator = self.previous().kind;
        let precedence = rule(operator).precedence;
        // '**' is right-associative, everything else binds left.
        let right = if operator == StarStar {
            precedence
        } else {
            precedence.next()
        };
        self.parse_precedence(right);

        match operator {
            Plus => self.emit_opcode(Opcode::Add),
            Minus => self.emit_opcode(Opcode::Subtract),
            Star => self.emit_opcode(Opcode::Multiply),
            Slash => self.emit_opcode(Opcode::Divide),
            Percent => self.emit_opcode(Opcode::Modulo),
            StarStar => self.emit_opcode(Opcode::Pow),
            EqualEqual => self.emit_opcode(Opcode::Equal),
            BangEqual => self.emit_opcode(Opcode::NotEqual),
            Less => self.emit_opcode(Opcode::Less),
            LessEqual => self.emit_opcode(Opcode::LessEqual),
            Greater => self.emit_opcode(Opcode::Greater),
            GreaterEqual => self.emit_opcode(Opcode::GreaterEqual),
            Ampersand => self.emit_opcode(Opcode::BitAnd),
            Pipe => self.emit_opcode(Opcode::BitOr),
            Caret => self.emit_opcode(Opcode::BitXor),
            ShiftLeft => self.emit_opcode(Opcode::ShiftLeft),
            ShiftRight => self.emit_opcode(Opcode::ShiftRight),
            _ => self.error("expected a binary operator"),
        }
    }

    fn and_operator(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_operator(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_opcode(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_opcode(Opcode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == ARGS_MAX {
                    self.error("a call cannot take more than 255 arguments");
                } else {
                    count += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        count.min(ARGS_MAX) as u8
    }
}
