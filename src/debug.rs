use crate::{memory::Heap, Chunk, Opcode};
use std::fmt::Write;

/// Renders a whole chunk, one instruction per line.
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut text = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = disassemble_instruction(chunk, heap, offset);
        text.push_str(&line);
        text.push('\n');
        offset = next;
    }
    text
}

/// Renders the instruction at `offset`, returning the next offset.
pub fn disassemble_instruction(chunk: &Chunk, heap: &Heap, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        text.push_str("   | ");
    } else {
        let _ = write!(text, "{:4} ", chunk.lines[offset]);
    }

    let Ok(opcode) = Opcode::try_from(chunk.code[offset]) else {
        let _ = write!(text, "<bad opcode {}>", chunk.code[offset]);
        return (text, offset + 1);
    };

    let next = match opcode {
        Opcode::Constant | Opcode::GetGlobal | Opcode::SetGlobal | Opcode::DefineGlobal
        | Opcode::DeleteGlobal => {
            let index = chunk.code[offset + 1] as usize;
            let _ = write!(
                text,
                "{:<16} {:4} '{}'",
                opcode_name(opcode),
                index,
                chunk.constants[index].stringify(heap)
            );
            offset + 2
        }
        Opcode::ConstantLong
        | Opcode::GetGlobalLong
        | Opcode::SetGlobalLong
        | Opcode::DefineGlobalLong
        | Opcode::DeleteGlobalLong => {
            let index = read_u24(&chunk.code, offset + 1);
            let _ = write!(
                text,
                "{:<16} {:4} '{}'",
                opcode_name(opcode),
                index,
                chunk.constants[index].stringify(heap)
            );
            offset + 4
        }
        Opcode::GetLocal | Opcode::SetLocal | Opcode::Call => {
            let operand = chunk.code[offset + 1];
            let _ = write!(text, "{:<16} {:4}", opcode_name(opcode), operand);
            offset + 2
        }
        Opcode::Jump | Opcode::JumpIfFalse => {
            let jump = read_u16(&chunk.code, offset + 1);
            let target = offset + 3 + jump as usize;
            let _ = write!(text, "{:<16} {:4} -> {}", opcode_name(opcode), offset, target);
            offset + 3
        }
        Opcode::Loop => {
            let jump = read_u16(&chunk.code, offset + 1);
            let target = offset + 3 - jump as usize;
            let _ = write!(text, "{:<16} {:4} -> {}", opcode_name(opcode), offset, target);
            offset + 3
        }
        _ => {
            text.push_str(opcode_name(opcode));
            offset + 1
        }
    };
    (text, next)
}

pub fn read_u16(code: &[u8], offset: usize) -> u16 {
    u16::from(code[offset]) | (u16::from(code[offset + 1]) << 8)
}

pub fn read_u24(code: &[u8], offset: usize) -> usize {
    usize::from(code[offset])
        | (usize::from(code[offset + 1]) << 8)
        | (usize::from(code[offset + 2]) << 16)
}

fn opcode_name(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Constant => "CONSTANT",
        Opcode::ConstantLong => "CONSTANT_LONG",
        Opcode::True => "TRUE",
        Opcode::False => "FALSE",
        Opcode::Nil => "NIL",
        Opcode::Inf => "INF",
        Opcode::Nan => "NAN",
        Opcode::Pop => "POP",
        Opcode::GetLocal => "GET_LOCAL",
        Opcode::SetLocal => "SET_LOCAL",
        Opcode::GetGlobal => "GET_GLOBAL",
        Opcode::GetGlobalLong => "GET_GLOBAL_LONG",
        Opcode::SetGlobal => "SET_GLOBAL",
        Opcode::SetGlobalLong => "SET_GLOBAL_LONG",
        Opcode::DefineGlobal => "DEFINE_GLOBAL",
        Opcode::DefineGlobalLong => "DEFINE_GLOBAL_LONG",
        Opcode::DeleteGlobal => "DEL_GLOBAL",
        Opcode::DeleteGlobalLong => "DEL_GLOBAL_LONG",
        Opcode::Equal => "EQUAL",
        Opcode::NotEqual => "NOT_EQUAL",
        Opcode::Less => "LESS",
        Opcode::LessEqual => "LESS_EQUAL",
        Opcode::Greater => "GREATER",
        Opcode::GreaterEqual => "GREATER_EQUAL",
        Opcode::Add => "ADD",
        Opcode::Subtract => "SUBTRACT",
        Opcode::Multiply => "MULTIPLY",
        Opcode::Divide => "DIVIDE",
        Opcode::Modulo => "MODULO",
        Opcode::Pow => "POW",
        Opcode::BitAnd => "BAND",
        Opcode::BitOr => "BOR",
        Opcode::BitXor => "BXOR",
        Opcode::BitNot => "BNOT",
        Opcode::ShiftLeft => "SHL",
        Opcode::ShiftRight => "SHR",
        Opcode::Not => "NOT",
        Opcode::Negate => "NEGATE",
        Opcode::Jump => "JUMP",
        Opcode::JumpIfFalse => "JUMP_IF_FALSE",
        Opcode::Loop => "LOOP",
        Opcode::Call => "CALL",
        Opcode::Return => "RETURN",
        Opcode::Print => "PRINT",
    }
}
