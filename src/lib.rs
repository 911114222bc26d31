mod chunk;
mod compiler;
mod debug;
mod error;
mod lexer;
mod memory;
mod object;
mod vm;

pub use self::{
    chunk::{Chunk, Opcode},
    compiler::Compiler,
    debug::{disassemble_chunk, disassemble_instruction},
    error::{format_syntax_error, format_traceback_line, report_syntax_error, RuntimeError},
    lexer::{Lexer, Literal, Token, TokenKind},
    memory::{grow_capacity, Heap},
    object::{fnv1a, Function, HeapObject, Value},
    vm::{VirtualMachine, FRAMES_MAX, STACK_MAX},
};
