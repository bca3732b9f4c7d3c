//! Bytecode model: the opcode table, code objects, the compiler producing them and the decoder
//! reading them back.

mod builder;
mod code;
mod compiler;
mod fold;
mod instructions;
mod op;

pub use code::{CodeObject, Constant, LineEntry};
pub use compiler::compile;
pub use instructions::{ArgValue, Instruction, Instructions, LineInstructionMap};
pub use op::Opcode;
