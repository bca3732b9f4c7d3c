#![doc = include_str!("../../../README.md")]

mod bytecode;
mod error;
mod expressions;
mod parse;
mod prepare;
mod repr;
mod report;
mod source;

pub use crate::{
    bytecode::{
        ArgValue, CodeObject, Constant, Instruction, Instructions, LineEntry, LineInstructionMap, Opcode, compile,
    },
    error::{CompileError, CompileErrorKind, ReportError},
    report::{
        FunctionDetailMode, FunctionLine, OperandCategory, ReportOptions, SCRIPT_NAME, describe_argument,
        describe_operand, function_lines, generate_report, render_report,
    },
    source::SourceFile,
};
