//! Report generation: the line mapping of the module followed by the instructions of every unit
//! defined at its top level.

mod describe;
mod functions;
mod mapping;

use std::{
    fmt::{self, Write},
    path::Path,
};

pub use describe::{OperandCategory, describe_argument, describe_operand};
pub use functions::{FunctionLine, function_lines};

use crate::{bytecode::compile, error::ReportError, source::SourceFile};

/// File name the source is compiled under; it shows up in code object descriptions.
pub const SCRIPT_NAME: &str = "<script>";

/// Width of the rules around the mapping table and the function section header.
const RULE_WIDTH: usize = 120;

/// How the rows of each function's table are formed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FunctionDetailMode {
    /// Line-table entries and instructions paired by index.
    #[default]
    Positional,
    /// Instructions grouped under the line they belong to, like the module table.
    Grouped,
}

/// Options controlling the report layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub function_detail: FunctionDetailMode,
}

/// Compiles `source` and renders the full report.
///
/// # Errors
/// `ReportError::Compile` when the source does not compile.
pub fn render_report(source: &SourceFile, options: &ReportOptions) -> Result<String, ReportError> {
    let code = compile(source.text(), SCRIPT_NAME)?;
    let mut out = String::new();
    mapping::write_mapping(&mut out, source, &code)?;
    functions::write_function_details(&mut out, source, &code, options.function_detail)?;
    tracing::debug!(
        lines = source.len(),
        nested_units = code.nested_units().count(),
        bytes = out.len(),
        mode = ?options.function_detail,
        "rendered report"
    );
    Ok(out)
}

/// Loads the file at `path` and renders its report.
///
/// # Errors
/// Any error from `SourceFile::load` or `render_report`.
pub fn generate_report(path: impl AsRef<Path>, options: &ReportOptions) -> Result<String, ReportError> {
    let source = SourceFile::load(path)?;
    render_report(&source, options)
}

fn rule(out: &mut impl Write, width: usize) -> fmt::Result {
    writeln!(out, "{}", "-".repeat(width))
}
