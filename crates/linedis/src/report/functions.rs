//! The "Function Bytecode Details" section: one table per unit nested directly in the module.

use std::fmt::{self, Write};

use super::{
    FunctionDetailMode, RULE_WIDTH,
    describe::describe_argument,
    mapping::line_rows,
    rule,
};
use crate::{bytecode::CodeObject, source::SourceFile};

const FUNCTION_RULE_WIDTH: usize = 50;

/// A line-table entry of a nested unit paired with the source text of its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionLine<'s> {
    pub line: u32,
    pub text: &'s str,
}

/// One entry per line-table range that has a line, in table order, dropping lines outside the
/// source.
pub fn function_lines<'s>(source: &'s SourceFile, unit: &CodeObject) -> Vec<FunctionLine<'s>> {
    unit.lines()
        .filter_map(|entry| entry.line)
        .filter_map(|line| source.trimmed_line(line).map(|text| FunctionLine { line, text }))
        .collect()
}

pub(super) fn write_function_details(
    out: &mut impl Write,
    source: &SourceFile,
    code: &CodeObject,
    mode: FunctionDetailMode,
) -> fmt::Result {
    let mut units = code.nested_units().peekable();
    if units.peek().is_none() {
        return Ok(());
    }
    out.write_str("\n\nFunction Bytecode Details:\n")?;
    rule(out, RULE_WIDTH)?;
    for unit in units {
        write!(out, "\nFunction: {}\n", unit.name())?;
        rule(out, FUNCTION_RULE_WIDTH)?;
        let columns = format!("{:<5} {:<50} | {:<30} | {:<30}\n", "Line", "Source Code", "Bytecode", "Description");
        out.write_str(&columns)?;
        rule(out, columns.len())?;
        match mode {
            FunctionDetailMode::Positional => write_positional(out, source, unit)?,
            FunctionDetailMode::Grouped => write_grouped(out, source, unit)?,
        }
    }
    Ok(())
}

/// Pairs the n-th line-table entry with the n-th instruction, stopping at the shorter list.
///
/// The two lists only line up when every entry covers exactly one instruction, so rows can show
/// an instruction against the wrong line. `FunctionDetailMode::Grouped` does not have that flaw.
fn write_positional(out: &mut impl Write, source: &SourceFile, unit: &CodeObject) -> fmt::Result {
    let rows = function_lines(source, unit).into_iter().zip(unit.instructions());
    for (FunctionLine { line, text }, instruction) in rows {
        writeln!(
            out,
            "{line:<5} {text:<50} | {:<30} | {:<30}",
            instruction.opname,
            describe_argument(&instruction)
        )?;
    }
    Ok(())
}

fn write_grouped(out: &mut impl Write, source: &SourceFile, unit: &CodeObject) -> fmt::Result {
    let by_line = unit.instructions_by_line();
    for (line, text, instruction) in line_rows(source, &by_line) {
        writeln!(
            out,
            "{line:<5} {text:<50} | {:<30} | {:<30}",
            instruction.opname,
            describe_argument(instruction)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile;

    fn details(text: &str, mode: FunctionDetailMode) -> String {
        let source = SourceFile::from_text(text);
        let code = compile(source.text(), "<script>").unwrap();
        let mut out = String::new();
        write_function_details(&mut out, &source, &code, mode).unwrap();
        out
    }

    #[test]
    fn no_nested_units_means_no_section() {
        assert_eq!(details("x = 1\n", FunctionDetailMode::Positional), "");
    }

    #[test]
    fn one_header_per_top_level_unit() {
        let out = details(
            "def f():\n    def g():\n        pass\n    return g\nclass C:\n    pass\n",
            FunctionDetailMode::Positional,
        );
        assert!(out.starts_with("\n\nFunction Bytecode Details:\n"));
        assert_eq!(out.matches("\nFunction: ").count(), 2);
        assert!(out.contains("\nFunction: f\n"));
        assert!(out.contains("\nFunction: C\n"));
        assert!(!out.contains("Function: g"));
    }

    #[test]
    fn column_rule_matches_header_length() {
        let out = details("def f():\n    return 1\n", FunctionDetailMode::Positional);
        let lines: Vec<&str> = out.lines().collect();
        let header = lines.iter().position(|l| l.starts_with("Line ")).unwrap();
        assert_eq!(lines[header].len(), 122);
        assert_eq!(lines[header + 1], "-".repeat(123));
    }

    #[test]
    fn positional_rows_pair_entries_with_instructions() {
        let out = details("def f():\n    return 1\n", FunctionDetailMode::Positional);
        let rows: Vec<&str> = out.lines().filter(|l| l.starts_with(['1', '2'])).collect();
        assert_eq!(rows.len(), 2, "{out}");
        assert!(rows[0].starts_with("1     def f():"));
        assert!(rows[0].contains("| RESUME"));
        assert!(rows[1].starts_with("2         return 1"));
        assert!(rows[1].contains(&format!("| {:<30} | (1 -> 1)", "RETURN_CONST")));
    }

    #[test]
    fn grouped_rows_follow_the_line_table() {
        let source = "def f(a):\n    b = a\n    return b\n";
        let out = details(source, FunctionDetailMode::Grouped);
        let rows: Vec<&str> = out.lines().filter(|l| l.starts_with(['1', '2', '3'])).collect();
        let opnames: Vec<(&str, &str)> = rows
            .iter()
            .map(|row| {
                let fields: Vec<&str> = row.split(" | ").collect();
                (&row[..1], fields[1].trim_end())
            })
            .collect();
        assert_eq!(
            opnames,
            vec![
                ("1", "RESUME"),
                ("2", "LOAD_FAST"),
                ("2", "STORE_FAST"),
                ("3", "LOAD_FAST"),
                ("3", "RETURN_VALUE"),
            ]
        );
    }

    #[test]
    fn function_lines_follow_the_line_table() {
        let source = SourceFile::from_text("def f():\n    return 1\n");
        let code = compile(source.text(), "<script>").unwrap();
        let unit = code.nested_units().next().unwrap();
        let lines = function_lines(&source, unit);
        assert_eq!(
            lines,
            vec![
                FunctionLine { line: 1, text: "def f():" },
                FunctionLine { line: 2, text: "    return 1" },
            ]
        );
    }
}
