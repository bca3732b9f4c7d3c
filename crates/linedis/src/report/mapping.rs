//! The "Detailed Bytecode Mapping" table of the module's own instructions.

use std::fmt::{self, Write};

use super::{RULE_WIDTH, describe::describe_operand, rule};
use crate::{
    bytecode::{CodeObject, Instruction, LineInstructionMap},
    source::SourceFile,
};

const COLUMNS: &str =
    "Line  Source Code                                        | Bytecode                       | Description";

pub(super) fn write_mapping(out: &mut impl Write, source: &SourceFile, code: &CodeObject) -> fmt::Result {
    out.write_str("Detailed Bytecode Mapping:\n")?;
    rule(out, RULE_WIDTH)?;
    writeln!(out, "{COLUMNS}")?;
    rule(out, RULE_WIDTH)?;
    let by_line = code.instructions_by_line();
    for (line, text, instruction) in line_rows(source, &by_line) {
        writeln!(
            out,
            "{line:<5} {text:<50} | {:<30} | {}",
            instruction.opname,
            describe_operand(instruction, line)
        )?;
    }
    Ok(())
}

/// Every instruction attributed to a source line, in source line order, with that line's text.
///
/// Lines the line table never mentions produce nothing; instructions on lines past the end of the
/// source are dropped.
pub(super) fn line_rows<'s, 'c>(
    source: &'s SourceFile,
    by_line: &'c LineInstructionMap<'c>,
) -> impl Iterator<Item = (u32, &'s str, &'c Instruction<'c>)> {
    source.numbered_lines().flat_map(move |(line, text)| {
        by_line
            .get(&line)
            .into_iter()
            .flatten()
            .map(move |instruction| (line, text, instruction))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile;

    fn mapping(text: &str) -> String {
        let source = SourceFile::from_text(text);
        let code = compile(source.text(), "<script>").unwrap();
        let mut out = String::new();
        write_mapping(&mut out, &source, &code).unwrap();
        out
    }

    #[test]
    fn header_is_fixed() {
        let out = mapping("");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Detailed Bytecode Mapping:");
        assert_eq!(lines[1], "-".repeat(120));
        assert!(lines[2].starts_with("Line  Source Code"));
        assert!(lines[2].ends_with("| Bytecode                       | Description"));
        assert_eq!(lines[3], "-".repeat(120));
    }

    #[test]
    fn rows_repeat_the_source_for_each_instruction() {
        let out = mapping("x = 1\n");
        let rows: Vec<&str> = out.lines().skip(4).collect();
        assert_eq!(
            rows,
            vec![
                format!("1     {:<50} | {:<30} | (2 -> 1)", "x = 1", "LOAD_CONST"),
                format!("1     {:<50} | {:<30} | (4 -> x)", "x = 1", "STORE_NAME"),
                format!("1     {:<50} | {:<30} | (6 -> None)", "x = 1", "RETURN_CONST"),
            ]
        );
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let out = mapping("# comment\n\nx = 1\n");
        assert!(out.lines().skip(4).all(|row| row.starts_with("3 ")));
    }
}
