//! Operand descriptions shown in the report's last column.
//!
//! The top-level mapping chooses its text from the operand category alone, so the choice is one
//! table in `describe_operand` rather than opcode checks spread through the renderers.

use crate::bytecode::{ArgValue, CodeObject, Constant, Instruction};

/// What an instruction's operand refers to, as far as the report cares.
#[derive(Debug, Clone, Copy)]
pub enum OperandCategory<'a> {
    /// A constant that is the code object of a nested unit.
    NestedCode(&'a CodeObject),
    /// Any other constant from the pool.
    Constant(&'a Constant),
    /// Names, jump targets, operators, counts, or no operand at all: the `dis` operand text.
    Other(&'a str),
}

impl<'a> OperandCategory<'a> {
    #[must_use]
    pub fn of(instruction: &'a Instruction<'_>) -> Self {
        match instruction.argval {
            ArgValue::Const(Constant::Code(code)) => Self::NestedCode(code),
            ArgValue::Const(constant) => Self::Constant(constant),
            _ => Self::Other(&instruction.argrepr),
        }
    }
}

/// Description of an instruction in the detailed bytecode mapping: `(<offset> -> <operand>)`.
///
/// Constants render as their Python `repr`, everything else as the `dis` operand text. A nested
/// code object renders like the `repr` of a code object, except that it names `line`, the source
/// line of the row, rather than the unit's first line.
#[must_use]
pub fn describe_operand(instruction: &Instruction<'_>, line: u32) -> String {
    let offset = instruction.offset;
    match OperandCategory::of(instruction) {
        OperandCategory::NestedCode(code) => format!(
            "({offset} -> <code object {} at {:#x}, file \"{}\", line {line}>)",
            code.name(),
            code.address(),
            code.filename()
        ),
        OperandCategory::Constant(constant) => format!("({offset} -> {constant})"),
        OperandCategory::Other(argrepr) => format!("({offset} -> {argrepr})"),
    }
}

/// Description of an instruction in a function's table: `(<arg> -> <argrepr>)`, empty when the
/// opcode takes no argument.
#[must_use]
pub fn describe_argument(instruction: &Instruction<'_>) -> String {
    match instruction.arg {
        Some(arg) => format!("({arg} -> {})", instruction.argrepr),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile;

    /// Category name and mapping description of every `opname` instruction, described at the
    /// line the instruction belongs to.
    fn described(source: &str, opname: &str) -> Vec<(&'static str, String)> {
        let code = compile(source, "<script>").unwrap();
        code.instructions()
            .filter(|i| i.opname == opname)
            .map(|i| {
                let category = match OperandCategory::of(&i) {
                    OperandCategory::NestedCode(_) => "nested code",
                    OperandCategory::Constant(_) => "constant",
                    OperandCategory::Other(_) => "other",
                };
                (category, describe_operand(&i, i.line.unwrap_or_default()))
            })
            .collect()
    }

    #[test]
    fn constants_use_repr() {
        let rows = described("x = 'it''s'\n", "LOAD_CONST");
        assert_eq!(rows, vec![("constant", "(2 -> 'its')".to_owned())]);
        let rows = described("x = \"it's\"\n", "LOAD_CONST");
        assert_eq!(rows[0].1, "(2 -> \"it's\")");
    }

    #[test]
    fn return_constants_are_constants_too() {
        let rows = described("x = 1\n", "RETURN_CONST");
        assert_eq!(rows, vec![("constant", "(6 -> None)".to_owned())]);
    }

    #[test]
    fn nested_code_renders_like_a_code_object() {
        let rows = described("def f():\n    pass\n", "LOAD_CONST");
        let (category, text) = &rows[0];
        assert_eq!(*category, "nested code");
        assert!(text.starts_with("(2 -> <code object f at 0x"), "{text}");
        assert!(text.ends_with(", file \"<script>\", line 1>)"), "{text}");
    }

    #[test]
    fn nested_code_names_the_row_line() {
        // the code object of a decorated function is loaded on the `def` line, after the
        // decorator, while the unit itself starts at the decorator
        let code = compile("@dec\ndef f():\n    pass\n", "<script>").unwrap();
        let load = code
            .instructions()
            .find(|i| matches!(OperandCategory::of(i), OperandCategory::NestedCode(_)))
            .unwrap();
        assert_eq!(load.line, Some(2));
        let text = describe_operand(&load, 2);
        assert!(text.ends_with(", file \"<script>\", line 2>)"), "{text}");
        let ArgValue::Const(Constant::Code(unit)) = load.argval else {
            panic!("expected a code object");
        };
        assert_eq!(unit.first_line(), 1);
        assert!(unit.to_string().ends_with("line 1>"));
        assert!(text.contains(&format!("at {:#x},", unit.address())));
    }

    #[test]
    fn other_operands_use_argrepr() {
        let rows = described("x = 1\n", "STORE_NAME");
        assert_eq!(rows, vec![("other", "(4 -> x)".to_owned())]);
        let rows = described("x = 1\n", "RESUME");
        assert_eq!(rows[0].1, "(0 -> )");
    }

    #[test]
    fn function_table_shows_raw_argument() {
        let code = compile("print(x)\n", "<script>").unwrap();
        let texts: Vec<String> = code.instructions().map(|i| describe_argument(&i)).collect();
        assert_eq!(texts[1], "");
        assert_eq!(texts[2], "(0 -> print)");
        assert_eq!(texts[4], "(1 -> )");
    }
}
