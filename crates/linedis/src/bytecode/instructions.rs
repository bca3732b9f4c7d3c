//! Decoding of wordcode back into instruction records, the equivalent of `dis.get_instructions`.

use std::collections::BTreeMap;

use super::{
    code::{CodeObject, Constant},
    op::{
        ArgKind, BINARY_OPS, COMPARE_OPS, FORMAT_VALUE_CONVERTERS, FORMAT_VALUE_WITH_SPEC, INTRINSICS,
        JumpDirection, MAKE_FUNCTION_FLAGS, Opcode,
    },
};

/// Resolved operand of an instruction.
#[derive(Debug, Clone)]
pub enum ArgValue<'a> {
    /// The opcode takes no argument.
    None,
    Const(&'a Constant),
    /// A global, attribute, local, cell, or free variable name.
    Name(&'a str),
    /// Byte offset of the jump target.
    Jump(u32),
    /// Symbol of a binary, comparison, identity or membership operator.
    Operator(&'static str),
    /// Raw integer: counts, flags, depths.
    Int(u32),
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction<'a> {
    pub opcode: Opcode,
    /// `dis` name of the opcode.
    pub opname: &'static str,
    /// Full argument with `EXTENDED_ARG` prefixes folded in, `None` below `HAVE_ARGUMENT`.
    pub arg: Option<u32>,
    pub argval: ArgValue<'a>,
    /// Human-readable operand, possibly empty.
    pub argrepr: String,
    /// Byte offset in the bytecode.
    pub offset: u32,
    pub line: Option<u32>,
    /// First instruction of a run attributed to a new line.
    pub starts_line: bool,
}

/// Instructions grouped by the source line the line table attributes them to.
pub type LineInstructionMap<'a> = BTreeMap<u32, Vec<Instruction<'a>>>;

/// Lazy iterator over the instructions of a code object, in offset order.
///
/// Cloning the iterator restarts from the clone point.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    code: &'a CodeObject,
    offset: usize,
    extended_arg: u32,
    entry: usize,
    last_line: Option<u32>,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytecode = &self.code.bytecode;
        let [op, byte] = *bytecode.get(self.offset..self.offset + 2)? else {
            return None;
        };
        let opcode = Opcode::try_from(op).ok()?;
        let offset = u32::try_from(self.offset).ok()?;
        let full_arg = self.extended_arg << 8 | u32::from(byte);
        self.extended_arg = if opcode == Opcode::ExtendedArg { full_arg } else { 0 };

        let line_table = &self.code.line_table;
        while line_table.get(self.entry).is_some_and(|e| e.end <= offset) {
            self.entry += 1;
        }
        let entry = line_table.get(self.entry);
        let line = entry.and_then(|e| e.line);
        let mut starts_line = false;
        if entry.is_some_and(|e| e.start == offset) && line.is_some() && line != self.last_line {
            starts_line = true;
            self.last_line = line;
        }

        let arg = opcode.has_arg().then_some(full_arg);
        let (argval, argrepr) = match arg {
            Some(arg) => resolve_arg(self.code, opcode, arg, offset),
            None => (ArgValue::None, String::new()),
        };
        self.offset += 2;
        Some(Instruction {
            opcode,
            opname: opcode.name(),
            arg,
            argval,
            argrepr,
            offset,
            line,
            starts_line,
        })
    }
}

/// Resolves an argument to its value and `dis`-style text.
fn resolve_arg(code: &CodeObject, opcode: Opcode, arg: u32, offset: u32) -> (ArgValue<'_>, String) {
    let index = arg as usize;
    match opcode.arg_kind() {
        ArgKind::None => (ArgValue::None, String::new()),
        ArgKind::Const => match code.consts.get(index) {
            Some(constant) => (ArgValue::Const(constant), constant.to_string()),
            None => (ArgValue::Int(arg), String::new()),
        },
        ArgKind::Name => {
            let (name_index, prefix) = match opcode {
                Opcode::LoadGlobal => (index >> 1, (arg & 1 == 1).then_some("NULL + ")),
                Opcode::LoadAttr => (index >> 1, (arg & 1 == 1).then_some("NULL|self + ")),
                _ => (index, None),
            };
            match code.names.get(name_index) {
                Some(name) => (ArgValue::Name(name), format!("{}{name}", prefix.unwrap_or_default())),
                None => (ArgValue::Int(arg), String::new()),
            }
        }
        ArgKind::Local => match code.varnames.get(index) {
            Some(name) => (ArgValue::Name(name), name.clone()),
            None => (ArgValue::Int(arg), String::new()),
        },
        ArgKind::Free => match code.deref_name(arg) {
            Some(name) => (ArgValue::Name(name), name.to_owned()),
            None => (ArgValue::Int(arg), String::new()),
        },
        ArgKind::Jump(direction) => {
            let after = offset + 2;
            let target = match direction {
                JumpDirection::Forward => after + arg * 2,
                JumpDirection::Backward => after.saturating_sub(arg * 2),
            };
            (ArgValue::Jump(target), format!("to {target}"))
        }
        ArgKind::Operator => {
            let symbol = match opcode {
                Opcode::BinaryOp => BINARY_OPS.get(index).copied(),
                Opcode::CompareOp => COMPARE_OPS.get(index >> 4).copied(),
                Opcode::IsOp => Some(if arg == 0 { "is" } else { "is not" }),
                Opcode::ContainsOp => Some(if arg == 0 { "in" } else { "not in" }),
                _ => None,
            };
            match symbol {
                Some(symbol) => (ArgValue::Operator(symbol), symbol.to_owned()),
                None => (ArgValue::Int(arg), String::new()),
            }
        }
        ArgKind::Int => (ArgValue::Int(arg), int_argrepr(opcode, arg)),
    }
}

fn int_argrepr(opcode: Opcode, arg: u32) -> String {
    match opcode {
        Opcode::FormatValue => {
            let mut repr = FORMAT_VALUE_CONVERTERS[(arg & 0x3) as usize].to_owned();
            if arg & FORMAT_VALUE_WITH_SPEC != 0 {
                if !repr.is_empty() {
                    repr.push_str(", ");
                }
                repr.push_str("with format");
            }
            repr
        }
        Opcode::MakeFunction => MAKE_FUNCTION_FLAGS
            .iter()
            .enumerate()
            .filter(|(bit, _)| arg & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(", "),
        Opcode::CallIntrinsic1 => INTRINSICS.get(arg as usize).copied().unwrap_or_default().to_owned(),
        _ => String::new(),
    }
}

impl CodeObject {
    /// Decodes the bytecode into instructions, in offset order.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            code: self,
            offset: 0,
            extended_arg: 0,
            entry: 0,
            last_line: None,
        }
    }

    /// The first instruction of each run of instructions attributed to a new line.
    pub fn line_starts(&self) -> impl Iterator<Item = Instruction<'_>> {
        self.instructions().filter(|i| i.starts_line)
    }

    /// Groups every instruction that has a line by that line.
    #[must_use]
    pub fn instructions_by_line(&self) -> LineInstructionMap<'_> {
        let mut map = LineInstructionMap::new();
        for instruction in self.instructions() {
            if let Some(line) = instruction.line {
                map.entry(line).or_default().push(instruction);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::{CodeBuilder, CodeInfo};

    fn code(build: impl FnOnce(&mut CodeBuilder)) -> CodeObject {
        let mut builder = CodeBuilder::new();
        build(&mut builder);
        builder.build(CodeInfo {
            name: "<module>".to_owned(),
            qualname: "<module>".to_owned(),
            filename: "<script>".to_owned(),
            first_line: 1,
            ..CodeInfo::default()
        })
    }

    #[test]
    fn decodes_names_constants_and_lines() {
        let code = code(|b| {
            b.emit_arg(Opcode::Resume, 0);
            b.set_location(Some(1));
            let one = b.add_const(Constant::Int(1));
            b.emit_arg(Opcode::LoadConst, one);
            let x = b.add_name("x");
            b.emit_arg(Opcode::StoreName, x);
            let none = b.add_const(Constant::None);
            b.emit_arg(Opcode::ReturnConst, none);
        });
        let decoded: Vec<_> = code
            .instructions()
            .map(|i| (i.opname, i.arg, i.argrepr, i.offset, i.line, i.starts_line))
            .collect();
        assert_eq!(
            decoded,
            vec![
                ("RESUME", Some(0), String::new(), 0, None, false),
                ("LOAD_CONST", Some(0), "1".to_owned(), 2, Some(1), true),
                ("STORE_NAME", Some(0), "x".to_owned(), 4, Some(1), false),
                ("RETURN_CONST", Some(1), "None".to_owned(), 6, Some(1), false),
            ]
        );
    }

    #[test]
    fn extended_arg_is_folded_into_the_next_instruction() {
        let code = code(|b| {
            for i in 0..=256 {
                b.add_const(Constant::Int(i));
            }
            b.emit_arg(Opcode::LoadConst, 256);
        });
        let decoded: Vec<_> = code.instructions().collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].opname, "EXTENDED_ARG");
        assert_eq!(decoded[0].arg, Some(1));
        assert_eq!(decoded[1].arg, Some(256));
        assert_eq!(decoded[1].argrepr, "256");
    }

    #[test]
    fn operand_text_follows_dis() {
        let code = code(|b| {
            let print = b.add_name("print");
            b.emit_arg(Opcode::LoadGlobal, print << 1 | 1);
            b.emit_arg(Opcode::CompareOp, 2 << 4 | 8);
            b.emit_arg(Opcode::BinaryOp, 13);
            b.emit_arg(Opcode::IsOp, 1);
            b.emit_arg(Opcode::FormatValue, 2 | FORMAT_VALUE_WITH_SPEC);
            b.emit_arg(Opcode::MakeFunction, 0x9);
            b.emit_arg(Opcode::CallIntrinsic1, 6);
        });
        let reprs: Vec<String> = code.instructions().map(|i| i.argrepr).collect();
        assert_eq!(
            reprs,
            vec![
                "NULL + print",
                "==",
                "+=",
                "is not",
                "repr, with format",
                "defaults, closure",
                "INTRINSIC_LIST_TO_TUPLE",
            ]
        );
    }

    #[test]
    fn jump_targets_are_byte_offsets() {
        let code = code(|b| {
            let start = b.current_position();
            let jump = b.emit_jump(Opcode::PopJumpIfTrue);
            b.emit_jump_to(Opcode::JumpBackward, start);
            b.patch_jump(jump);
            b.emit_arg(Opcode::ReturnConst, 0);
        });
        let reprs: Vec<String> = code.instructions().map(|i| i.argrepr).collect();
        assert_eq!(reprs[0], "to 4");
        assert_eq!(reprs[1], "to 0");
    }

    #[test]
    fn instructions_iterator_is_restartable() {
        let code = code(|b| {
            b.set_location(Some(3));
            b.emit(Opcode::PushNull);
            b.emit(Opcode::PopTop);
        });
        let mut iter = code.instructions();
        let restart = iter.clone();
        assert_eq!(iter.by_ref().count(), 2);
        assert_eq!(restart.count(), 2);
        assert_eq!(code.instructions_by_line()[&3].len(), 2);
        assert_eq!(code.line_starts().count(), 1);
    }
}
