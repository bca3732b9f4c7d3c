//! Code builder: collects instructions during compilation and assembles them into wordcode.
//!
//! Instructions are kept symbolic until `build`: jump arguments are resolved from instruction
//! indices, `EXTENDED_ARG` prefixes are inserted where arguments need more than 8 bits, and
//! cell/free variable indices are mapped onto the final local layout.

use indexmap::IndexSet;

use super::{
    code::{CodeObject, Constant, LineEntry},
    op::{ArgKind, JumpDirection, Opcode},
};

/// A forward jump whose target is not known yet; resolved by `CodeBuilder::patch_jump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a forward jump must be patched"]
pub struct JumpLabel(usize);

/// Position of an instruction, used as the target of backward jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position(usize);

#[derive(Debug)]
struct PendingInstruction {
    opcode: Opcode,
    arg: u32,
    /// Target instruction index for jumps.
    target: Option<usize>,
    line: Option<u32>,
}

/// Identity and signature of the unit being built, copied into the `CodeObject`.
#[derive(Debug, Default)]
pub struct CodeInfo {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub first_line: u32,
    pub arg_count: u32,
    pub posonly_arg_count: u32,
    pub kwonly_arg_count: u32,
    pub is_generator: bool,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
}

/// Builder for one code object.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    instructions: Vec<PendingInstruction>,
    current_line: Option<u32>,
    consts: Vec<Constant>,
    names: IndexSet<String>,
    varnames: IndexSet<String>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line attributed to subsequently emitted instructions.
    pub fn set_location(&mut self, line: Option<u32>) {
        self.current_line = line;
    }

    pub fn location(&self) -> Option<u32> {
        self.current_line
    }

    /// Emits an instruction without argument.
    pub fn emit(&mut self, opcode: Opcode) {
        debug_assert!(!opcode.has_arg(), "{opcode:?} takes an argument");
        self.push(opcode, 0, None);
    }

    /// Emits an instruction with an argument.
    pub fn emit_arg(&mut self, opcode: Opcode, arg: u32) {
        debug_assert!(opcode.has_arg() && !opcode.is_jump(), "{opcode:?} is not a plain argument opcode");
        self.push(opcode, arg, None);
    }

    /// Emits a forward jump to be patched once the target is reached.
    pub fn emit_jump(&mut self, opcode: Opcode) -> JumpLabel {
        debug_assert!(matches!(opcode.arg_kind(), ArgKind::Jump(JumpDirection::Forward)));
        self.push(opcode, 0, Some(usize::MAX));
        JumpLabel(self.instructions.len() - 1)
    }

    /// Points a forward jump at the next instruction to be emitted.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.instructions.len();
        self.instructions[label.0].target = Some(target);
    }

    /// Emits a jump to an already emitted position.
    pub fn emit_jump_to(&mut self, opcode: Opcode, target: Position) {
        self.push(opcode, 0, Some(target.0));
    }

    /// Position of the next instruction to be emitted.
    pub fn current_position(&self) -> Position {
        Position(self.instructions.len())
    }

    /// Whether the next instruction to be emitted can be reached: either the previous one falls
    /// through or a jump already targets this position.
    pub fn is_reachable(&self) -> bool {
        let here = self.instructions.len();
        match self.instructions.last() {
            Some(last) if last.opcode.is_terminator() => self.instructions.iter().any(|i| i.target == Some(here)),
            _ => true,
        }
    }

    fn push(&mut self, opcode: Opcode, arg: u32, target: Option<usize>) {
        self.instructions.push(PendingInstruction {
            opcode,
            arg,
            target,
            line: self.current_line,
        });
    }

    /// Adds a constant to the pool, reusing an identical entry, and returns its index.
    pub fn add_const(&mut self, constant: Constant) -> u32 {
        let index = match self.consts.iter().position(|c| c.same_as(&constant)) {
            Some(index) => index,
            None => {
                self.consts.push(constant);
                self.consts.len() - 1
            }
        };
        to_arg(index)
    }

    pub fn add_name(&mut self, name: &str) -> u32 {
        to_arg(insert_full(&mut self.names, name))
    }

    pub fn add_varname(&mut self, name: &str) -> u32 {
        to_arg(insert_full(&mut self.varnames, name))
    }

    /// Slot of a local that is already registered.
    pub fn varname_index(&self, name: &str) -> Option<u32> {
        self.varnames.get_index_of(name).map(to_arg)
    }

    /// Assembles the instructions into a `CodeObject`.
    pub fn build(self, info: CodeInfo) -> CodeObject {
        let CodeBuilder {
            instructions,
            consts,
            names,
            varnames,
            ..
        } = self;

        let instructions = remove_redundant_nops(instructions);
        let mut instructions = duplicate_exits_without_line(instructions);
        inline_return_jumps(&mut instructions);

        // cell and free variable arguments are emitted as indices into `cellvars ++ freevars`
        let deref_slots = deref_slots(&varnames, &info.cellvars, info.freevars.len());
        for instruction in &mut instructions {
            if instruction.opcode.arg_kind() == ArgKind::Free {
                instruction.arg = deref_slots[instruction.arg as usize];
            }
        }

        let sizes = resolve_jumps(&mut instructions);

        let mut bytecode = Vec::with_capacity(sizes.iter().sum::<usize>() * 2);
        let mut line_table: Vec<LineEntry> = Vec::new();
        for (instruction, &size) in instructions.iter().zip(&sizes) {
            let start = to_arg(bytecode.len());
            let arg = instruction.arg.to_le_bytes();
            for &high in arg[1..size].iter().rev() {
                bytecode.extend([Opcode::ExtendedArg as u8, high]);
            }
            bytecode.extend([instruction.opcode as u8, arg[0]]);
            let end = to_arg(bytecode.len());
            match line_table.last_mut() {
                Some(entry) if entry.line == instruction.line => entry.end = end,
                _ => line_table.push(LineEntry {
                    start,
                    end,
                    line: instruction.line,
                }),
            }
        }

        tracing::trace!(
            name = %info.qualname,
            instructions = instructions.len(),
            bytes = bytecode.len(),
            "assembled code object"
        );

        CodeObject {
            name: info.name,
            qualname: info.qualname,
            filename: info.filename,
            first_line: info.first_line,
            arg_count: info.arg_count,
            posonly_arg_count: info.posonly_arg_count,
            kwonly_arg_count: info.kwonly_arg_count,
            is_generator: info.is_generator,
            bytecode,
            consts,
            names: names.into_iter().collect(),
            varnames: varnames.into_iter().collect(),
            cellvars: info.cellvars,
            freevars: info.freevars,
            line_table,
        }
    }
}

/// Drops `NOP`s that carry no line information of their own.
///
/// A `NOP` survives only when it is the sole instruction marking its line: its neighbours are on
/// other lines. Jumps to a dropped `NOP` are moved to the instruction after it.
fn remove_redundant_nops(instructions: Vec<PendingInstruction>) -> Vec<PendingInstruction> {
    let mut keep = Vec::with_capacity(instructions.len());
    let mut prev_line = None;
    for (index, instruction) in instructions.iter().enumerate() {
        let kept = instruction.opcode != Opcode::Nop
            || instruction.line.is_some_and(|line| {
                prev_line != Some(Some(line))
                    && instructions.get(index + 1).is_none_or(|next| next.line != Some(line))
            });
        if kept {
            prev_line = Some(instruction.line);
        }
        keep.push(kept);
    }

    // new_index[i] is the position of instruction i, or of the first kept one after it
    let mut new_index = Vec::with_capacity(instructions.len() + 1);
    let mut next = 0;
    for &kept in &keep {
        new_index.push(next);
        next += usize::from(kept);
    }
    new_index.push(next);

    instructions
        .into_iter()
        .zip(keep)
        .filter_map(|(mut instruction, kept)| {
            kept.then(|| {
                instruction.target = instruction.target.map(|t| new_index[t.min(new_index.len() - 1)]);
                instruction
            })
        })
        .collect()
}

/// Gives every path into a line-less `RETURN_CONST` its own copy carrying the line of that path.
///
/// An unconditional jump becomes the return itself, a conditional jump gets a copy placed right
/// after the original, and the fall-through path keeps the original with the line of the
/// instruction before it. An original left with no path into it is dropped.
fn duplicate_exits_without_line(instructions: Vec<PendingInstruction>) -> Vec<PendingInstruction> {
    let is_exit = |i: &PendingInstruction| i.opcode == Opcode::ReturnConst && i.line.is_none();
    let mut copies: Vec<Vec<usize>> = vec![Vec::new(); instructions.len()];
    let mut instructions = instructions;
    for index in 0..instructions.len() {
        let Some(target) = instructions[index].target else {
            continue;
        };
        let Some(exit) = instructions.get(target).filter(|t| is_exit(t)) else {
            continue;
        };
        let arg = exit.arg;
        if instructions[index].opcode == Opcode::JumpForward {
            let jump = &mut instructions[index];
            jump.opcode = Opcode::ReturnConst;
            jump.arg = arg;
            jump.target = None;
        } else {
            copies[target].push(index);
        }
    }

    let mut new_index = Vec::with_capacity(instructions.len() + 1);
    let mut result: Vec<PendingInstruction> = Vec::with_capacity(instructions.len());
    let mut retargets = Vec::new();
    let mut prev: Option<(Opcode, Option<u32>)> = None;
    for (index, mut instruction) in instructions.into_iter().enumerate() {
        new_index.push(result.len());
        let current = (instruction.opcode, instruction.line);
        if is_exit(&instruction) {
            let exit = (instruction.opcode, instruction.arg);
            if let Some((_, line)) = prev.filter(|(opcode, _)| !opcode.is_terminator()) {
                instruction.line = line;
                result.push(instruction);
            }
            for &jump in &copies[index] {
                retargets.push((jump, result.len()));
                result.push(PendingInstruction {
                    opcode: exit.0,
                    arg: exit.1,
                    target: None,
                    line: None,
                });
            }
        } else {
            result.push(instruction);
        }
        prev = Some(current);
    }
    new_index.push(result.len());

    for instruction in &mut result {
        instruction.target = instruction.target.map(|t| new_index[t.min(new_index.len() - 1)]);
    }
    for (jump, copy) in retargets {
        let jump = new_index[jump];
        result[copy].line = result[jump].line;
        result[jump].target = Some(copy);
    }
    result
}

/// Replaces an unconditional forward jump to a `RETURN_CONST` with a copy of that return.
fn inline_return_jumps(instructions: &mut [PendingInstruction]) {
    for index in 0..instructions.len() {
        if instructions[index].opcode != Opcode::JumpForward {
            continue;
        }
        let Some(target) = instructions[index].target.and_then(|t| instructions.get(t)) else {
            continue;
        };
        if target.opcode == Opcode::ReturnConst {
            let arg = target.arg;
            let jump = &mut instructions[index];
            jump.opcode = Opcode::ReturnConst;
            jump.arg = arg;
            jump.target = None;
        }
    }
}

/// Resolves jump arguments, returning the size in code units of every instruction.
///
/// Sizes start at one unit and only ever grow, so the loop reaches a fixpoint: once no jump
/// needs an extra `EXTENDED_ARG`, every offset is final.
fn resolve_jumps(instructions: &mut [PendingInstruction]) -> Vec<usize> {
    let mut sizes: Vec<usize> = instructions.iter().map(|i| arg_units(i.arg)).collect();
    loop {
        let mut offsets = Vec::with_capacity(instructions.len() + 1);
        let mut offset = 0;
        for size in &sizes {
            offsets.push(offset);
            offset += size;
        }
        offsets.push(offset);

        let mut changed = false;
        for (index, instruction) in instructions.iter_mut().enumerate() {
            let Some(target) = instruction.target else {
                continue;
            };
            let after = offsets[index] + sizes[index];
            let target = offsets[target.min(offsets.len() - 1)];
            let distance = match instruction.opcode.arg_kind() {
                ArgKind::Jump(JumpDirection::Backward) => after - target,
                _ => target - after,
            };
            instruction.arg = to_arg(distance);
            let needed = arg_units(instruction.arg);
            if needed > sizes[index] {
                sizes[index] = needed;
                changed = true;
            }
        }
        if !changed {
            return sizes;
        }
    }
}

/// Code units needed for an argument: the instruction plus its `EXTENDED_ARG` prefixes.
fn arg_units(arg: u32) -> usize {
    match arg {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

/// Maps each index of `cellvars ++ freevars` to its slot in the frame layout.
fn deref_slots(varnames: &IndexSet<String>, cellvars: &[String], free_count: usize) -> Vec<u32> {
    let mut next = varnames.len();
    let mut slots = Vec::with_capacity(cellvars.len() + free_count);
    for cell in cellvars {
        match varnames.get_index_of(cell) {
            Some(index) => slots.push(to_arg(index)),
            None => {
                slots.push(to_arg(next));
                next += 1;
            }
        }
    }
    slots.extend((next..next + free_count).map(to_arg));
    slots
}

fn insert_full(set: &mut IndexSet<String>, name: &str) -> usize {
    match set.get_index_of(name) {
        Some(index) => index,
        None => set.insert_full(name.to_owned()).0,
    }
}

fn to_arg(index: usize) -> u32 {
    u32::try_from(index).expect("bytecode index exceeds u32::MAX")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> CodeInfo {
        CodeInfo {
            name: "<module>".to_owned(),
            qualname: "<module>".to_owned(),
            filename: "<script>".to_owned(),
            first_line: 1,
            ..CodeInfo::default()
        }
    }

    #[test]
    fn constants_are_deduplicated_strictly() {
        let mut builder = CodeBuilder::new();
        assert_eq!(builder.add_const(Constant::Int(1)), 0);
        assert_eq!(builder.add_const(Constant::Bool(true)), 1);
        assert_eq!(builder.add_const(Constant::Float(1.0)), 2);
        assert_eq!(builder.add_const(Constant::Int(1)), 0);
        assert_eq!(builder.add_const(Constant::Float(-0.0)), 3);
    }

    #[test]
    fn line_table_merges_runs() {
        let mut builder = CodeBuilder::new();
        builder.emit_arg(Opcode::Resume, 0);
        builder.set_location(Some(1));
        builder.emit_arg(Opcode::LoadConst, 0);
        builder.emit_arg(Opcode::StoreName, 0);
        builder.set_location(Some(2));
        builder.emit_arg(Opcode::ReturnConst, 0);
        let code = builder.build(info());
        assert_eq!(
            code.line_table(),
            &[
                LineEntry { start: 0, end: 2, line: None },
                LineEntry { start: 2, end: 6, line: Some(1) },
                LineEntry { start: 6, end: 8, line: Some(2) },
            ]
        );
    }

    #[test]
    fn wide_arguments_get_extended_arg_prefixes() {
        let mut builder = CodeBuilder::new();
        builder.emit_arg(Opcode::LoadConst, 0x1234);
        let code = builder.build(info());
        assert_eq!(
            code.bytecode(),
            &[Opcode::ExtendedArg as u8, 0x12, Opcode::LoadConst as u8, 0x34]
        );
    }

    #[test]
    fn forward_and_backward_jumps_are_relative() {
        let mut builder = CodeBuilder::new();
        let start = builder.current_position();
        builder.emit(Opcode::PopTop);
        let jump = builder.emit_jump(Opcode::PopJumpIfFalse);
        builder.emit_jump_to(Opcode::JumpBackward, start);
        builder.patch_jump(jump);
        builder.emit_arg(Opcode::ReturnConst, 0);
        let code = builder.build(info());
        let bytes = code.bytecode();
        // POP_JUMP_IF_FALSE skips the one-unit JUMP_BACKWARD
        assert_eq!(&bytes[2..4], &[Opcode::PopJumpIfFalse as u8, 1]);
        // JUMP_BACKWARD lands on offset 0 from offset 6
        assert_eq!(&bytes[4..6], &[Opcode::JumpBackward as u8, 3]);
    }

    #[test]
    fn long_jumps_reach_a_fixpoint() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::JumpForward);
        for _ in 0..300 {
            builder.emit(Opcode::PopTop);
        }
        builder.patch_jump(jump);
        builder.emit(Opcode::ReturnValue);
        let code = builder.build(info());
        let bytes = code.bytecode();
        assert_eq!(&bytes[..4], &[Opcode::ExtendedArg as u8, 1, Opcode::JumpForward as u8, 44]);
        assert_eq!(bytes.len(), 2 * (2 + 300 + 1));
    }

    #[test]
    fn nops_survive_only_as_line_markers() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::Nop);
        builder.set_location(Some(1));
        builder.emit(Opcode::Nop);
        builder.set_location(Some(2));
        builder.emit(Opcode::Nop);
        builder.emit(Opcode::PopTop);
        let code = builder.build(info());
        assert_eq!(code.bytecode(), &[Opcode::Nop as u8, 0, Opcode::PopTop as u8, 0]);
        assert_eq!(code.line_table()[0].line, Some(1));
    }

    #[test]
    fn jumps_to_a_removed_nop_land_on_the_next_instruction() {
        let mut builder = CodeBuilder::new();
        builder.set_location(Some(1));
        let jump = builder.emit_jump(Opcode::PopJumpIfTrue);
        builder.emit(Opcode::PopTop);
        builder.patch_jump(jump);
        builder.emit(Opcode::Nop);
        builder.emit(Opcode::ReturnValue);
        let code = builder.build(info());
        assert_eq!(
            code.bytecode(),
            &[Opcode::PopJumpIfTrue as u8, 1, Opcode::PopTop as u8, 0, Opcode::ReturnValue as u8, 0]
        );
    }

    #[test]
    fn jumps_to_return_const_are_inlined() {
        let mut builder = CodeBuilder::new();
        builder.set_location(Some(1));
        let jump = builder.emit_jump(Opcode::JumpForward);
        builder.set_location(Some(2));
        builder.emit(Opcode::PopTop);
        builder.patch_jump(jump);
        builder.emit_arg(Opcode::ReturnConst, 0);
        let code = builder.build(info());
        assert_eq!(&code.bytecode()[..2], &[Opcode::ReturnConst as u8, 0]);
        assert_eq!(code.line_table()[0].line, Some(1));
    }

    #[test]
    fn line_less_exits_are_duplicated_per_path() {
        let mut builder = CodeBuilder::new();
        builder.set_location(Some(1));
        let jump = builder.emit_jump(Opcode::PopJumpIfFalse);
        builder.set_location(Some(2));
        builder.emit(Opcode::PopTop);
        builder.patch_jump(jump);
        builder.set_location(None);
        builder.emit_arg(Opcode::ReturnConst, 0);
        let code = builder.build(info());
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::PopJumpIfFalse as u8,
                2,
                Opcode::PopTop as u8,
                0,
                Opcode::ReturnConst as u8,
                0,
                Opcode::ReturnConst as u8,
                0,
            ]
        );
        let lines: Vec<_> = code.line_table().iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![Some(1), Some(2), Some(1)]);
    }

    #[test]
    fn unreached_line_less_exit_is_dropped() {
        let mut builder = CodeBuilder::new();
        builder.set_location(Some(1));
        let jump = builder.emit_jump(Opcode::JumpForward);
        builder.set_location(Some(2));
        builder.emit(Opcode::PopTop);
        builder.emit_arg(Opcode::ReturnConst, 0);
        builder.patch_jump(jump);
        builder.set_location(None);
        builder.emit_arg(Opcode::ReturnConst, 0);
        let code = builder.build(info());
        assert_eq!(code.bytecode().len(), 6);
        assert_eq!(code.line_table()[0].line, Some(1));
    }

    #[test]
    fn reachability_follows_terminators_and_jumps() {
        let mut builder = CodeBuilder::new();
        assert!(builder.is_reachable());
        let jump = builder.emit_jump(Opcode::PopJumpIfFalse);
        builder.emit_arg(Opcode::ReturnConst, 0);
        assert!(!builder.is_reachable());
        builder.patch_jump(jump);
        assert!(builder.is_reachable());
    }

    #[test]
    fn deref_slots_follow_locals() {
        let mut varnames = IndexSet::new();
        varnames.insert("a".to_owned());
        varnames.insert("b".to_owned());
        let cells = vec!["a".to_owned(), "c".to_owned()];
        assert_eq!(deref_slots(&varnames, &cells, 1), vec![0, 2, 3]);
    }
}
