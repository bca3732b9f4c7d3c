//! Opcode definitions for the wordcode instruction set.
//!
//! The instruction set follows CPython 3.12: same opcode names, numbers and operand meanings,
//! but without inline cache entries. Every instruction is one code unit of two bytes, the
//! opcode followed by an 8-bit argument. Arguments wider than 8 bits are built up by
//! `EXTENDED_ARG` prefixes.
//!
//! # Operand Encoding
//!
//! - Opcodes numbered below `HAVE_ARGUMENT` ignore their argument byte (always 0).
//! - `LOAD_GLOBAL`: `namei << 1 | push_null`.
//! - `LOAD_ATTR`: `namei << 1 | is_method_load`.
//! - `COMPARE_OP`: `cmp_index << 4 | specialization_mask`.
//! - Jumps are relative, counted in code units from the instruction after the jump.

use strum::{EnumIter, FromRepr, IntoStaticStr};

/// Opcode discriminant, the first byte of every code unit.
///
/// With `#[repr(u8)]` and explicit discriminants matching CPython, `strum::FromRepr` decodes a
/// byte back to its opcode and `IntoStaticStr` gives the `dis` name.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // === No argument ===
    /// Discard top of stack.
    PopTop = 1,
    /// Push the `NULL` sentinel that precedes a callable which is not a bound method.
    PushNull = 2,
    /// End of a `for` loop: pops the exhausted iterator and the value slot.
    EndFor = 4,
    Nop = 9,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,
    /// `container[key]`.
    BinarySubscr = 25,
    /// Push the active exception onto the stack when entering a handler.
    PushExcInfo = 35,
    /// Test the raised exception against the type on top of stack.
    CheckExcMatch = 36,
    /// Call the context manager's `__exit__` with the raised exception.
    WithExceptStart = 49,
    /// Enter a context manager: pushes its bound `__exit__` and the result of `__enter__`.
    BeforeWith = 53,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    GetIter = 68,
    /// Push `builtins.__build_class__`.
    LoadBuildClass = 71,
    LoadAssertionError = 74,
    /// First instruction of a generator: create the generator object and return it.
    ReturnGenerator = 75,
    ReturnValue = 83,
    /// Create `__annotations__` in a module or class body.
    SetupAnnotations = 85,
    PopExcept = 89,

    // === With argument ===
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    /// Advance the iterator on top of stack, or jump to the loop's `END_FOR` when exhausted.
    ForIter = 93,
    /// Unpack with a starred target: low byte is the count before, high byte the count after.
    UnpackEx = 94,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    /// Swap top of stack with the item at the given depth.
    Swap = 99,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildSet = 104,
    /// Build a dict from `2 * count` stack items.
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,
    JumpForward = 110,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    /// `is` (0) or `is not` (1).
    IsOp = 117,
    /// `in` (0) or `not in` (1).
    ContainsOp = 118,
    Reraise = 119,
    /// Push a copy of the item at the given depth.
    Copy = 120,
    ReturnConst = 121,
    /// Binary or in-place operator, indexed into `BINARY_OPS`.
    BinaryOp = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    PopJumpIfNotNone = 128,
    PopJumpIfNone = 129,
    /// `raise` with 0, 1 (exception) or 2 (exception and cause) operands.
    RaiseVarargs = 130,
    /// Argument is a set of `MAKE_FUNCTION_FLAGS` bits.
    MakeFunction = 132,
    BuildSlice = 133,
    /// Create a fresh cell for a cell variable at function entry.
    MakeCell = 135,
    LoadClosure = 136,
    LoadDeref = 137,
    StoreDeref = 138,
    DeleteDeref = 139,
    JumpBackward = 140,
    /// Call with positional arguments in a tuple and keyword arguments in an optional dict.
    CallFunctionEx = 142,
    /// Prefix supplying the high bits of the following instruction's argument.
    ExtendedArg = 144,
    ListAppend = 145,
    SetAdd = 146,
    MapAdd = 147,
    /// Copy closure cells into the frame at function entry.
    CopyFreeVars = 149,
    YieldValue = 150,
    /// No-op marking a point where execution starts or resumes (0 at entry, 1 after yield).
    Resume = 151,
    /// Argument packs the conversion (`FORMAT_VALUE_CONVERTERS`) and a format-spec flag.
    FormatValue = 155,
    /// Build a dict from values on the stack and a constant tuple of keys.
    BuildConstKeyMap = 156,
    /// Concatenate the given number of strings.
    BuildString = 157,
    ListExtend = 162,
    SetUpdate = 163,
    DictMerge = 164,
    DictUpdate = 165,
    /// Call with the given number of arguments; the stack holds `NULL|self`, callable, args.
    Call = 171,
    /// Constant tuple naming the trailing keyword arguments of the next `CALL`.
    KwNames = 172,
    #[strum(serialize = "CALL_INTRINSIC_1")]
    CallIntrinsic1 = 173,
}

/// Opcodes numbered at or above this take an argument.
pub const HAVE_ARGUMENT: u8 = Opcode::StoreName as u8;

/// Operator symbols of `BINARY_OP`, indexed by its argument (CPython's `NB_*` order).
pub const BINARY_OPS: [&str; 26] = [
    "+", "&", "//", "<<", "@", "*", "%", "|", "**", ">>", "-", "/", "^", "+=", "&=", "//=", "<<=", "@=", "*=",
    "%=", "|=", "**=", ">>=", "-=", "/=", "^=",
];

/// Offset of the in-place variants in `BINARY_OPS`.
pub const INPLACE_OFFSET: u32 = 13;

/// Comparison symbols of `COMPARE_OP`, indexed by `arg >> 4`.
pub const COMPARE_OPS: [&str; 6] = ["<", "<=", "==", "!=", ">", ">="];

/// Specialization mask CPython stores in the low 4 bits of `COMPARE_OP`.
pub const COMPARE_MASKS: [u32; 6] = [2, 10, 8, 7, 4, 12];

/// Conversion names of `FORMAT_VALUE`, indexed by `arg & 0x3`.
pub const FORMAT_VALUE_CONVERTERS: [&str; 4] = ["", "str", "repr", "ascii"];

/// `FORMAT_VALUE` bit set when a format spec is on the stack.
pub const FORMAT_VALUE_WITH_SPEC: u32 = 0x4;

/// Names of the `MAKE_FUNCTION` flag bits, bit `i` is `1 << i`.
pub const MAKE_FUNCTION_FLAGS: [&str; 4] = ["defaults", "kwdefaults", "annotations", "closure"];

pub const MAKE_FUNCTION_DEFAULTS: u32 = 0x01;
pub const MAKE_FUNCTION_KWDEFAULTS: u32 = 0x02;
pub const MAKE_FUNCTION_ANNOTATIONS: u32 = 0x04;
pub const MAKE_FUNCTION_CLOSURE: u32 = 0x08;

/// Names of the `CALL_INTRINSIC_1` functions, indexed by its argument.
pub const INTRINSICS: [&str; 7] = [
    "INTRINSIC_1_INVALID",
    "INTRINSIC_PRINT",
    "INTRINSIC_IMPORT_STAR",
    "INTRINSIC_STOPITERATION_ERROR",
    "INTRINSIC_ASYNC_GEN_WRAP",
    "INTRINSIC_UNARY_POSITIVE",
    "INTRINSIC_LIST_TO_TUPLE",
];

pub const INTRINSIC_IMPORT_STAR: u32 = 2;
pub const INTRINSIC_STOPITERATION_ERROR: u32 = 3;
pub const INTRINSIC_UNARY_POSITIVE: u32 = 5;
pub const INTRINSIC_LIST_TO_TUPLE: u32 = 6;

/// Direction of a relative jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpDirection {
    Forward,
    Backward,
}

/// What the argument of an opcode refers to, as `dis` groups them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// The argument byte is unused.
    None,
    /// Index into `consts`.
    Const,
    /// Index into `names` (shifted for `LOAD_GLOBAL` and `LOAD_ATTR`).
    Name,
    /// Index into `varnames`.
    Local,
    /// Index into the cell and free variables.
    Free,
    /// Relative jump.
    Jump(JumpDirection),
    /// Operator index (`BINARY_OP`, `COMPARE_OP`, `IS_OP`, `CONTAINS_OP`).
    Operator,
    /// Anything else: counts, flags, depths.
    Int,
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcodeError(byte))
    }
}

impl Opcode {
    /// The `dis` name of the opcode, e.g. `LOAD_CONST`.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    #[must_use]
    pub const fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    #[must_use]
    pub const fn arg_kind(self) -> ArgKind {
        use Opcode::{
            BinaryOp, CompareOp, ContainsOp, DeleteAttr, DeleteDeref, DeleteFast, DeleteGlobal, DeleteName, ForIter,
            ImportFrom, ImportName, IsOp, JumpBackward, JumpForward, KwNames, LoadAttr, LoadClosure, LoadConst,
            LoadDeref, LoadFast, LoadGlobal, LoadName, MakeCell, PopJumpIfFalse, PopJumpIfNone, PopJumpIfNotNone,
            PopJumpIfTrue, ReturnConst, StoreAttr, StoreDeref, StoreFast, StoreGlobal, StoreName,
        };
        if !self.has_arg() {
            return ArgKind::None;
        }
        match self {
            LoadConst | ReturnConst | KwNames => ArgKind::Const,
            StoreName | DeleteName | StoreAttr | DeleteAttr | StoreGlobal | DeleteGlobal | LoadName | LoadAttr
            | ImportName | ImportFrom | LoadGlobal => ArgKind::Name,
            LoadFast | StoreFast | DeleteFast => ArgKind::Local,
            MakeCell | LoadClosure | LoadDeref | StoreDeref | DeleteDeref => ArgKind::Free,
            ForIter | JumpForward | PopJumpIfFalse | PopJumpIfTrue | PopJumpIfNone | PopJumpIfNotNone => {
                ArgKind::Jump(JumpDirection::Forward)
            }
            JumpBackward => ArgKind::Jump(JumpDirection::Backward),
            BinaryOp | CompareOp | IsOp | ContainsOp => ArgKind::Operator,
            _ => ArgKind::Int,
        }
    }

    #[must_use]
    pub const fn is_jump(self) -> bool {
        matches!(self.arg_kind(), ArgKind::Jump(_))
    }

    /// Instructions after which execution never falls through to the next one.
    #[must_use]
    pub const fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::ReturnValue
                | Self::ReturnConst
                | Self::RaiseVarargs
                | Self::Reraise
                | Self::JumpForward
                | Self::JumpBackward
        )
    }
}

/// Error returned when attempting to convert an invalid byte to an Opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcodeError(pub u8);

impl std::fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid opcode byte: {}", self.0)
    }
}

impl std::error::Error for InvalidOpcodeError {}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for opcode in Opcode::iter() {
            let byte = opcode as u8;
            assert_eq!(Opcode::try_from(byte), Ok(opcode), "opcode {opcode:?} does not decode");
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::try_from(0u8), Err(InvalidOpcodeError(0)));
        assert!(Opcode::try_from(255u8).is_err());
    }

    #[test]
    fn test_no_argument_opcodes_come_first() {
        let first_with_arg = Opcode::iter().position(Opcode::has_arg).unwrap();
        assert!(Opcode::iter().skip(first_with_arg).all(Opcode::has_arg));
        assert_eq!(Opcode::iter().nth(first_with_arg), Some(Opcode::StoreName));
    }

    #[test]
    fn test_dis_names() {
        assert_eq!(Opcode::LoadConst.name(), "LOAD_CONST");
        assert_eq!(Opcode::PopJumpIfNotNone.name(), "POP_JUMP_IF_NOT_NONE");
        assert_eq!(Opcode::CallIntrinsic1.name(), "CALL_INTRINSIC_1");
        assert_eq!(Opcode::BuildConstKeyMap.name(), "BUILD_CONST_KEY_MAP");
        assert_eq!(Opcode::BeforeWith.name(), "BEFORE_WITH");
        assert_eq!(Opcode::WithExceptStart.name(), "WITH_EXCEPT_START");
    }

    #[test]
    fn test_arg_kinds() {
        assert_eq!(Opcode::PopTop.arg_kind(), ArgKind::None);
        assert_eq!(Opcode::BeforeWith.arg_kind(), ArgKind::None);
        assert_eq!(Opcode::KwNames.arg_kind(), ArgKind::Const);
        assert_eq!(Opcode::LoadGlobal.arg_kind(), ArgKind::Name);
        assert_eq!(Opcode::JumpBackward.arg_kind(), ArgKind::Jump(JumpDirection::Backward));
        assert_eq!(Opcode::ForIter.arg_kind(), ArgKind::Jump(JumpDirection::Forward));
        assert_eq!(Opcode::Call.arg_kind(), ArgKind::Int);
    }

    #[test]
    fn test_operator_tables() {
        assert_eq!(BINARY_OPS[0], "+");
        assert_eq!(BINARY_OPS[INPLACE_OFFSET as usize], "+=");
        assert_eq!(BINARY_OPS[10], "-");
        assert_eq!(COMPARE_OPS[2], "==");
    }

    #[test]
    fn test_opcode_size() {
        assert_eq!(std::mem::size_of::<Opcode>(), 1);
    }
}
