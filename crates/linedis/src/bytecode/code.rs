//! Compiled code objects and their constants.

use std::{fmt, rc::Rc};

use num_bigint::BigInt;

use crate::repr;

/// A compiled unit: the module body, a function, a lambda, a class body, or a comprehension.
///
/// Built once by the `CodeBuilder` and never mutated. Nested units are reachable through
/// `Constant::Code` entries of `consts`.
#[derive(Debug)]
pub struct CodeObject {
    pub(crate) name: String,
    pub(crate) qualname: String,
    pub(crate) filename: String,
    pub(crate) first_line: u32,
    pub(crate) arg_count: u32,
    pub(crate) posonly_arg_count: u32,
    pub(crate) kwonly_arg_count: u32,
    pub(crate) is_generator: bool,
    /// Two-byte wordcode: opcode then argument byte.
    pub(crate) bytecode: Vec<u8>,
    pub(crate) consts: Vec<Constant>,
    pub(crate) names: Vec<String>,
    pub(crate) varnames: Vec<String>,
    pub(crate) cellvars: Vec<String>,
    pub(crate) freevars: Vec<String>,
    pub(crate) line_table: Vec<LineEntry>,
}

/// A run of bytecode attributed to one source line, the equivalent of one `co_lines()` item.
///
/// `start` and `end` are byte offsets into the bytecode; `line` is `None` for compiler
/// generated instructions that belong to no line (such as the module's `RESUME`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub start: u32,
    pub end: u32,
    pub line: Option<u32>,
}

impl CodeObject {
    /// `<module>`, the function or class name, `<lambda>`, or a comprehension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path of the unit, e.g. `Outer.method.<locals>.inner`.
    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Line of the `def`/`class` keyword, or of the first decorator when decorated.
    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Process-local identity shown in code object descriptions.
    #[must_use]
    pub fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Number of positional parameters, positional-only ones included.
    #[must_use]
    pub fn arg_count(&self) -> u32 {
        self.arg_count
    }

    #[must_use]
    pub fn posonly_arg_count(&self) -> u32 {
        self.posonly_arg_count
    }

    #[must_use]
    pub fn kwonly_arg_count(&self) -> u32 {
        self.kwonly_arg_count
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.is_generator
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn consts(&self) -> &[Constant] {
        &self.consts
    }

    /// Global, attribute, and imported names.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Local variable names, parameters first.
    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    #[must_use]
    pub fn cellvars(&self) -> &[String] {
        &self.cellvars
    }

    #[must_use]
    pub fn freevars(&self) -> &[String] {
        &self.freevars
    }

    #[must_use]
    pub fn line_table(&self) -> &[LineEntry] {
        &self.line_table
    }

    /// Iterates over the line table, like Python's `co_lines()`.
    pub fn lines(&self) -> impl Iterator<Item = LineEntry> + '_ {
        self.line_table.iter().copied()
    }

    /// Code objects of the units defined directly in this one, in constant-pool order.
    pub fn nested_units(&self) -> impl Iterator<Item = &Rc<CodeObject>> + '_ {
        self.consts.iter().filter_map(|c| match c {
            Constant::Code(code) => Some(code),
            _ => None,
        })
    }

    /// Resolves the argument of a `*_DEREF`, `MAKE_CELL` or `LOAD_CLOSURE` instruction.
    ///
    /// The index addresses the frame's "fast locals plus" layout: locals first, then cell
    /// variables that are not also parameters, then free variables.
    #[must_use]
    pub fn deref_name(&self, index: u32) -> Option<&str> {
        let index = usize::try_from(index).ok()?;
        if let Some(name) = self.varnames.get(index) {
            return Some(name);
        }
        self.cellvars
            .iter()
            .filter(|cell| !self.varnames.contains(cell))
            .chain(&self.freevars)
            .nth(index - self.varnames.len())
            .map(String::as_str)
    }
}

impl fmt::Display for CodeObject {
    /// Formats like CPython's code object `repr`, using the address of the object as identity.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code object {} at {:#x}, file \"{}\", line {}>",
            self.name,
            self.address(),
            self.filename,
            self.first_line
        )
    }
}

/// Entry of a code object's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    /// Imaginary literal, the value is the imaginary part.
    Complex(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ellipsis,
    /// Tuple folded from constant elements, or the keyword names of a call.
    Tuple(Vec<Constant>),
    Code(Rc<CodeObject>),
}

impl Constant {
    /// Whether two constants may share one pool slot.
    ///
    /// Stricter than value equality, as in CPython: `1`, `1.0` and `True` stay distinct, so do
    /// `0.0` and `-0.0`. Code objects are never shared.
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::BigInt(a), Self::BigInt(b)) => a == b,
            (Self::Float(a), Self::Float(b)) | (Self::Complex(a), Self::Complex(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y)),
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    /// Formats the constant the way Python's `repr` shows the equivalent value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::BigInt(i) => write!(f, "{i}"),
            Self::Float(v) => repr::float_repr(f, *v),
            Self::Complex(imag) => repr::complex_repr(f, *imag),
            Self::Str(s) => repr::str_repr(f, s),
            Self::Bytes(b) => repr::bytes_repr(f, b),
            Self::Ellipsis => f.write_str("Ellipsis"),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Code(code) => write!(f, "{code}"),
        }
    }
}
