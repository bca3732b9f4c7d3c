//! Syntax tree produced by `parse.rs` and consumed by scope analysis and the compiler.
//!
//! Only the parts of ruff's AST the compiler lowers are represented. Every statement and
//! expression carries the 1-based source line it starts on; that line is what ends up in the
//! line table of the compiled code.

use num_bigint::BigInt;

/// Index of a scope in the `SymbolTable`.
///
/// Scope ids are handed out by the parser in the order scopes are encountered; the module is
/// always scope 0.
pub(crate) type ScopeId = usize;

/// Scope id of the module body.
pub(crate) const MODULE_SCOPE: ScopeId = 0;

/// A parsed module: the top-level statements.
#[derive(Debug, Clone)]
pub(crate) struct Module {
    pub body: Vec<Stmt>,
    /// Total number of scopes allocated while parsing, including the module.
    pub scope_count: usize,
}

/// A statement with the line it starts on.
#[derive(Debug, Clone)]
pub(crate) struct Stmt {
    pub line: u32,
    pub node: Node,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Expr(ExprLoc),
    /// `a = b = value`, one entry in `targets` per `=`.
    Assign {
        targets: Vec<Target>,
        value: ExprLoc,
    },
    AugAssign {
        target: Target,
        op: Operator,
        value: ExprLoc,
    },
    AnnAssign {
        target: Target,
        annotation: ExprLoc,
        value: Option<ExprLoc>,
        /// True for a bare name target without parentheses.
        simple: bool,
    },
    Delete(Vec<Target>),
    Pass,
    Return(Option<ExprLoc>),
    If {
        test: ExprLoc,
        body: Vec<Stmt>,
        or_else: Vec<Stmt>,
    },
    While {
        test: ExprLoc,
        body: Vec<Stmt>,
        or_else: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: ExprLoc,
        body: Vec<Stmt>,
        or_else: Vec<Stmt>,
    },
    Break,
    Continue,
    FunctionDef(Box<FunctionDef>),
    ClassDef(Box<ClassDef>),
    Raise {
        exc: Option<ExprLoc>,
        cause: Option<ExprLoc>,
    },
    Try(Box<Try>),
    /// `with a as b, c: ...`, one item per context manager in source order.
    With {
        items: Vec<WithItem>,
        body: Vec<Stmt>,
    },
    Assert {
        test: ExprLoc,
        msg: Option<ExprLoc>,
    },
    Import(Vec<ImportAlias>),
    ImportFrom {
        module: Option<String>,
        names: Vec<ImportAlias>,
        level: u32,
    },
    Global(Vec<String>),
    Nonlocal(Vec<String>),
}

/// An assignment, deletion, or loop target.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub line: u32,
    pub kind: TargetKind,
}

#[derive(Debug, Clone)]
pub(crate) enum TargetKind {
    Name(String),
    Attr {
        object: Box<ExprLoc>,
        attr: String,
    },
    Subscript {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    /// `a, *b, c = ...`; `starred` is the position of the starred target, if any.
    Unpack {
        targets: Vec<Target>,
        starred: Option<usize>,
    },
}

/// An expression with the line it starts on.
#[derive(Debug, Clone)]
pub(crate) struct ExprLoc {
    pub line: u32,
    pub expr: Expr,
}

impl ExprLoc {
    pub fn new(line: u32, expr: Expr) -> Self {
        Self { line, expr }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(Literal),
    Name(String),
    BinOp {
        left: Box<ExprLoc>,
        op: Operator,
        right: Box<ExprLoc>,
    },
    BoolOp {
        op: BoolOperator,
        values: Vec<ExprLoc>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<ExprLoc>,
    },
    /// `left op1 c1 op2 c2 ...`; a single comparison has one entry.
    Compare {
        left: Box<ExprLoc>,
        comparisons: Vec<(CmpOperator, ExprLoc)>,
    },
    Call {
        func: Box<ExprLoc>,
        /// Positional arguments, `*iterable` arguments appear as `Expr::Starred`.
        args: Vec<ExprLoc>,
        keywords: Vec<Keyword>,
    },
    Attribute {
        object: Box<ExprLoc>,
        attr: String,
    },
    Subscript {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    Slice {
        lower: Option<Box<ExprLoc>>,
        upper: Option<Box<ExprLoc>>,
        step: Option<Box<ExprLoc>>,
    },
    List(Vec<ExprLoc>),
    Tuple(Vec<ExprLoc>),
    Set(Vec<ExprLoc>),
    Dict(Vec<DictItem>),
    IfElse {
        test: Box<ExprLoc>,
        body: Box<ExprLoc>,
        orelse: Box<ExprLoc>,
    },
    Lambda(Box<FunctionDef>),
    Comprehension(Box<Comprehension>),
    FString(Vec<FStringPart>),
    Starred(Box<ExprLoc>),
    Named {
        target: String,
        value: Box<ExprLoc>,
    },
    Yield(Option<Box<ExprLoc>>),
}

#[derive(Debug, Clone)]
pub(crate) enum Literal {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    /// Imaginary literal such as `2j`, the value is the imaginary part.
    Imaginary(f64),
    Str(String),
    Bytes(Vec<u8>),
    Ellipsis,
}

/// Keyword argument in a call or class definition; `name` is `None` for `**mapping`.
#[derive(Debug, Clone)]
pub(crate) struct Keyword {
    pub name: Option<String>,
    pub value: ExprLoc,
}

/// Entry of a dict display; `key` is `None` for `**mapping`.
#[derive(Debug, Clone)]
pub(crate) struct DictItem {
    pub key: Option<ExprLoc>,
    pub value: ExprLoc,
}

/// A `def` statement or a `lambda` expression.
///
/// Lambdas use `<lambda>` as their name and a single `return` statement as their body.
#[derive(Debug, Clone)]
pub(crate) struct FunctionDef {
    pub scope: ScopeId,
    pub name: String,
    pub line: u32,
    pub parameters: Parameters,
    /// The `-> annotation`, if any.
    pub returns: Option<ExprLoc>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<ExprLoc>,
    pub is_lambda: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Parameters {
    pub posonly: Vec<Param>,
    pub args: Vec<Param>,
    pub vararg: Option<Param>,
    pub kwonly: Vec<Param>,
    pub kwarg: Option<Param>,
}

impl Parameters {
    /// Parameter names in the order they occupy local slots.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.posonly
            .iter()
            .chain(&self.args)
            .map(|p| p.name.as_str())
            .chain(self.kwonly.iter().map(|p| p.name.as_str()))
            .chain(self.vararg.iter().map(|p| p.name.as_str()))
            .chain(self.kwarg.iter().map(|p| p.name.as_str()))
    }

    /// Annotated parameters in the order CPython builds the annotations tuple:
    /// regular, positional-only, `*args`, keyword-only, then `**kwargs`.
    pub fn annotations(&self) -> impl Iterator<Item = (&str, &ExprLoc)> {
        self.args
            .iter()
            .chain(&self.posonly)
            .chain(&self.vararg)
            .chain(&self.kwonly)
            .chain(&self.kwarg)
            .filter_map(|p| p.annotation.as_ref().map(|a| (p.name.as_str(), a)))
    }

    /// Defaults of positional parameters, evaluated at definition time.
    pub fn positional_defaults(&self) -> impl Iterator<Item = &ExprLoc> {
        self.posonly.iter().chain(&self.args).filter_map(|p| p.default.as_ref())
    }

    /// Keyword-only parameters that carry a default.
    pub fn keyword_defaults(&self) -> impl Iterator<Item = (&str, &ExprLoc)> {
        self.kwonly
            .iter()
            .filter_map(|p| p.default.as_ref().map(|d| (p.name.as_str(), d)))
    }

    /// Number of parameters that can be passed positionally.
    pub fn positional_count(&self) -> usize {
        self.posonly.len() + self.args.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Param {
    pub name: String,
    pub default: Option<ExprLoc>,
    pub annotation: Option<ExprLoc>,
}

#[derive(Debug, Clone)]
pub(crate) struct ClassDef {
    pub scope: ScopeId,
    pub name: String,
    pub line: u32,
    pub bases: Vec<ExprLoc>,
    pub keywords: Vec<Keyword>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<ExprLoc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

impl ComprehensionKind {
    /// Name given to the code object of the comprehension.
    pub fn code_name(self) -> &'static str {
        match self {
            Self::List => "<listcomp>",
            Self::Set => "<setcomp>",
            Self::Dict => "<dictcomp>",
            Self::Generator => "<genexpr>",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Comprehension {
    pub scope: ScopeId,
    pub kind: ComprehensionKind,
    /// The element, or the key for dict comprehensions.
    pub element: ExprLoc,
    /// The value for dict comprehensions.
    pub value: Option<ExprLoc>,
    pub generators: Vec<Generator>,
}

/// One `for target in iter if cond...` clause of a comprehension.
#[derive(Debug, Clone)]
pub(crate) struct Generator {
    pub target: Target,
    pub iter: ExprLoc,
    pub ifs: Vec<ExprLoc>,
}

#[derive(Debug, Clone)]
pub(crate) struct Try {
    pub body: Vec<Stmt>,
    pub handlers: Vec<ExceptHandler>,
    pub or_else: Vec<Stmt>,
    pub finally: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExceptHandler {
    pub line: u32,
    pub exc_type: Option<ExprLoc>,
    pub name: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) struct WithItem {
    pub context: ExprLoc,
    pub target: Option<Target>,
}

/// `name` or `name as asname` in an import statement.
#[derive(Debug, Clone)]
pub(crate) struct ImportAlias {
    pub name: String,
    pub asname: Option<String>,
}

impl ImportAlias {
    /// The name this alias binds in the importing scope.
    ///
    /// `import a.b.c` binds `a`; `import a.b as x` binds `x`.
    pub fn binding(&self) -> &str {
        match &self.asname {
            Some(asname) => asname,
            None => self.name.split('.').next().unwrap_or(&self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FStringPart {
    Literal(String),
    Interpolation {
        expr: Box<ExprLoc>,
        conversion: ConversionFlag,
        format_spec: Option<Vec<FStringPart>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConversionFlag {
    None,
    Str,
    Repr,
    Ascii,
}

/// Binary operators, in the order of CPython's `NB_*` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Add,
    BitAnd,
    FloorDiv,
    LShift,
    MatMult,
    Mult,
    Mod,
    BitOr,
    Pow,
    RShift,
    Sub,
    Div,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoolOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOperator {
    Not,
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}
