//! Scope analysis: decides, for every name in every scope, which family of load/store
//! opcodes the compiler uses for it.
//!
//! Runs in two passes like CPython's symtable: the first walks the tree recording how each
//! scope binds and uses names, the second resolves those records against the enclosing
//! scopes to find locals, cells, free variables, and globals.

use std::collections::BTreeSet;

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::{
    error::CompileError,
    expressions::{
        ClassDef, Comprehension, ComprehensionKind, Expr, ExprLoc, FStringPart, FunctionDef, MODULE_SCOPE, Module,
        Node, ScopeId, Stmt, Target, TargetKind,
    },
};

type PrepareResult<T> = Result<T, CompileError>;

const DEF_LOCAL: u8 = 1;
const DEF_PARAM: u8 = 1 << 1;
const DEF_GLOBAL: u8 = 1 << 2;
const DEF_NONLOCAL: u8 = 1 << 3;
const USE: u8 = 1 << 4;
const DEF_BOUND: u8 = DEF_LOCAL | DEF_PARAM;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ScopeKind {
    #[default]
    Module,
    Function,
    Class,
    Comprehension,
}

impl ScopeKind {
    /// Functions, lambdas and comprehensions keep their locals in fast slots.
    pub fn is_function_like(self) -> bool {
        matches!(self, Self::Function | Self::Comprehension)
    }
}

/// How a name is resolved in a given scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameScope {
    /// Function local: `LOAD_FAST` / `STORE_FAST`.
    Local,
    /// Function local captured by a nested scope: `LOAD_DEREF` on a cell.
    Cell,
    /// Variable of an enclosing function: `LOAD_DEREF` on a free variable.
    Free,
    /// Declared `global`: `LOAD_GLOBAL` / `STORE_GLOBAL`.
    GlobalExplicit,
    /// Unbound in a function and not found in enclosing functions: `LOAD_GLOBAL`.
    GlobalImplicit,
    /// Module and class bodies look names up by name: `LOAD_NAME` / `STORE_NAME`.
    Name,
}

/// Resolved names of one scope.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    pub kind: ScopeKind,
    /// The body contains `yield`, or the scope is a generator expression.
    pub is_generator: bool,
    /// A class body whose methods reference `__class__` (directly or through `super`).
    pub needs_class_cell: bool,
    symbols: AHashMap<String, NameScope>,
    /// Sorted, as CPython orders `co_cellvars`.
    pub cellvars: Vec<String>,
    /// Sorted, as CPython orders `co_freevars`.
    pub freevars: Vec<String>,
}

impl Scope {
    pub fn name_scope(&self, name: &str) -> NameScope {
        match self.symbols.get(name) {
            Some(scope) => *scope,
            None if self.kind.is_function_like() => NameScope::GlobalImplicit,
            None => NameScope::Name,
        }
    }
}

/// Resolved scopes indexed by `ScopeId`.
#[derive(Debug)]
pub(crate) struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }
}

/// Builds the symbol table for a parsed module.
pub(crate) fn prepare(module: &Module) -> PrepareResult<SymbolTable> {
    let mut collector = Collector {
        raw: (0..module.scope_count).map(|_| RawScope::default()).collect(),
        current: MODULE_SCOPE,
    };
    collector.visit_stmts(&module.body)?;

    let mut scopes: Vec<Scope> = (0..module.scope_count).map(|_| Scope::default()).collect();
    let free = analyze(&collector.raw, &mut scopes, MODULE_SCOPE, &AHashSet::new())?;
    debug_assert!(free.is_empty(), "module scope cannot have free variables");
    Ok(SymbolTable { scopes })
}

/// Bindings and uses recorded for one scope during the first pass.
#[derive(Debug, Default)]
struct RawScope {
    kind: ScopeKind,
    parent: Option<ScopeId>,
    symbols: IndexMap<String, u8>,
    children: Vec<ScopeId>,
    is_generator: bool,
    comprehension: Option<ComprehensionKind>,
    /// Line of each `nonlocal` declaration, for error reporting.
    nonlocal_lines: AHashMap<String, u32>,
}

struct Collector {
    raw: Vec<RawScope>,
    current: ScopeId,
}

impl Collector {
    fn scope(&mut self) -> &mut RawScope {
        &mut self.raw[self.current]
    }

    fn flags(&self, scope: ScopeId, name: &str) -> u8 {
        self.raw[scope].symbols.get(name).copied().unwrap_or(0)
    }

    fn add(&mut self, name: &str, flag: u8) {
        *self.scope().symbols.entry(name.to_owned()).or_default() |= flag;
    }

    fn add_param(&mut self, name: &str, line: u32) -> PrepareResult<()> {
        if self.flags(self.current, name) & DEF_PARAM != 0 {
            return Err(CompileError::syntax(
                format!("duplicate argument '{name}' in function definition"),
                line,
            ));
        }
        self.add(name, DEF_PARAM);
        Ok(())
    }

    /// Enters a new child scope, runs `f` in it, then returns to the current scope.
    fn in_scope(
        &mut self,
        id: ScopeId,
        kind: ScopeKind,
        f: impl FnOnce(&mut Self) -> PrepareResult<()>,
    ) -> PrepareResult<()> {
        let parent = self.current;
        self.raw[parent].children.push(id);
        self.raw[id].kind = kind;
        self.raw[id].parent = Some(parent);
        self.current = id;
        let result = f(self);
        self.current = parent;
        result
    }

    fn visit_stmts(&mut self, stmts: &[Stmt]) -> PrepareResult<()> {
        stmts.iter().try_for_each(|s| self.visit_stmt(s))
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> PrepareResult<()> {
        match &stmt.node {
            Node::Expr(expr) => self.visit_expr(expr)?,
            Node::Assign { targets, value } => {
                self.visit_expr(value)?;
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            Node::AugAssign { target, value, .. } => {
                self.visit_target(target)?;
                self.visit_expr(value)?;
            }
            Node::AnnAssign {
                target,
                annotation,
                value,
                ..
            } => {
                if let TargetKind::Name(name) = &target.kind
                    && self.flags(self.current, name) & (DEF_GLOBAL | DEF_NONLOCAL) != 0
                {
                    return Err(CompileError::syntax(
                        format!("annotated name '{name}' can't be global"),
                        stmt.line,
                    ));
                }
                if let Some(value) = value {
                    self.visit_expr(value)?;
                }
                self.visit_target(target)?;
                if !self.scope().kind.is_function_like() {
                    self.visit_expr(annotation)?;
                }
            }
            Node::Delete(targets) => {
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            Node::Pass | Node::Break | Node::Continue => {}
            Node::Return(value) => self.visit_opt(value.as_ref())?,
            Node::If { test, body, or_else } | Node::While { test, body, or_else } => {
                self.visit_expr(test)?;
                self.visit_stmts(body)?;
                self.visit_stmts(or_else)?;
            }
            Node::For {
                target,
                iter,
                body,
                or_else,
            } => {
                self.visit_expr(iter)?;
                self.visit_target(target)?;
                self.visit_stmts(body)?;
                self.visit_stmts(or_else)?;
            }
            Node::FunctionDef(def) => {
                self.visit_function(def)?;
                self.add(&def.name, DEF_LOCAL);
            }
            Node::ClassDef(class) => {
                self.visit_class(class)?;
                self.add(&class.name, DEF_LOCAL);
            }
            Node::Raise { exc, cause } => {
                self.visit_opt(exc.as_ref())?;
                self.visit_opt(cause.as_ref())?;
            }
            Node::Try(try_) => {
                self.visit_stmts(&try_.body)?;
                for handler in &try_.handlers {
                    self.visit_opt(handler.exc_type.as_ref())?;
                    if let Some(name) = &handler.name {
                        self.add(name, DEF_LOCAL);
                    }
                    self.visit_stmts(&handler.body)?;
                }
                self.visit_stmts(&try_.or_else)?;
                self.visit_stmts(&try_.finally)?;
            }
            Node::With { items, body } => {
                for item in items {
                    self.visit_expr(&item.context)?;
                    if let Some(target) = &item.target {
                        self.visit_target(target)?;
                    }
                }
                self.visit_stmts(body)?;
            }
            Node::Assert { test, msg } => {
                self.visit_expr(test)?;
                self.visit_opt(msg.as_ref())?;
            }
            Node::Import(names) => {
                for alias in names {
                    self.add(alias.binding(), DEF_LOCAL);
                }
            }
            Node::ImportFrom { names, .. } => {
                for alias in names {
                    if alias.name == "*" {
                        if self.current != MODULE_SCOPE {
                            return Err(CompileError::syntax("import * only allowed at module level", stmt.line));
                        }
                    } else {
                        self.add(alias.binding(), DEF_LOCAL);
                    }
                }
            }
            Node::Global(names) => {
                for name in names {
                    self.declare(name, DEF_GLOBAL, stmt.line)?;
                }
            }
            Node::Nonlocal(names) => {
                if self.current == MODULE_SCOPE {
                    return Err(CompileError::syntax(
                        "nonlocal declaration not allowed at module level",
                        stmt.line,
                    ));
                }
                for name in names {
                    self.declare(name, DEF_NONLOCAL, stmt.line)?;
                }
            }
        }
        Ok(())
    }

    /// Records a `global` or `nonlocal` declaration, rejecting conflicting earlier uses.
    fn declare(&mut self, name: &str, flag: u8, line: u32) -> PrepareResult<()> {
        let keyword = if flag == DEF_GLOBAL { "global" } else { "nonlocal" };
        let flags = self.flags(self.current, name);
        let message = if flags & DEF_PARAM != 0 {
            Some(format!("name '{name}' is parameter and {keyword}"))
        } else if flags & (DEF_GLOBAL | DEF_NONLOCAL) & !flag != 0 {
            Some(format!("name '{name}' is nonlocal and global"))
        } else if flags & DEF_LOCAL != 0 {
            Some(format!("name '{name}' is assigned to before {keyword} declaration"))
        } else if flags & USE != 0 {
            Some(format!("name '{name}' is used prior to {keyword} declaration"))
        } else {
            None
        };
        match message {
            Some(message) => Err(CompileError::syntax(message, line)),
            None => {
                if flag == DEF_NONLOCAL {
                    self.scope().nonlocal_lines.insert(name.to_owned(), line);
                }
                self.add(name, flag);
                Ok(())
            }
        }
    }

    fn visit_function(&mut self, def: &FunctionDef) -> PrepareResult<()> {
        for decorator in &def.decorators {
            self.visit_expr(decorator)?;
        }
        for default in def.parameters.positional_defaults() {
            self.visit_expr(default)?;
        }
        for (_, default) in def.parameters.keyword_defaults() {
            self.visit_expr(default)?;
        }
        for (_, annotation) in def.parameters.annotations() {
            self.visit_expr(annotation)?;
        }
        self.visit_opt(def.returns.as_ref())?;
        self.in_scope(def.scope, ScopeKind::Function, |this| {
            for name in def.parameters.names() {
                this.add_param(name, def.line)?;
            }
            this.visit_stmts(&def.body)
        })
    }

    fn visit_class(&mut self, class: &ClassDef) -> PrepareResult<()> {
        for decorator in &class.decorators {
            self.visit_expr(decorator)?;
        }
        for base in &class.bases {
            self.visit_expr(base)?;
        }
        for keyword in &class.keywords {
            self.visit_expr(&keyword.value)?;
        }
        self.in_scope(class.scope, ScopeKind::Class, |this| this.visit_stmts(&class.body))
    }

    fn visit_comprehension(&mut self, comp: &Comprehension) -> PrepareResult<()> {
        let Some((first, rest)) = comp.generators.split_first() else {
            return Ok(());
        };
        // the outermost iterable is evaluated in the enclosing scope
        self.visit_expr(&first.iter)?;
        self.in_scope(comp.scope, ScopeKind::Comprehension, |this| {
            let scope = this.scope();
            scope.comprehension = Some(comp.kind);
            scope.is_generator = comp.kind == ComprehensionKind::Generator;
            this.add(".0", DEF_PARAM);
            this.visit_target(&first.target)?;
            for cond in &first.ifs {
                this.visit_expr(cond)?;
            }
            for generator in rest {
                this.visit_expr(&generator.iter)?;
                this.visit_target(&generator.target)?;
                for cond in &generator.ifs {
                    this.visit_expr(cond)?;
                }
            }
            this.visit_expr(&comp.element)?;
            this.visit_opt(comp.value.as_ref())
        })
    }

    /// Binds the target of `name := value` inside a comprehension in the nearest enclosing
    /// non-comprehension scope.
    fn bind_named_in_comprehension(&mut self, name: &str, line: u32) -> PrepareResult<()> {
        if self.flags(self.current, name) & DEF_LOCAL != 0 {
            return Err(CompileError::syntax(
                format!("assignment expression cannot rebind comprehension iteration variable '{name}'"),
                line,
            ));
        }
        let mut path = vec![self.current];
        let mut owner = self.raw[self.current].parent.unwrap_or(MODULE_SCOPE);
        while self.raw[owner].kind == ScopeKind::Comprehension {
            path.push(owner);
            owner = self.raw[owner].parent.unwrap_or(MODULE_SCOPE);
        }
        let flag = match self.raw[owner].kind {
            ScopeKind::Class => {
                return Err(CompileError::syntax(
                    "assignment expression within a comprehension cannot be used in a class body",
                    line,
                ));
            }
            ScopeKind::Module => DEF_GLOBAL,
            ScopeKind::Function | ScopeKind::Comprehension => DEF_NONLOCAL,
        };
        for scope in path {
            *self.raw[scope].symbols.entry(name.to_owned()).or_default() |= flag;
        }
        *self.raw[owner].symbols.entry(name.to_owned()).or_default() |= DEF_LOCAL;
        Ok(())
    }

    fn visit_target(&mut self, target: &Target) -> PrepareResult<()> {
        match &target.kind {
            TargetKind::Name(name) => self.add(name, DEF_LOCAL),
            TargetKind::Attr { object, .. } => self.visit_expr(object)?,
            TargetKind::Subscript { object, index } => {
                self.visit_expr(object)?;
                self.visit_expr(index)?;
            }
            TargetKind::Unpack { targets, .. } => {
                for target in targets {
                    self.visit_target(target)?;
                }
            }
        }
        Ok(())
    }

    fn visit_opt(&mut self, expr: Option<&ExprLoc>) -> PrepareResult<()> {
        match expr {
            Some(expr) => self.visit_expr(expr),
            None => Ok(()),
        }
    }

    fn visit_exprs<'e>(&mut self, exprs: impl IntoIterator<Item = &'e ExprLoc>) -> PrepareResult<()> {
        exprs.into_iter().try_for_each(|e| self.visit_expr(e))
    }

    fn visit_expr(&mut self, expr: &ExprLoc) -> PrepareResult<()> {
        match &expr.expr {
            Expr::Literal(_) => {}
            Expr::Name(name) => {
                self.add(name, USE);
                if name == "super" && self.scope().kind == ScopeKind::Function {
                    self.add("__class__", USE);
                }
            }
            Expr::BinOp { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }
            Expr::BoolOp { values, .. } => self.visit_exprs(values)?,
            Expr::Unary { operand, .. } => self.visit_expr(operand)?,
            Expr::Compare { left, comparisons } => {
                self.visit_expr(left)?;
                self.visit_exprs(comparisons.iter().map(|(_, e)| e))?;
            }
            Expr::Call { func, args, keywords } => {
                self.visit_expr(func)?;
                self.visit_exprs(args)?;
                self.visit_exprs(keywords.iter().map(|k| &k.value))?;
            }
            Expr::Attribute { object, .. } | Expr::Starred(object) => self.visit_expr(object)?,
            Expr::Subscript { object, index } => {
                self.visit_expr(object)?;
                self.visit_expr(index)?;
            }
            Expr::Slice { lower, upper, step } => {
                self.visit_opt(lower.as_deref())?;
                self.visit_opt(upper.as_deref())?;
                self.visit_opt(step.as_deref())?;
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => self.visit_exprs(items)?,
            Expr::Dict(items) => {
                for item in items {
                    self.visit_opt(item.key.as_ref())?;
                    self.visit_expr(&item.value)?;
                }
            }
            Expr::IfElse { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }
            Expr::Lambda(def) => self.visit_function(def)?,
            Expr::Comprehension(comp) => self.visit_comprehension(comp)?,
            Expr::FString(parts) => self.visit_fstring(parts)?,
            Expr::Named { target, value } => {
                self.visit_expr(value)?;
                if self.scope().kind == ScopeKind::Comprehension {
                    self.bind_named_in_comprehension(target, expr.line)?;
                } else {
                    self.add(target, DEF_LOCAL);
                }
            }
            Expr::Yield(value) => {
                let scope = self.scope();
                match (scope.kind, scope.comprehension) {
                    (ScopeKind::Function, _) => scope.is_generator = true,
                    (ScopeKind::Comprehension, Some(kind)) => {
                        return Err(CompileError::syntax(
                            format!("'yield' inside {}", comprehension_description(kind)),
                            expr.line,
                        ));
                    }
                    _ => return Err(CompileError::syntax("'yield' outside function", expr.line)),
                }
                self.visit_opt(value.as_deref())?;
            }
        }
        Ok(())
    }

    fn visit_fstring(&mut self, parts: &[FStringPart]) -> PrepareResult<()> {
        for part in parts {
            if let FStringPart::Interpolation { expr, format_spec, .. } = part {
                self.visit_expr(expr)?;
                if let Some(spec) = format_spec {
                    self.visit_fstring(spec)?;
                }
            }
        }
        Ok(())
    }
}

fn comprehension_description(kind: ComprehensionKind) -> &'static str {
    match kind {
        ComprehensionKind::List => "list comprehension",
        ComprehensionKind::Set => "set comprehension",
        ComprehensionKind::Dict => "dict comprehension",
        ComprehensionKind::Generator => "generator expression",
    }
}

/// Resolves the names of scope `id` given the names `bound` by enclosing functions.
///
/// Returns the free variables the scope needs from its enclosing scopes.
fn analyze(
    raw: &[RawScope],
    scopes: &mut [Scope],
    id: ScopeId,
    bound: &AHashSet<String>,
) -> PrepareResult<BTreeSet<String>> {
    let scope_raw = &raw[id];
    let kind = scope_raw.kind;
    let mut symbols = AHashMap::with_capacity(scope_raw.symbols.len());
    let mut local = AHashSet::new();
    let mut free = BTreeSet::new();

    for (name, &flags) in &scope_raw.symbols {
        let name_scope = if flags & DEF_GLOBAL != 0 {
            NameScope::GlobalExplicit
        } else if flags & DEF_NONLOCAL != 0 {
            if !bound.contains(name) {
                let line = scope_raw.nonlocal_lines.get(name).copied().unwrap_or_default();
                return Err(CompileError::syntax(format!("no binding for nonlocal '{name}' found"), line));
            }
            free.insert(name.clone());
            NameScope::Free
        } else if flags & DEF_BOUND != 0 {
            local.insert(name.clone());
            if kind.is_function_like() {
                NameScope::Local
            } else {
                NameScope::Name
            }
        } else if kind != ScopeKind::Module && bound.contains(name) {
            free.insert(name.clone());
            NameScope::Free
        } else if kind.is_function_like() {
            NameScope::GlobalImplicit
        } else {
            NameScope::Name
        };
        symbols.insert(name.clone(), name_scope);
    }

    let mut child_bound = match kind {
        ScopeKind::Module => AHashSet::new(),
        ScopeKind::Class => bound.clone(),
        ScopeKind::Function | ScopeKind::Comprehension => bound.union(&local).cloned().collect(),
    };
    if kind == ScopeKind::Class {
        child_bound.insert("__class__".to_owned());
    }

    let mut child_free = BTreeSet::new();
    for &child in &scope_raw.children {
        child_free.append(&mut analyze(raw, scopes, child, &child_bound)?);
    }

    let mut cells = BTreeSet::new();
    let mut needs_class_cell = false;
    for name in child_free {
        if kind.is_function_like() && local.contains(&name) {
            symbols.insert(name.clone(), NameScope::Cell);
            cells.insert(name);
        } else if kind == ScopeKind::Class && name == "__class__" {
            needs_class_cell = true;
            cells.insert(name);
        } else {
            symbols.entry(name.clone()).or_insert(NameScope::Free);
            free.insert(name);
        }
    }

    let scope = &mut scopes[id];
    scope.kind = kind;
    scope.is_generator = scope_raw.is_generator;
    scope.needs_class_cell = needs_class_cell;
    scope.symbols = symbols;
    scope.cellvars = cells.into_iter().collect();
    scope.freevars = free.iter().cloned().collect();
    Ok(free)
}
