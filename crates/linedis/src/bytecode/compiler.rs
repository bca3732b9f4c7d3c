//! Bytecode compiler: lowers the syntax tree to CPython 3.12 style wordcode.
//!
//! Each module, function, lambda, class body and comprehension becomes its own `CodeObject`.
//! A `Compiler` instance builds exactly one of them; nested units are compiled by a child
//! compiler and embedded in the parent's constant pool as `Constant::Code`.
//!
//! Line attribution follows CPython: a statement sets the current line and leaves it in place,
//! an expression sets its own line while its opcodes are emitted and restores the parent's
//! line afterwards. Code that only runs while an exception propagates carries no line.

use std::rc::Rc;

use ahash::AHashSet;

use super::{
    builder::{CodeBuilder, CodeInfo, JumpLabel, Position},
    code::{CodeObject, Constant},
    fold::{comparison_operand, constant_value, iterable_constant, literal_constant, truthiness},
    op::{
        COMPARE_MASKS, FORMAT_VALUE_WITH_SPEC, INPLACE_OFFSET, INTRINSIC_IMPORT_STAR, INTRINSIC_LIST_TO_TUPLE,
        INTRINSIC_STOPITERATION_ERROR, INTRINSIC_UNARY_POSITIVE, MAKE_FUNCTION_ANNOTATIONS, MAKE_FUNCTION_CLOSURE,
        MAKE_FUNCTION_DEFAULTS, MAKE_FUNCTION_KWDEFAULTS, Opcode,
    },
};
use crate::{
    error::CompileError,
    expressions::{
        BoolOperator, ClassDef, CmpOperator, Comprehension, ComprehensionKind, ConversionFlag, DictItem, Expr, ExprLoc,
        FStringPart, FunctionDef, Generator, Keyword, Literal, MODULE_SCOPE, Module, Node, Operator, Parameters,
        ScopeId, Stmt, Target, TargetKind, Try, UnaryOperator, WithItem,
    },
    parse::parse,
    prepare::{NameScope, Scope, ScopeKind, SymbolTable, prepare},
};

type CompileResult<T> = Result<T, CompileError>;

/// Number of stack items above which displays and calls are built incrementally.
const STACK_USE_GUIDELINE: usize = 30;

/// Compiles Python source into the code object of its module.
///
/// `filename` is recorded in every code object and in error messages.
///
/// # Errors
/// Returns a `CompileError` when the source does not parse, breaks a compile-time rule such as
/// `'return' outside function`, or uses syntax this compiler does not lower.
pub fn compile(source: &str, filename: &str) -> Result<Rc<CodeObject>, CompileError> {
    let compile = || -> CompileResult<Rc<CodeObject>> {
        let module = parse(source)?;
        let table = prepare(&module)?;
        let mut imports = AHashSet::new();
        collect_imports(&module.body, &mut imports);
        let context = UnitContext {
            table: &table,
            filename,
            module_imports: &imports,
        };
        compile_module(context, &module)
    };
    let code = compile().map_err(|error| error.in_file(filename))?;
    tracing::debug!(
        filename,
        nested_units = code.nested_units().count(),
        bytes = code.bytecode().len(),
        "compiled module"
    );
    Ok(code)
}

/// State shared by the compilers of every unit of one module.
#[derive(Clone, Copy)]
struct UnitContext<'a> {
    table: &'a SymbolTable,
    filename: &'a str,
    /// Names bound by `import` statements in the module scope.
    ///
    /// Attribute calls on these names are not compiled as method calls.
    module_imports: &'a AHashSet<String>,
}

/// A block of control flow the compiler is currently inside.
///
/// `break`, `continue` and `return` walk this stack from the innermost block outwards and emit
/// the cleanup each block needs before control leaves it.
#[derive(Debug, Clone, Copy)]
enum FBlock<'a> {
    WhileLoop {
        start: Position,
        /// Index into `Compiler::break_lists`.
        breaks: usize,
    },
    /// The iterator is on the stack while the body runs.
    ForLoop { start: Position, breaks: usize },
    /// Body of a `try` with handlers.
    TryExcept,
    /// Body of a `try` with a `finally` clause; leaving it runs the clause inline.
    FinallyTry { body: &'a [Stmt] },
    /// The `finally` clause running on the exceptional path.
    FinallyEnd,
    /// Matching of an exception against the handlers of a `try`.
    ExceptionHandler,
    /// Body of an `except` clause; the bound name is cleared on exit.
    HandlerCleanup { name: Option<&'a str> },
    /// A value kept on the stack while a `finally` clause runs for a `return`.
    PopValue,
    /// Body of a `with`; the context manager's `__exit__` is below it on the stack.
    With { line: u32 },
}

impl FBlock<'_> {
    /// Where `continue` jumps to and which break list `break` joins, for loops.
    fn loop_target(self) -> Option<(Position, usize)> {
        match self {
            Self::WhileLoop { start, breaks } | Self::ForLoop { start, breaks } => Some((start, breaks)),
            _ => None,
        }
    }

    /// Whether the block has an exception handler set up while it is active.
    fn handles_exceptions(self) -> bool {
        matches!(
            self,
            Self::TryExcept
                | Self::FinallyTry { .. }
                | Self::FinallyEnd
                | Self::ExceptionHandler
                | Self::HandlerCleanup { name: Some(_) }
                | Self::With { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameCtx {
    Load,
    Store,
    Delete,
}

/// What the comprehension being compiled collects its elements into.
#[derive(Clone, Copy)]
struct ComprehensionBody<'a> {
    kind: ComprehensionKind,
    element: &'a ExprLoc,
    value: Option<&'a ExprLoc>,
}

/// Compiles one code object.
struct Compiler<'a> {
    code: CodeBuilder,
    context: UnitContext<'a>,
    /// Resolved names of the unit being compiled.
    scope: &'a Scope,
    /// Dotted path used as `__qualname__` of the unit and as prefix for nested units.
    qualname: String,
    /// Active control-flow blocks, innermost last.
    fblocks: Vec<FBlock<'a>>,
    /// Pending `break` jumps of every loop entered so far, patched when the loop ends.
    break_lists: Vec<Vec<JumpLabel>>,
}

/// How a nested unit is named and what it declares.
struct UnitHeader<'a> {
    scope: ScopeId,
    name: &'a str,
    qualname: String,
    first_line: u32,
}

fn compile_module<'a>(context: UnitContext<'a>, module: &'a Module) -> CompileResult<Rc<CodeObject>> {
    let mut compiler = Compiler::new(context, MODULE_SCOPE, "<module>".to_owned());
    compiler.code.emit_arg(Opcode::Resume, 0);
    if let Some(first) = module.body.first() {
        compiler.code.set_location(Some(first.line));
    }
    compiler.compile_body(&module.body)?;
    compiler.implicit_return();
    Ok(compiler.finish(CodeInfo {
        name: "<module>".to_owned(),
        qualname: "<module>".to_owned(),
        first_line: 1,
        ..CodeInfo::default()
    }))
}

impl<'a> Compiler<'a> {
    fn new(context: UnitContext<'a>, scope: ScopeId, qualname: String) -> Self {
        Self {
            code: CodeBuilder::new(),
            context,
            scope: context.table.scope(scope),
            qualname,
            fblocks: Vec::new(),
            break_lists: Vec::new(),
        }
    }

    /// Starts a nested unit: a child compiler with the prologue of a function-like unit or class
    /// body already emitted. `params` are the local slots that must exist before the prologue.
    fn child<'p>(&self, header: &UnitHeader<'_>, params: impl IntoIterator<Item = &'p str>) -> Compiler<'a> {
        let mut child = Compiler::new(self.context, header.scope, header.qualname.clone());
        for param in params {
            child.code.add_varname(param);
        }
        child.prologue(header.first_line);
        child
    }

    /// Emits the instructions every non-module unit starts with.
    fn prologue(&mut self, first_line: u32) {
        self.code.set_location(None);
        let scope = self.scope;
        if !scope.freevars.is_empty() {
            self.code.emit_arg(Opcode::CopyFreeVars, to_u32(scope.freevars.len()));
        }
        // parameters that are also cells keep their parameter slot, so they come first
        let mut cells: Vec<(Option<u32>, u32)> = scope
            .cellvars
            .iter()
            .enumerate()
            .map(|(index, name)| (self.code.varname_index(name), to_u32(index)))
            .collect();
        cells.sort_by_key(|&(slot, index)| (slot.unwrap_or(u32::MAX), index));
        for (_, index) in cells {
            self.code.emit_arg(Opcode::MakeCell, index);
        }
        self.code.set_location(Some(first_line));
        if scope.is_generator {
            self.code.emit(Opcode::ReturnGenerator);
            self.code.emit(Opcode::PopTop);
        }
        self.code.emit_arg(Opcode::Resume, 0);
    }

    /// Emits `return None` when control can fall off the end of the unit.
    fn implicit_return(&mut self) {
        if self.code.is_reachable() {
            self.code.set_location(None);
            self.return_const(Constant::None);
        }
    }

    /// Assembles the unit; generators get their `StopIteration` conversion handler appended.
    fn finish(mut self, mut info: CodeInfo) -> Rc<CodeObject> {
        if self.scope.is_generator {
            self.code.set_location(None);
            self.code.emit_arg(Opcode::CallIntrinsic1, INTRINSIC_STOPITERATION_ERROR);
            self.code.emit_arg(Opcode::Reraise, 1);
        }
        info.filename = self.context.filename.to_owned();
        info.is_generator = self.scope.is_generator;
        info.cellvars = self.scope.cellvars.clone();
        info.freevars = self.scope.freevars.clone();
        Rc::new(self.code.build(info))
    }

    /// Qualified name of a unit defined in this one.
    ///
    /// `binding` is the name a `def` or `class` binds; a unit bound to a `global` name is
    /// qualified by its name alone.
    fn child_qualname(&self, name: &str, binding: Option<&str>) -> String {
        if binding.is_some_and(|b| self.scope.name_scope(b) == NameScope::GlobalExplicit) {
            return name.to_owned();
        }
        match self.scope.kind {
            ScopeKind::Module => name.to_owned(),
            ScopeKind::Function => format!("{}.<locals>.{name}", self.qualname),
            ScopeKind::Class | ScopeKind::Comprehension => format!("{}.{name}", self.qualname),
        }
    }
}

// statements
impl<'a> Compiler<'a> {
    /// Compiles a module or class body: the annotations dict, the docstring, then the statements.
    fn compile_body(&mut self, body: &'a [Stmt]) -> CompileResult<()> {
        if contains_annotations(body) {
            self.code.emit(Opcode::SetupAnnotations);
        }
        match (body.split_first(), docstring(body)) {
            (Some((first, rest)), Some(doc)) => {
                self.code.set_location(Some(first.line));
                self.load_const(Constant::Str(doc.to_owned()));
                self.name_op("__doc__", NameCtx::Store);
                self.compile_stmts(rest)
            }
            _ => self.compile_stmts(body),
        }
    }

    /// Compiles a block; statements after one that never completes are unreachable and dropped.
    fn compile_stmts(&mut self, stmts: &'a [Stmt]) -> CompileResult<()> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
            if !self.code.is_reachable() {
                break;
            }
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &'a Stmt) -> CompileResult<()> {
        self.code.set_location(Some(stmt.line));
        match &stmt.node {
            Node::Expr(expr) => {
                if constant_value(expr).is_some() {
                    self.code.emit(Opcode::Nop);
                } else {
                    self.compile_expr(expr)?;
                    self.code.emit(Opcode::PopTop);
                }
            }
            Node::Assign { targets, value } => self.compile_assign(targets, value)?,
            Node::AugAssign { target, op, value } => self.compile_aug_assign(target, *op, value)?,
            Node::AnnAssign {
                target,
                annotation,
                value,
                simple,
            } => self.compile_ann_assign(target, annotation, value.as_ref(), *simple)?,
            Node::Delete(targets) => {
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
            Node::Pass => self.code.emit(Opcode::Nop),
            Node::Return(value) => self.compile_return(stmt.line, value.as_ref())?,
            Node::If { test, body, or_else } => self.compile_if(test, body, or_else)?,
            Node::While { test, body, or_else } => self.compile_while(stmt.line, test, body, or_else)?,
            Node::For {
                target,
                iter,
                body,
                or_else,
            } => self.compile_for(stmt.line, target, iter, body, or_else)?,
            Node::Break => self.compile_break(stmt.line)?,
            Node::Continue => self.compile_continue(stmt.line)?,
            Node::FunctionDef(def) => self.compile_function_def(def)?,
            Node::ClassDef(class) => self.compile_class_def(class)?,
            Node::Raise { exc, cause } => {
                let mut count = 0;
                if let Some(exc) = exc {
                    self.compile_expr(exc)?;
                    count += 1;
                    if let Some(cause) = cause {
                        self.compile_expr(cause)?;
                        count += 1;
                    }
                }
                self.code.emit_arg(Opcode::RaiseVarargs, count);
            }
            Node::Try(try_) => {
                if try_.finally.is_empty() {
                    self.compile_try_except(try_)?;
                } else {
                    self.compile_try_finally(try_)?;
                }
            }
            Node::With { items, body } => self.compile_with(stmt.line, items, body)?,
            Node::Assert { test, msg } => {
                let passed = self.compile_jump_if(test, true)?;
                self.code.emit(Opcode::LoadAssertionError);
                if let Some(msg) = msg {
                    self.compile_expr(msg)?;
                    self.code.emit_arg(Opcode::Call, 0);
                }
                self.code.emit_arg(Opcode::RaiseVarargs, 1);
                self.patch_all(passed);
            }
            Node::Import(aliases) => {
                for alias in aliases {
                    self.load_const(Constant::Int(0));
                    self.load_const(Constant::None);
                    let module = self.code.add_name(&alias.name);
                    self.code.emit_arg(Opcode::ImportName, module);
                    match &alias.asname {
                        Some(asname) if alias.name.contains('.') => {
                            // `import a.b.c as d` binds the innermost module
                            let mut parts = alias.name.split('.').skip(1).peekable();
                            while let Some(part) = parts.next() {
                                let attr = self.code.add_name(part);
                                self.code.emit_arg(Opcode::ImportFrom, attr);
                                if parts.peek().is_some() {
                                    self.code.emit_arg(Opcode::Swap, 2);
                                    self.code.emit(Opcode::PopTop);
                                }
                            }
                            self.name_op(asname, NameCtx::Store);
                            self.code.emit(Opcode::PopTop);
                        }
                        _ => self.name_op(alias.binding(), NameCtx::Store),
                    }
                }
            }
            Node::ImportFrom { module, names, level } => {
                self.load_const(Constant::Int(i64::from(*level)));
                let fromlist = names.iter().map(|alias| Constant::Str(alias.name.clone())).collect();
                self.load_const(Constant::Tuple(fromlist));
                let module = self.code.add_name(module.as_deref().unwrap_or_default());
                self.code.emit_arg(Opcode::ImportName, module);
                if let [alias] = names.as_slice()
                    && alias.name == "*"
                {
                    if self.scope.kind.is_function_like() {
                        return Err(CompileError::syntax("import * only allowed at module level", stmt.line));
                    }
                    self.code.emit_arg(Opcode::CallIntrinsic1, INTRINSIC_IMPORT_STAR);
                    self.code.emit(Opcode::PopTop);
                    return Ok(());
                }
                for alias in names {
                    let name = self.code.add_name(&alias.name);
                    self.code.emit_arg(Opcode::ImportFrom, name);
                    self.name_op(alias.asname.as_deref().unwrap_or(&alias.name), NameCtx::Store);
                }
                self.code.emit(Opcode::PopTop);
            }
            Node::Global(_) | Node::Nonlocal(_) => {}
        }
        Ok(())
    }

    fn compile_assign(&mut self, targets: &'a [Target], value: &'a ExprLoc) -> CompileResult<()> {
        if let [target] = targets
            && self.compile_swap_assign(target, value)?
        {
            return Ok(());
        }
        self.compile_expr(value)?;
        for (index, target) in targets.iter().enumerate() {
            if index + 1 < targets.len() {
                self.code.emit_arg(Opcode::Copy, 1);
            }
            self.compile_store(target)?;
        }
        Ok(())
    }

    /// `a, b = b, a` with two or three items: the values are swapped on the stack instead of
    /// being packed into a tuple and unpacked again.
    ///
    /// Returns `false`, having emitted nothing, when the assignment does not have that shape.
    fn compile_swap_assign(&mut self, target: &'a Target, value: &'a ExprLoc) -> CompileResult<bool> {
        let (Expr::Tuple(values), TargetKind::Unpack { targets, starred: None }) = (&value.expr, &target.kind) else {
            return Ok(false);
        };
        if !(2..=3).contains(&values.len())
            || values.len() != targets.len()
            || values.iter().any(is_starred)
            || constant_value(value).is_some()
        {
            return Ok(false);
        }
        let saved = self.code.location();
        self.code.set_location(Some(value.line));
        for value in values {
            self.compile_expr(value)?;
        }
        self.code.set_location(Some(target.line));
        // distinct fast locals are stored in reverse order, no swap needed
        let mut locals = AHashSet::new();
        let all_fast = targets.iter().all(|t| match &t.kind {
            TargetKind::Name(name) => self.scope.name_scope(name) == NameScope::Local && locals.insert(name.as_str()),
            _ => false,
        });
        if all_fast {
            for target in targets.iter().rev() {
                self.compile_store(target)?;
            }
        } else {
            self.code.emit_arg(Opcode::Swap, to_u32(values.len()));
            for target in targets {
                self.compile_store(target)?;
            }
        }
        self.code.set_location(saved);
        Ok(true)
    }

    /// Stores the value on top of the stack into `target`.
    fn compile_store(&mut self, target: &'a Target) -> CompileResult<()> {
        let saved = self.code.location();
        self.code.set_location(Some(target.line));
        match &target.kind {
            TargetKind::Name(name) => self.name_op(name, NameCtx::Store),
            TargetKind::Attr { object, attr } => {
                self.compile_expr(object)?;
                let attr = self.code.add_name(attr);
                self.code.emit_arg(Opcode::StoreAttr, attr);
            }
            TargetKind::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit(Opcode::StoreSubscr);
            }
            TargetKind::Unpack { targets, starred } => {
                match starred {
                    Some(before) => {
                        let after = targets.len() - before - 1;
                        if *before >= 0x100 || after >= 0x100_0000 {
                            return Err(CompileError::syntax(
                                "too many expressions in star-unpacking assignment",
                                target.line,
                            ));
                        }
                        self.code.emit_arg(Opcode::UnpackEx, to_u32(*before | after << 8));
                    }
                    None => self.code.emit_arg(Opcode::UnpackSequence, to_u32(targets.len())),
                }
                for target in targets {
                    self.compile_store(target)?;
                }
            }
        }
        self.code.set_location(saved);
        Ok(())
    }

    fn compile_delete(&mut self, target: &'a Target) -> CompileResult<()> {
        let saved = self.code.location();
        self.code.set_location(Some(target.line));
        match &target.kind {
            TargetKind::Name(name) => self.name_op(name, NameCtx::Delete),
            TargetKind::Attr { object, attr } => {
                self.compile_expr(object)?;
                let attr = self.code.add_name(attr);
                self.code.emit_arg(Opcode::DeleteAttr, attr);
            }
            TargetKind::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit(Opcode::DeleteSubscr);
            }
            TargetKind::Unpack { targets, starred } => {
                if starred.is_some() {
                    return Err(CompileError::syntax("cannot delete starred", target.line));
                }
                for target in targets {
                    self.compile_delete(target)?;
                }
            }
        }
        self.code.set_location(saved);
        Ok(())
    }

    fn compile_aug_assign(&mut self, target: &'a Target, op: Operator, value: &'a ExprLoc) -> CompileResult<()> {
        let line = self.code.location();
        self.code.set_location(Some(target.line));
        match &target.kind {
            TargetKind::Name(name) => self.name_op(name, NameCtx::Load),
            TargetKind::Attr { object, attr } => {
                self.compile_expr(object)?;
                self.code.emit_arg(Opcode::Copy, 1);
                let attr = self.code.add_name(attr);
                self.code.emit_arg(Opcode::LoadAttr, attr << 1);
            }
            TargetKind::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit_arg(Opcode::Copy, 2);
                self.code.emit_arg(Opcode::Copy, 2);
                self.code.emit(Opcode::BinarySubscr);
            }
            TargetKind::Unpack { .. } => {
                return Err(CompileError::syntax(
                    "'tuple' is an illegal expression for augmented assignment",
                    target.line,
                ));
            }
        }
        self.code.set_location(line);
        self.compile_expr(value)?;
        self.code.emit_arg(Opcode::BinaryOp, op as u32 + INPLACE_OFFSET);
        self.code.set_location(Some(target.line));
        match &target.kind {
            TargetKind::Name(name) => self.name_op(name, NameCtx::Store),
            TargetKind::Attr { attr, .. } => {
                self.code.emit_arg(Opcode::Swap, 2);
                let attr = self.code.add_name(attr);
                self.code.emit_arg(Opcode::StoreAttr, attr);
            }
            TargetKind::Subscript { .. } => {
                self.code.emit_arg(Opcode::Swap, 3);
                self.code.emit_arg(Opcode::Swap, 2);
                self.code.emit(Opcode::StoreSubscr);
            }
            TargetKind::Unpack { .. } => {}
        }
        self.code.set_location(line);
        Ok(())
    }

    /// `target: annotation [= value]`.
    ///
    /// Module and class bodies record simple names in `__annotations__` and evaluate the
    /// annotation of any other target; function bodies never evaluate annotations.
    fn compile_ann_assign(
        &mut self,
        target: &'a Target,
        annotation: &'a ExprLoc,
        value: Option<&'a ExprLoc>,
        simple: bool,
    ) -> CompileResult<()> {
        if let Some(value) = value {
            self.compile_expr(value)?;
            self.compile_store(target)?;
        }
        let records_annotations = !self.scope.kind.is_function_like();
        match &target.kind {
            TargetKind::Name(name) if simple && records_annotations => {
                self.compile_expr(annotation)?;
                let annotations = self.code.add_name("__annotations__");
                self.code.emit_arg(Opcode::LoadName, annotations);
                self.load_const(Constant::Str(name.clone()));
                self.code.emit(Opcode::StoreSubscr);
            }
            TargetKind::Attr { object, .. } if value.is_none() => self.check_ann_expr(object)?,
            TargetKind::Subscript { object, index } if value.is_none() => {
                self.check_ann_expr(object)?;
                self.check_ann_subscript(index)?;
            }
            _ => {}
        }
        if !simple && records_annotations {
            self.check_ann_expr(annotation)?;
        }
        Ok(())
    }

    /// Evaluates an expression for its side effects only.
    fn check_ann_expr(&mut self, expr: &'a ExprLoc) -> CompileResult<()> {
        self.compile_expr(expr)?;
        self.code.emit(Opcode::PopTop);
        Ok(())
    }

    fn check_ann_subscript(&mut self, index: &'a ExprLoc) -> CompileResult<()> {
        match &index.expr {
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.check_ann_expr(part)?;
                }
                Ok(())
            }
            Expr::Tuple(items) if constant_value(index).is_none() => {
                items.iter().try_for_each(|item| self.check_ann_subscript(item))
            }
            _ => self.check_ann_expr(index),
        }
    }

    fn compile_return(&mut self, line: u32, value: Option<&'a ExprLoc>) -> CompileResult<()> {
        if self.scope.kind != ScopeKind::Function {
            return Err(CompileError::syntax("'return' outside function", line));
        }
        match value.map(|value| (value, constant_value(value))) {
            Some((value, None)) => {
                self.compile_expr(value)?;
                self.unwind_fblocks(true, false)?;
                self.code.emit(Opcode::ReturnValue);
            }
            Some((value, Some(constant))) => {
                self.code.set_location(Some(value.line));
                self.unwind_fblocks(false, false)?;
                self.return_const(constant);
            }
            None => {
                self.unwind_fblocks(false, false)?;
                self.return_const(Constant::None);
            }
        }
        Ok(())
    }

    fn compile_if(&mut self, test: &'a ExprLoc, body: &'a [Stmt], or_else: &'a [Stmt]) -> CompileResult<()> {
        let next = self.compile_jump_if(test, false)?;
        self.compile_stmts(body)?;
        if or_else.is_empty() {
            self.patch_all(next);
        } else {
            let end = self.code.is_reachable().then(|| self.code.emit_jump(Opcode::JumpForward));
            self.patch_all(next);
            self.compile_stmts(or_else)?;
            if let Some(end) = end {
                self.code.patch_jump(end);
            }
        }
        Ok(())
    }

    /// The test is compiled twice: once on entry and once at the bottom of the body, where it
    /// jumps back to the body while true.
    fn compile_while(
        &mut self,
        line: u32,
        test: &'a ExprLoc,
        body: &'a [Stmt],
        or_else: &'a [Stmt],
    ) -> CompileResult<()> {
        let start = self.code.current_position();
        let breaks = self.new_break_list();
        self.fblocks.push(FBlock::WhileLoop { start, breaks });
        let mut exits = self.compile_jump_if(test, false)?;
        let body_start = self.code.current_position();
        self.compile_stmts(body)?;
        if self.code.is_reachable() {
            self.code.set_location(Some(line));
            exits.extend(self.compile_jump_if(test, false)?);
            self.code.emit_jump_to(Opcode::JumpBackward, body_start);
        }
        self.fblocks.pop();
        self.patch_all(exits);
        self.compile_stmts(or_else)?;
        let breaks = std::mem::take(&mut self.break_lists[breaks]);
        self.patch_all(breaks);
        Ok(())
    }

    fn compile_for(
        &mut self,
        line: u32,
        target: &'a Target,
        iter: &'a ExprLoc,
        body: &'a [Stmt],
        or_else: &'a [Stmt],
    ) -> CompileResult<()> {
        self.compile_folded(iter, iterable_constant(iter))?;
        self.code.emit(Opcode::GetIter);
        let start = self.code.current_position();
        let exhausted = self.code.emit_jump(Opcode::ForIter);
        let breaks = self.new_break_list();
        self.fblocks.push(FBlock::ForLoop { start, breaks });
        self.compile_store(target)?;
        self.compile_stmts(body)?;
        if self.code.is_reachable() {
            self.code.emit_jump_to(Opcode::JumpBackward, start);
        }
        self.fblocks.pop();
        self.code.patch_jump(exhausted);
        self.code.set_location(Some(line));
        self.code.emit(Opcode::EndFor);
        self.compile_stmts(or_else)?;
        let breaks = std::mem::take(&mut self.break_lists[breaks]);
        self.patch_all(breaks);
        Ok(())
    }

    fn compile_break(&mut self, line: u32) -> CompileResult<()> {
        let Some((block, (_, breaks))) = self
            .unwind_fblocks(false, true)?
            .and_then(|block| block.loop_target().map(|target| (block, target)))
        else {
            return Err(CompileError::syntax("'break' outside loop", line));
        };
        self.unwind_fblock(block, false)?;
        let jump = self.code.emit_jump(Opcode::JumpForward);
        self.break_lists[breaks].push(jump);
        Ok(())
    }

    fn compile_continue(&mut self, line: u32) -> CompileResult<()> {
        let Some((start, _)) = self.unwind_fblocks(false, true)?.and_then(FBlock::loop_target) else {
            return Err(CompileError::syntax("'continue' not properly in loop", line));
        };
        self.code.emit_jump_to(Opcode::JumpBackward, start);
        Ok(())
    }

    fn new_break_list(&mut self) -> usize {
        self.break_lists.push(Vec::new());
        self.break_lists.len() - 1
    }

    /// Emits the cleanup of every active block from the innermost outwards, stopping at the
    /// innermost loop when `stop_at_loop` is set. That loop is returned, not unwound.
    ///
    /// `preserve_tos` keeps the value on top of the stack (a return value) above the cleanup.
    fn unwind_fblocks(&mut self, preserve_tos: bool, stop_at_loop: bool) -> CompileResult<Option<FBlock<'a>>> {
        let saved = self.fblocks.clone();
        let mut result = Ok(None);
        while let Some(block) = self.fblocks.pop() {
            if stop_at_loop && block.loop_target().is_some() {
                result = Ok(Some(block));
                break;
            }
            if let Err(error) = self.unwind_fblock(block, preserve_tos) {
                result = Err(error);
                break;
            }
        }
        self.fblocks = saved;
        result
    }

    fn unwind_fblock(&mut self, block: FBlock<'a>, preserve_tos: bool) -> CompileResult<()> {
        match block {
            FBlock::WhileLoop { .. } | FBlock::TryExcept | FBlock::ExceptionHandler => {}
            FBlock::ForLoop { .. } | FBlock::PopValue => {
                if preserve_tos {
                    self.code.emit_arg(Opcode::Swap, 2);
                }
                self.code.emit(Opcode::PopTop);
            }
            FBlock::FinallyTry { body } => {
                // the enclosing blocks are already popped, so the clause unwinds only past them
                if preserve_tos {
                    self.fblocks.push(FBlock::PopValue);
                }
                self.compile_stmts(body)?;
                if preserve_tos {
                    self.fblocks.pop();
                }
            }
            FBlock::FinallyEnd => {
                if preserve_tos {
                    self.code.emit_arg(Opcode::Swap, 2);
                }
                self.code.emit(Opcode::PopTop);
                if preserve_tos {
                    self.code.emit_arg(Opcode::Swap, 2);
                }
                self.code.emit(Opcode::PopExcept);
            }
            FBlock::HandlerCleanup { name } => {
                if preserve_tos {
                    self.code.emit_arg(Opcode::Swap, 2);
                }
                self.code.emit(Opcode::PopExcept);
                if let Some(name) = name {
                    self.clear_handler_name(name);
                }
            }
            FBlock::With { line } => {
                // whatever follows the exit call stays on the `with` line
                self.code.set_location(Some(line));
                if preserve_tos {
                    self.code.emit_arg(Opcode::Swap, 2);
                }
                self.call_exit_with_nones();
                self.code.emit(Opcode::PopTop);
            }
        }
        Ok(())
    }

    fn compile_try_except(&mut self, try_: &'a Try) -> CompileResult<()> {
        self.code.emit(Opcode::Nop);
        self.fblocks.push(FBlock::TryExcept);
        self.compile_stmts(&try_.body)?;
        self.fblocks.pop();
        self.compile_stmts(&try_.or_else)?;
        let mut ends = Vec::new();
        if self.code.is_reachable() {
            ends.push(self.code.emit_jump(Opcode::JumpForward));
        }

        self.code.set_location(None);
        self.code.emit(Opcode::PushExcInfo);
        self.fblocks.push(FBlock::ExceptionHandler);
        let last = try_.handlers.len().saturating_sub(1);
        for (index, handler) in try_.handlers.iter().enumerate() {
            self.code.set_location(Some(handler.line));
            let no_match = match &handler.exc_type {
                Some(exc_type) => {
                    self.compile_expr(exc_type)?;
                    self.code.emit(Opcode::CheckExcMatch);
                    Some(self.code.emit_jump(Opcode::PopJumpIfFalse))
                }
                None if index < last => {
                    return Err(CompileError::syntax("default 'except:' must be last", handler.line));
                }
                None => None,
            };
            match handler.name.as_deref() {
                Some(name) => {
                    self.name_op(name, NameCtx::Store);
                    self.fblocks.push(FBlock::HandlerCleanup { name: Some(name) });
                    self.compile_stmts(&handler.body)?;
                    self.fblocks.pop();
                    if self.code.is_reachable() {
                        self.code.emit(Opcode::PopExcept);
                        self.clear_handler_name(name);
                        ends.push(self.code.emit_jump(Opcode::JumpForward));
                    }
                    // the handler body raised: clear the name and re-raise
                    self.code.set_location(None);
                    self.clear_handler_name(name);
                    self.code.emit_arg(Opcode::Reraise, 1);
                }
                None => {
                    self.code.emit(Opcode::PopTop);
                    self.fblocks.push(FBlock::HandlerCleanup { name: None });
                    self.compile_stmts(&handler.body)?;
                    self.fblocks.pop();
                    if self.code.is_reachable() {
                        self.code.emit(Opcode::PopExcept);
                        ends.push(self.code.emit_jump(Opcode::JumpForward));
                    }
                }
            }
            if let Some(no_match) = no_match {
                self.code.patch_jump(no_match);
            }
        }
        self.fblocks.pop();
        self.code.set_location(None);
        if try_.handlers.last().is_some_and(|h| h.exc_type.is_some()) {
            self.code.emit_arg(Opcode::Reraise, 0);
        }
        self.pop_except_and_reraise();
        self.patch_all(ends);
        Ok(())
    }

    /// The `finally` clause is compiled twice: inline on the normal path and once more for the
    /// exceptional path, which re-raises afterwards.
    fn compile_try_finally(&mut self, try_: &'a Try) -> CompileResult<()> {
        self.code.emit(Opcode::Nop);
        self.fblocks.push(FBlock::FinallyTry { body: &try_.finally });
        if try_.handlers.is_empty() {
            self.compile_stmts(&try_.body)?;
        } else {
            self.compile_try_except(try_)?;
        }
        self.fblocks.pop();
        let mut exit = None;
        if self.code.is_reachable() {
            self.compile_stmts(&try_.finally)?;
            if self.code.is_reachable() {
                exit = Some(self.code.emit_jump(Opcode::JumpForward));
            }
        }

        self.code.set_location(None);
        self.code.emit(Opcode::PushExcInfo);
        self.fblocks.push(FBlock::FinallyEnd);
        self.compile_stmts(&try_.finally)?;
        self.fblocks.pop();
        if self.code.is_reachable() {
            self.code.set_location(None);
            self.code.emit_arg(Opcode::Reraise, 0);
        }
        self.pop_except_and_reraise();
        if let Some(exit) = exit {
            self.code.patch_jump(exit);
        }
        Ok(())
    }

    /// One context manager per item, the first item outermost. Leaving the body normally calls
    /// `__exit__(None, None, None)`; an exception calls it through `WITH_EXCEPT_START` and is
    /// swallowed when the result is true.
    fn compile_with(&mut self, line: u32, items: &'a [WithItem], body: &'a [Stmt]) -> CompileResult<()> {
        let Some((item, rest)) = items.split_first() else {
            return self.compile_stmts(body);
        };
        self.compile_expr(&item.context)?;
        self.code.set_location(Some(line));
        self.code.emit(Opcode::BeforeWith);
        self.fblocks.push(FBlock::With { line });
        match &item.target {
            Some(target) => self.compile_store(target)?,
            None => self.code.emit(Opcode::PopTop),
        }
        self.compile_with(line, rest, body)?;
        self.fblocks.pop();
        let mut exits = Vec::new();
        if self.code.is_reachable() {
            self.code.set_location(Some(line));
            self.call_exit_with_nones();
            self.code.emit(Opcode::PopTop);
            exits.push(self.code.emit_jump(Opcode::JumpForward));
        }

        self.code.set_location(Some(line));
        self.code.emit(Opcode::PushExcInfo);
        self.code.emit(Opcode::WithExceptStart);
        self.code.set_location(None);
        let suppress = self.code.emit_jump(Opcode::PopJumpIfTrue);
        self.code.emit_arg(Opcode::Reraise, 2);
        self.code.patch_jump(suppress);
        self.code.emit(Opcode::PopTop);
        self.code.emit(Opcode::PopExcept);
        self.code.emit(Opcode::PopTop);
        self.code.emit(Opcode::PopTop);
        exits.push(self.code.emit_jump(Opcode::JumpForward));
        self.pop_except_and_reraise();
        self.patch_all(exits);
        Ok(())
    }

    /// `__exit__(None, None, None)` for a `with` left without an exception.
    fn call_exit_with_nones(&mut self) {
        for _ in 0..3 {
            self.load_const(Constant::None);
        }
        self.code.emit_arg(Opcode::Call, 2);
    }

    /// Cleanup run when an exception escapes a handler: restore the previous exception and
    /// re-raise.
    fn pop_except_and_reraise(&mut self) {
        self.code.set_location(None);
        self.code.emit_arg(Opcode::Copy, 3);
        self.code.emit(Opcode::PopExcept);
        self.code.emit_arg(Opcode::Reraise, 1);
    }

    /// `name = None; del name` for the target of `except ... as name`.
    fn clear_handler_name(&mut self, name: &str) {
        self.load_const(Constant::None);
        self.name_op(name, NameCtx::Store);
        self.name_op(name, NameCtx::Delete);
    }
}

/// Container built by a display or by the positional arguments of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    List,
    Tuple,
    Set,
}

impl Collection {
    /// Tuples are assembled as lists and converted once complete.
    fn build(self) -> Opcode {
        match self {
            Self::List | Self::Tuple => Opcode::BuildList,
            Self::Set => Opcode::BuildSet,
        }
    }

    fn add(self) -> Opcode {
        match self {
            Self::List | Self::Tuple => Opcode::ListAppend,
            Self::Set => Opcode::SetAdd,
        }
    }

    fn extend(self) -> Opcode {
        match self {
            Self::List | Self::Tuple => Opcode::ListExtend,
            Self::Set => Opcode::SetUpdate,
        }
    }
}

// expressions
impl<'a> Compiler<'a> {
    /// Pushes the value of `expr`, emitted at the expression's own line.
    fn compile_expr(&mut self, expr: &'a ExprLoc) -> CompileResult<()> {
        let saved = self.code.location();
        self.code.set_location(Some(expr.line));
        let result = self.compile_expr_at_line(expr);
        self.code.set_location(saved);
        result
    }

    fn compile_expr_at_line(&mut self, expr: &'a ExprLoc) -> CompileResult<()> {
        if let Some(constant) = constant_value(expr) {
            self.load_const(constant);
            return Ok(());
        }
        match &expr.expr {
            Expr::Literal(literal) => self.load_const(literal_constant(literal)),
            Expr::Name(name) => self.name_op(name, NameCtx::Load),
            Expr::BinOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.code.emit_arg(Opcode::BinaryOp, *op as u32);
            }
            Expr::BoolOp { op, values } => self.compile_bool_op(*op, values)?,
            Expr::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOperator::Not => self.code.emit(Opcode::UnaryNot),
                    UnaryOperator::Neg => self.code.emit(Opcode::UnaryNegative),
                    UnaryOperator::Invert => self.code.emit(Opcode::UnaryInvert),
                    UnaryOperator::Pos => self.code.emit_arg(Opcode::CallIntrinsic1, INTRINSIC_UNARY_POSITIVE),
                }
            }
            Expr::Compare { left, comparisons } => self.compile_compare(left, comparisons)?,
            Expr::Call { func, args, keywords } => self.compile_call(func, args, keywords)?,
            Expr::Attribute { object, attr } => {
                self.compile_expr(object)?;
                let attr = self.code.add_name(attr);
                self.code.emit_arg(Opcode::LoadAttr, attr << 1);
            }
            Expr::Subscript { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.code.emit(Opcode::BinarySubscr);
            }
            Expr::Slice { lower, upper, step } => {
                self.compile_optional(lower.as_deref())?;
                self.compile_optional(upper.as_deref())?;
                let mut count = 2;
                if let Some(step) = step {
                    self.compile_expr(step)?;
                    count += 1;
                }
                self.code.emit_arg(Opcode::BuildSlice, count);
            }
            Expr::List(items) => self.starunpack(items, 0, Collection::List)?,
            Expr::Tuple(items) => self.starunpack(items, 0, Collection::Tuple)?,
            Expr::Set(items) => self.starunpack(items, 0, Collection::Set)?,
            Expr::Dict(items) => self.compile_dict(items)?,
            Expr::IfElse { test, body, orelse } => {
                let next = self.compile_jump_if(test, false)?;
                self.compile_expr(body)?;
                let end = self.code.emit_jump(Opcode::JumpForward);
                self.patch_all(next);
                self.compile_expr(orelse)?;
                self.code.patch_jump(end);
            }
            Expr::Lambda(def) => {
                let flags = self.compile_defaults(&def.parameters)?;
                let code = self.compile_function_body(def, def.line, None)?;
                self.make_closure(code, flags);
            }
            Expr::Comprehension(comp) => self.compile_comprehension(expr.line, comp)?,
            Expr::FString(parts) => self.compile_fstring(parts)?,
            Expr::Starred(_) => {
                return Err(CompileError::syntax("can't use starred expression here", expr.line));
            }
            Expr::Named { target, value } => {
                self.compile_expr(value)?;
                self.code.emit_arg(Opcode::Copy, 1);
                self.name_op(target, NameCtx::Store);
            }
            Expr::Yield(value) => {
                self.compile_optional(value.as_deref())?;
                self.emit_yield();
            }
        }
        Ok(())
    }

    /// Pushes `expr`, or `None` when absent.
    fn compile_optional(&mut self, expr: Option<&'a ExprLoc>) -> CompileResult<()> {
        match expr {
            Some(expr) => self.compile_expr(expr),
            None => {
                self.load_const(Constant::None);
                Ok(())
            }
        }
    }

    /// Pushes `expr` using a value folded for its context when there is one.
    fn compile_folded(&mut self, expr: &'a ExprLoc, folded: Option<Constant>) -> CompileResult<()> {
        match folded {
            Some(constant) => {
                let saved = self.code.location();
                self.code.set_location(Some(expr.line));
                self.load_const(constant);
                self.code.set_location(saved);
                Ok(())
            }
            None => self.compile_expr(expr),
        }
    }

    /// Yields the value on top of the stack and pushes the value sent back in.
    fn emit_yield(&mut self) {
        let handlers = self.fblocks.iter().filter(|block| block.handles_exceptions()).count();
        self.code.emit_arg(Opcode::YieldValue, to_u32(1 + handlers));
        self.code.emit_arg(Opcode::Resume, 1);
    }

    /// Short-circuit evaluation leaving the deciding operand on the stack.
    fn compile_bool_op(&mut self, op: BoolOperator, values: &'a [ExprLoc]) -> CompileResult<()> {
        let jump = match op {
            BoolOperator::And => Opcode::PopJumpIfFalse,
            BoolOperator::Or => Opcode::PopJumpIfTrue,
        };
        let Some((last, init)) = values.split_last() else {
            return Ok(());
        };
        let mut ends = Vec::with_capacity(init.len());
        for value in init {
            self.compile_expr(value)?;
            self.code.emit_arg(Opcode::Copy, 1);
            ends.push(self.code.emit_jump(jump));
            self.code.emit(Opcode::PopTop);
        }
        self.compile_expr(last)?;
        self.patch_all(ends);
        Ok(())
    }

    /// `a < b < c` evaluates `b` once and stops at the first false link.
    fn compile_compare(&mut self, left: &'a ExprLoc, comparisons: &'a [(CmpOperator, ExprLoc)]) -> CompileResult<()> {
        self.compile_expr(left)?;
        let Some(((last_op, last), init)) = comparisons.split_last() else {
            return Ok(());
        };
        let mut cleanups = Vec::with_capacity(init.len());
        for (op, comparator) in init {
            self.compile_folded(comparator, comparison_operand(*op, comparator))?;
            self.code.emit_arg(Opcode::Swap, 2);
            self.code.emit_arg(Opcode::Copy, 2);
            self.emit_compare(*op);
            self.code.emit_arg(Opcode::Copy, 1);
            cleanups.push(self.code.emit_jump(Opcode::PopJumpIfFalse));
            self.code.emit(Opcode::PopTop);
        }
        self.compile_folded(last, comparison_operand(*last_op, last))?;
        self.emit_compare(*last_op);
        if !cleanups.is_empty() {
            let end = self.code.emit_jump(Opcode::JumpForward);
            self.patch_all(cleanups);
            self.code.emit_arg(Opcode::Swap, 2);
            self.code.emit(Opcode::PopTop);
            self.code.patch_jump(end);
        }
        Ok(())
    }

    fn emit_compare(&mut self, op: CmpOperator) {
        let index = match op {
            CmpOperator::Is => return self.code.emit_arg(Opcode::IsOp, 0),
            CmpOperator::IsNot => return self.code.emit_arg(Opcode::IsOp, 1),
            CmpOperator::In => return self.code.emit_arg(Opcode::ContainsOp, 0),
            CmpOperator::NotIn => return self.code.emit_arg(Opcode::ContainsOp, 1),
            CmpOperator::Lt => 0,
            CmpOperator::LtE => 1,
            CmpOperator::Eq => 2,
            CmpOperator::NotEq => 3,
            CmpOperator::Gt => 4,
            CmpOperator::GtE => 5,
        };
        self.code.emit_arg(Opcode::CompareOp, to_u32(index) << 4 | COMPARE_MASKS[index]);
    }

    /// Evaluates `test` for control flow and jumps when its truth equals `cond`.
    ///
    /// Returns the jumps taken, to be patched by the caller to the destination; falling through
    /// means the test had the other truth value. Nothing is left on the stack either way.
    fn compile_jump_if(&mut self, test: &'a ExprLoc, cond: bool) -> CompileResult<Vec<JumpLabel>> {
        let saved = self.code.location();
        self.code.set_location(Some(test.line));
        let result = self.jump_if_at_line(test, cond);
        self.code.set_location(saved);
        result
    }

    fn jump_if_at_line(&mut self, test: &'a ExprLoc, cond: bool) -> CompileResult<Vec<JumpLabel>> {
        if let Some(truth) = constant_value(test).as_ref().and_then(truthiness) {
            if truth == cond {
                return Ok(vec![self.code.emit_jump(Opcode::JumpForward)]);
            }
            self.code.emit(Opcode::Nop);
            return Ok(Vec::new());
        }
        match &test.expr {
            Expr::Unary {
                op: UnaryOperator::Not,
                operand,
            } => return self.compile_jump_if(operand, !cond),
            Expr::BoolOp { op, values } => {
                let Some((last, init)) = values.split_last() else {
                    return Ok(Vec::new());
                };
                // `or` short-circuits on true, `and` on false
                let short_circuit = *op == BoolOperator::Or;
                let mut jumps = Vec::new();
                let mut skips = Vec::new();
                for value in init {
                    let labels = self.compile_jump_if(value, short_circuit)?;
                    if short_circuit == cond {
                        jumps.extend(labels);
                    } else {
                        skips.extend(labels);
                    }
                }
                jumps.extend(self.compile_jump_if(last, cond)?);
                self.patch_all(skips);
                return Ok(jumps);
            }
            Expr::IfElse { test: inner, body, orelse } => {
                let otherwise = self.compile_jump_if(inner, false)?;
                let mut jumps = self.compile_jump_if(body, cond)?;
                let end = self.code.emit_jump(Opcode::JumpForward);
                self.patch_all(otherwise);
                jumps.extend(self.compile_jump_if(orelse, cond)?);
                self.code.patch_jump(end);
                return Ok(jumps);
            }
            Expr::Compare { left, comparisons } if comparisons.len() > 1 => {
                return self.compare_jump_if(left, comparisons, cond);
            }
            Expr::Compare { left, comparisons } => {
                if let [(op @ (CmpOperator::Is | CmpOperator::IsNot), right)] = comparisons.as_slice()
                    && matches!(right.expr, Expr::Literal(Literal::None))
                {
                    self.compile_expr(left)?;
                    let jump_if_none = (*op == CmpOperator::Is) == cond;
                    let opcode = if jump_if_none {
                        Opcode::PopJumpIfNone
                    } else {
                        Opcode::PopJumpIfNotNone
                    };
                    return Ok(vec![self.code.emit_jump(opcode)]);
                }
            }
            _ => {}
        }
        self.compile_expr(test)?;
        let opcode = if cond { Opcode::PopJumpIfTrue } else { Opcode::PopJumpIfFalse };
        Ok(vec![self.code.emit_jump(opcode)])
    }

    /// Chained comparison used as a condition.
    fn compare_jump_if(
        &mut self,
        left: &'a ExprLoc,
        comparisons: &'a [(CmpOperator, ExprLoc)],
        cond: bool,
    ) -> CompileResult<Vec<JumpLabel>> {
        self.compile_expr(left)?;
        let Some(((last_op, last), init)) = comparisons.split_last() else {
            return Ok(Vec::new());
        };
        let mut cleanups = Vec::with_capacity(init.len());
        for (op, comparator) in init {
            self.compile_folded(comparator, comparison_operand(*op, comparator))?;
            self.code.emit_arg(Opcode::Swap, 2);
            self.code.emit_arg(Opcode::Copy, 2);
            self.emit_compare(*op);
            cleanups.push(self.code.emit_jump(Opcode::PopJumpIfFalse));
        }
        self.compile_folded(last, comparison_operand(*last_op, last))?;
        self.emit_compare(*last_op);
        let opcode = if cond { Opcode::PopJumpIfTrue } else { Opcode::PopJumpIfFalse };
        let mut jumps = vec![self.code.emit_jump(opcode)];
        let end = self.code.emit_jump(Opcode::JumpForward);
        // a link failed: drop the operand still on the stack, the whole test is false
        self.patch_all(cleanups);
        self.code.emit(Opcode::PopTop);
        if !cond {
            jumps.push(self.code.emit_jump(Opcode::JumpForward));
        }
        self.code.patch_jump(end);
        Ok(jumps)
    }

    /// Builds a list, tuple or set display, or the positional arguments of a call.
    ///
    /// `pushed` items are already on the stack and become the first elements.
    fn starunpack(&mut self, items: &'a [ExprLoc], pushed: usize, kind: Collection) -> CompileResult<()> {
        let count = items.len();
        if kind != Collection::Set
            && count > 2
            && let Some(constants) = all_constant(items)
        {
            if kind == Collection::Tuple && pushed == 0 {
                self.load_const(Constant::Tuple(constants));
            } else {
                self.code.emit_arg(kind.build(), to_u32(pushed));
                self.load_const(Constant::Tuple(constants));
                self.code.emit_arg(kind.extend(), 1);
                if kind == Collection::Tuple {
                    self.code.emit_arg(Opcode::CallIntrinsic1, INTRINSIC_LIST_TO_TUPLE);
                }
            }
            return Ok(());
        }

        let big = count + pushed > STACK_USE_GUIDELINE;
        if !big && !items.iter().any(is_starred) {
            for item in items {
                self.compile_expr(item)?;
            }
            let build = if kind == Collection::Tuple {
                Opcode::BuildTuple
            } else {
                kind.build()
            };
            self.code.emit_arg(build, to_u32(count + pushed));
            return Ok(());
        }

        let mut built = false;
        if big {
            self.code.emit_arg(kind.build(), to_u32(pushed));
            built = true;
        }
        for (index, item) in items.iter().enumerate() {
            if let Expr::Starred(inner) = &item.expr {
                if !built {
                    self.code.emit_arg(kind.build(), to_u32(index + pushed));
                    built = true;
                }
                self.compile_expr(inner)?;
                self.code.emit_arg(kind.extend(), 1);
            } else {
                self.compile_expr(item)?;
                if built {
                    self.code.emit_arg(kind.add(), 1);
                }
            }
        }
        if kind == Collection::Tuple {
            self.code.emit_arg(Opcode::CallIntrinsic1, INTRINSIC_LIST_TO_TUPLE);
        }
        Ok(())
    }

    /// Dict display: runs of `key: value` pairs are built as maps and merged with `**` items.
    fn compile_dict(&mut self, items: &'a [DictItem]) -> CompileResult<()> {
        let mut pending = 0;
        let mut have_dict = false;
        for (index, item) in items.iter().enumerate() {
            if item.key.is_some() {
                if pending * 2 > STACK_USE_GUIDELINE {
                    self.compile_subdict(&items[index - pending..=index])?;
                    if have_dict {
                        self.code.emit_arg(Opcode::DictUpdate, 1);
                    }
                    have_dict = true;
                    pending = 0;
                } else {
                    pending += 1;
                }
                continue;
            }
            if pending > 0 {
                self.compile_subdict(&items[index - pending..index])?;
                if have_dict {
                    self.code.emit_arg(Opcode::DictUpdate, 1);
                }
                have_dict = true;
                pending = 0;
            }
            if !have_dict {
                self.code.emit_arg(Opcode::BuildMap, 0);
                have_dict = true;
            }
            self.compile_expr(&item.value)?;
            self.code.emit_arg(Opcode::DictUpdate, 1);
        }
        if pending > 0 {
            self.compile_subdict(&items[items.len() - pending..])?;
            if have_dict {
                self.code.emit_arg(Opcode::DictUpdate, 1);
            }
            have_dict = true;
        }
        if !have_dict {
            self.code.emit_arg(Opcode::BuildMap, 0);
        }
        Ok(())
    }

    /// A run of `key: value` items, all with keys.
    fn compile_subdict(&mut self, items: &'a [DictItem]) -> CompileResult<()> {
        let count = items.len();
        let big = count * 2 > STACK_USE_GUIDELINE;
        if count > 1
            && !big
            && let Some(keys) = items
                .iter()
                .map(|item| item.key.as_ref().and_then(constant_value))
                .collect::<Option<Vec<_>>>()
        {
            for item in items {
                self.compile_expr(&item.value)?;
            }
            self.load_const(Constant::Tuple(keys));
            self.code.emit_arg(Opcode::BuildConstKeyMap, to_u32(count));
            return Ok(());
        }
        if big {
            self.code.emit_arg(Opcode::BuildMap, 0);
        }
        for item in items {
            if let Some(key) = &item.key {
                self.compile_expr(key)?;
            }
            self.compile_expr(&item.value)?;
            if big {
                self.code.emit_arg(Opcode::MapAdd, 1);
            }
        }
        if !big {
            self.code.emit_arg(Opcode::BuildMap, to_u32(count));
        }
        Ok(())
    }

    fn compile_call(&mut self, func: &'a ExprLoc, args: &'a [ExprLoc], keywords: &'a [Keyword]) -> CompileResult<()> {
        check_keywords(keywords)?;
        if self.compile_method_call(func, args, keywords)? {
            return Ok(());
        }
        match &func.expr {
            Expr::Name(name)
                if matches!(
                    self.scope.name_scope(name),
                    NameScope::GlobalExplicit | NameScope::GlobalImplicit
                ) =>
            {
                let saved = self.code.location();
                self.code.set_location(Some(func.line));
                let name = self.code.add_name(name);
                self.code.emit_arg(Opcode::LoadGlobal, name << 1 | 1);
                self.code.set_location(saved);
            }
            _ => {
                let saved = self.code.location();
                self.code.set_location(Some(func.line));
                self.code.emit(Opcode::PushNull);
                self.code.set_location(saved);
                self.compile_expr(func)?;
            }
        }
        self.compile_call_helper(0, args, keywords)
    }

    /// `obj.method(args)` loads the method and `self` together, skipping the bound method.
    ///
    /// Returns `false`, having emitted nothing, when the call does not qualify.
    fn compile_method_call(
        &mut self,
        func: &'a ExprLoc,
        args: &'a [ExprLoc],
        keywords: &'a [Keyword],
    ) -> CompileResult<bool> {
        let Expr::Attribute { object, attr } = &func.expr else {
            return Ok(false);
        };
        if let Expr::Name(base) = &object.expr
            && self.context.module_imports.contains(base.as_str())
        {
            return Ok(false);
        }
        let kw_count = keywords.len();
        if args.len() + kw_count + usize::from(kw_count > 0) >= STACK_USE_GUIDELINE
            || args.iter().any(is_starred)
            || keywords.iter().any(|kw| kw.name.is_none())
        {
            return Ok(false);
        }
        let call_line = self.code.location();
        self.code.set_location(Some(func.line));
        self.compile_expr(object)?;
        let attr = self.code.add_name(attr);
        self.code.emit_arg(Opcode::LoadAttr, attr << 1 | 1);
        for arg in args {
            self.compile_expr(arg)?;
        }
        self.compile_keyword_values(keywords)?;
        self.code.set_location(call_line);
        self.code.emit_arg(Opcode::Call, to_u32(args.len() + kw_count));
        Ok(true)
    }

    /// Pushes the arguments and emits the call; `pushed` arguments are already on the stack.
    fn compile_call_helper(
        &mut self,
        pushed: usize,
        args: &'a [ExprLoc],
        keywords: &'a [Keyword],
    ) -> CompileResult<()> {
        let kw_count = keywords.len();
        let simple = args.len() + kw_count * 2 <= STACK_USE_GUIDELINE
            && !args.iter().any(is_starred)
            && !keywords.iter().any(|kw| kw.name.is_none());
        if simple {
            for arg in args {
                self.compile_expr(arg)?;
            }
            self.compile_keyword_values(keywords)?;
            self.code.emit_arg(Opcode::Call, to_u32(pushed + args.len() + kw_count));
            return Ok(());
        }

        // positional arguments as one tuple, keywords as one dict
        if let ([arg], 0) = (args, pushed)
            && let Expr::Starred(inner) = &arg.expr
        {
            self.compile_expr(inner)?;
        } else {
            self.starunpack(args, pushed, Collection::Tuple)?;
        }
        if kw_count > 0 {
            let mut pending = 0;
            let mut have_dict = false;
            for (index, keyword) in keywords.iter().enumerate() {
                if keyword.name.is_some() {
                    pending += 1;
                    continue;
                }
                if pending > 0 {
                    self.compile_subkwargs(&keywords[index - pending..index])?;
                    if have_dict {
                        self.code.emit_arg(Opcode::DictMerge, 1);
                    }
                    have_dict = true;
                    pending = 0;
                }
                if !have_dict {
                    self.code.emit_arg(Opcode::BuildMap, 0);
                    have_dict = true;
                }
                self.compile_expr(&keyword.value)?;
                self.code.emit_arg(Opcode::DictMerge, 1);
            }
            if pending > 0 {
                self.compile_subkwargs(&keywords[kw_count - pending..])?;
                if have_dict {
                    self.code.emit_arg(Opcode::DictMerge, 1);
                }
            }
        }
        self.code.emit_arg(Opcode::CallFunctionEx, u32::from(kw_count > 0));
        Ok(())
    }

    /// Pushes keyword argument values followed by `KW_NAMES` with their names.
    fn compile_keyword_values(&mut self, keywords: &'a [Keyword]) -> CompileResult<()> {
        if keywords.is_empty() {
            return Ok(());
        }
        for keyword in keywords {
            self.compile_expr(&keyword.value)?;
        }
        let names = keywords
            .iter()
            .filter_map(|kw| kw.name.clone())
            .map(Constant::Str)
            .collect();
        let names = self.code.add_const(Constant::Tuple(names));
        self.code.emit_arg(Opcode::KwNames, names);
        Ok(())
    }

    /// A run of named keyword arguments collected into a dict.
    fn compile_subkwargs(&mut self, keywords: &'a [Keyword]) -> CompileResult<()> {
        let count = keywords.len();
        let big = count * 2 > STACK_USE_GUIDELINE;
        if count > 1 && !big {
            for keyword in keywords {
                self.compile_expr(&keyword.value)?;
            }
            let names = keywords
                .iter()
                .filter_map(|kw| kw.name.clone())
                .map(Constant::Str)
                .collect();
            self.load_const(Constant::Tuple(names));
            self.code.emit_arg(Opcode::BuildConstKeyMap, to_u32(count));
            return Ok(());
        }
        if big {
            self.code.emit_arg(Opcode::BuildMap, 0);
        }
        for keyword in keywords {
            self.load_const(Constant::Str(keyword.name.clone().unwrap_or_default()));
            self.compile_expr(&keyword.value)?;
            if big {
                self.code.emit_arg(Opcode::MapAdd, 1);
            }
        }
        if !big {
            self.code.emit_arg(Opcode::BuildMap, to_u32(count));
        }
        Ok(())
    }

    fn compile_fstring(&mut self, parts: &'a [FStringPart]) -> CompileResult<()> {
        if parts.len() > STACK_USE_GUIDELINE {
            // too many parts for the stack: ''.join([...])
            self.load_const(Constant::Str(String::new()));
            let join = self.code.add_name("join");
            self.code.emit_arg(Opcode::LoadAttr, join << 1 | 1);
            self.code.emit_arg(Opcode::BuildList, 0);
            for part in parts {
                self.compile_fstring_part(part)?;
                self.code.emit_arg(Opcode::ListAppend, 1);
            }
            self.code.emit_arg(Opcode::Call, 1);
            return Ok(());
        }
        for part in parts {
            self.compile_fstring_part(part)?;
        }
        if parts.len() != 1 {
            self.code.emit_arg(Opcode::BuildString, to_u32(parts.len()));
        }
        Ok(())
    }

    fn compile_fstring_part(&mut self, part: &'a FStringPart) -> CompileResult<()> {
        match part {
            FStringPart::Literal(text) => self.load_const(Constant::Str(text.clone())),
            FStringPart::Interpolation {
                expr,
                conversion,
                format_spec,
            } => {
                self.compile_expr(expr)?;
                let mut arg = match conversion {
                    ConversionFlag::None => 0,
                    ConversionFlag::Str => 1,
                    ConversionFlag::Repr => 2,
                    ConversionFlag::Ascii => 3,
                };
                if let Some(spec) = format_spec {
                    self.compile_fstring(spec)?;
                    arg |= FORMAT_VALUE_WITH_SPEC;
                }
                self.code.emit_arg(Opcode::FormatValue, arg);
            }
        }
        Ok(())
    }
}

// nested units
impl<'a> Compiler<'a> {
    fn compile_function_def(&mut self, def: &'a FunctionDef) -> CompileResult<()> {
        self.compile_decorators(&def.decorators)?;
        let first_line = def.decorators.first().map_or(def.line, |d| d.line);
        let mut flags = self.compile_defaults(&def.parameters)?;
        if self.compile_annotations(def)? {
            flags |= MAKE_FUNCTION_ANNOTATIONS;
        }
        let code = self.compile_function_body(def, first_line, Some(&def.name))?;
        self.make_closure(code, flags);
        self.apply_decorators(&def.decorators);
        self.code.set_location(Some(def.line));
        self.name_op(&def.name, NameCtx::Store);
        Ok(())
    }

    /// Pushes positional and keyword-only defaults and returns the matching `MAKE_FUNCTION` flags.
    fn compile_defaults(&mut self, parameters: &'a Parameters) -> CompileResult<u32> {
        let mut flags = 0;
        let defaults: Vec<&ExprLoc> = parameters.positional_defaults().collect();
        if !defaults.is_empty() {
            match defaults.iter().map(|d| constant_value(d)).collect::<Option<Vec<_>>>() {
                Some(constants) => self.load_const(Constant::Tuple(constants)),
                None => {
                    for default in &defaults {
                        self.compile_expr(default)?;
                    }
                    self.code.emit_arg(Opcode::BuildTuple, to_u32(defaults.len()));
                }
            }
            flags |= MAKE_FUNCTION_DEFAULTS;
        }
        let mut kw_count = 0;
        for (name, default) in parameters.keyword_defaults() {
            self.load_const(Constant::Str(name.to_owned()));
            self.compile_expr(default)?;
            kw_count += 1;
        }
        if kw_count > 0 {
            self.code.emit_arg(Opcode::BuildMap, kw_count);
            flags |= MAKE_FUNCTION_KWDEFAULTS;
        }
        Ok(flags)
    }

    /// Pushes the annotations as a flat `(name, value, ...)` tuple; returns whether there were any.
    fn compile_annotations(&mut self, def: &'a FunctionDef) -> CompileResult<bool> {
        let mut annotations: Vec<(&str, &ExprLoc)> = def.parameters.annotations().collect();
        if let Some(returns) = &def.returns {
            annotations.push(("return", returns));
        }
        if annotations.is_empty() {
            return Ok(false);
        }
        let folded: Option<Vec<Constant>> = annotations
            .iter()
            .map(|(name, value)| Some([Constant::Str((*name).to_owned()), constant_value(value)?]))
            .collect::<Option<Vec<_>>>()
            .map(|pairs| pairs.into_iter().flatten().collect());
        match folded {
            Some(constants) => self.load_const(Constant::Tuple(constants)),
            None => {
                for (name, value) in &annotations {
                    self.load_const(Constant::Str((*name).to_owned()));
                    self.compile_expr(value)?;
                }
                self.code.emit_arg(Opcode::BuildTuple, to_u32(annotations.len() * 2));
            }
        }
        Ok(true)
    }

    /// Compiles the code object of a function or lambda.
    ///
    /// `binding` is the name the definition is stored under; lambdas have none.
    fn compile_function_body(
        &self,
        def: &'a FunctionDef,
        first_line: u32,
        binding: Option<&str>,
    ) -> CompileResult<Rc<CodeObject>> {
        let header = UnitHeader {
            scope: def.scope,
            name: &def.name,
            qualname: self.child_qualname(&def.name, binding),
            first_line,
        };
        let mut unit = self.child(&header, def.parameters.names());
        let doc = if def.is_lambda { None } else { docstring(&def.body) };
        let body = match doc {
            Some(doc) => {
                unit.code.add_const(Constant::Str(doc.to_owned()));
                &def.body[1..]
            }
            None => {
                unit.code.add_const(Constant::None);
                &def.body[..]
            }
        };
        unit.compile_stmts(body)?;
        unit.implicit_return();
        let parameters = &def.parameters;
        Ok(unit.finish(CodeInfo {
            name: header.name.to_owned(),
            qualname: header.qualname,
            first_line,
            arg_count: to_u32(parameters.positional_count()),
            posonly_arg_count: to_u32(parameters.posonly.len()),
            kwonly_arg_count: to_u32(parameters.kwonly.len()),
            ..CodeInfo::default()
        }))
    }

    fn compile_class_def(&mut self, class: &'a ClassDef) -> CompileResult<()> {
        self.compile_decorators(&class.decorators)?;
        let first_line = class.decorators.first().map_or(class.line, |d| d.line);
        let header = UnitHeader {
            scope: class.scope,
            name: &class.name,
            qualname: self.child_qualname(&class.name, Some(&class.name)),
            first_line,
        };
        let mut unit = self.child(&header, std::iter::empty());
        unit.compile_class_body(&class.body)?;
        let code = unit.finish(CodeInfo {
            name: class.name.clone(),
            qualname: header.qualname,
            first_line,
            ..CodeInfo::default()
        });

        self.code.set_location(Some(class.line));
        self.code.emit(Opcode::PushNull);
        self.code.emit(Opcode::LoadBuildClass);
        self.make_closure(code, 0);
        self.load_const(Constant::Str(class.name.clone()));
        self.compile_call_helper(2, &class.bases, &class.keywords)?;
        self.apply_decorators(&class.decorators);
        self.code.set_location(Some(class.line));
        self.name_op(&class.name, NameCtx::Store);
        Ok(())
    }

    fn compile_class_body(&mut self, body: &'a [Stmt]) -> CompileResult<()> {
        let name = self.code.add_name("__name__");
        self.code.emit_arg(Opcode::LoadName, name);
        let module = self.code.add_name("__module__");
        self.code.emit_arg(Opcode::StoreName, module);
        self.load_const(Constant::Str(self.qualname.clone()));
        let qualname = self.code.add_name("__qualname__");
        self.code.emit_arg(Opcode::StoreName, qualname);
        self.compile_body(body)?;
        if self.scope.needs_class_cell {
            // the cell lets zero-argument `super()` find the class once it exists
            let cell = self.deref_index("__class__");
            self.code.emit_arg(Opcode::LoadClosure, cell);
            self.code.emit_arg(Opcode::Copy, 1);
            let classcell = self.code.add_name("__classcell__");
            self.code.emit_arg(Opcode::StoreName, classcell);
            self.code.emit(Opcode::ReturnValue);
        } else {
            self.implicit_return();
        }
        Ok(())
    }

    fn compile_decorators(&mut self, decorators: &'a [ExprLoc]) -> CompileResult<()> {
        decorators.iter().try_for_each(|decorator| self.compile_expr(decorator))
    }

    /// Calls the decorators on the value on top of the stack, innermost first.
    fn apply_decorators(&mut self, decorators: &[ExprLoc]) {
        for decorator in decorators.iter().rev() {
            self.code.set_location(Some(decorator.line));
            self.code.emit_arg(Opcode::Call, 0);
        }
    }

    /// Creates a function object from `code`, passing the cells of its free variables.
    fn make_closure(&mut self, code: Rc<CodeObject>, mut flags: u32) {
        if !code.freevars().is_empty() {
            for name in code.freevars() {
                let cell = self.deref_index(name);
                self.code.emit_arg(Opcode::LoadClosure, cell);
            }
            self.code.emit_arg(Opcode::BuildTuple, to_u32(code.freevars().len()));
            flags |= MAKE_FUNCTION_CLOSURE;
        }
        let code = self.code.add_const(Constant::Code(code));
        self.code.emit_arg(Opcode::LoadConst, code);
        self.code.emit_arg(Opcode::MakeFunction, flags);
    }

    /// Comprehensions run in their own unit, called with the iterator of the outermost `for`.
    fn compile_comprehension(&mut self, line: u32, comp: &'a Comprehension) -> CompileResult<()> {
        let Some(outermost) = comp.generators.first() else {
            return Ok(());
        };
        let name = comp.kind.code_name();
        let header = UnitHeader {
            scope: comp.scope,
            name,
            qualname: self.child_qualname(name, None),
            first_line: line,
        };
        let mut unit = self.child(&header, [".0"]);
        match comp.kind {
            ComprehensionKind::List => unit.code.emit_arg(Opcode::BuildList, 0),
            ComprehensionKind::Set => unit.code.emit_arg(Opcode::BuildSet, 0),
            ComprehensionKind::Dict => unit.code.emit_arg(Opcode::BuildMap, 0),
            ComprehensionKind::Generator => {}
        }
        let body = ComprehensionBody {
            kind: comp.kind,
            element: &comp.element,
            value: comp.value.as_ref(),
        };
        unit.compile_generators(line, &comp.generators, 0, 0, body)?;
        if comp.kind == ComprehensionKind::Generator {
            unit.implicit_return();
        } else {
            unit.code.set_location(Some(line));
            unit.code.emit(Opcode::ReturnValue);
        }
        let code = unit.finish(CodeInfo {
            name: name.to_owned(),
            qualname: header.qualname,
            first_line: line,
            arg_count: 1,
            ..CodeInfo::default()
        });

        self.make_closure(code, 0);
        self.compile_folded(&outermost.iter, iterable_constant(&outermost.iter))?;
        self.code.emit(Opcode::GetIter);
        self.code.emit_arg(Opcode::Call, 0);
        Ok(())
    }

    /// The `for` clause at `index`, with the clauses nested in it.
    ///
    /// `depth` counts the iterators on the stack above the collection being built.
    fn compile_generators(
        &mut self,
        line: u32,
        generators: &'a [Generator],
        index: usize,
        depth: u32,
        body: ComprehensionBody<'a>,
    ) -> CompileResult<()> {
        let generator = &generators[index];
        let mut depth = depth;
        self.code.set_location(Some(line));
        let looping = if index == 0 {
            // the outermost iterator is the unit's argument
            self.code.emit_arg(Opcode::LoadFast, 0);
            true
        } else if let Some(item) = single_item(&generator.iter) {
            // `for y in [expr]` binds `y` without a loop
            self.compile_expr(item)?;
            false
        } else {
            self.compile_folded(&generator.iter, iterable_constant(&generator.iter))?;
            self.code.emit(Opcode::GetIter);
            true
        };
        let mut loop_jumps = None;
        if looping {
            depth += 1;
            let start = self.code.current_position();
            loop_jumps = Some((start, self.code.emit_jump(Opcode::ForIter)));
        }
        self.compile_store(&generator.target)?;
        let mut skips = Vec::new();
        for condition in &generator.ifs {
            skips.extend(self.compile_jump_if(condition, false)?);
        }
        if index + 1 < generators.len() {
            self.compile_generators(line, generators, index + 1, depth, body)?;
        } else {
            self.compile_comprehension_element(body, depth)?;
        }
        self.patch_all(skips);
        if let Some((start, exhausted)) = loop_jumps {
            self.code.set_location(Some(body.element.line));
            self.code.emit_jump_to(Opcode::JumpBackward, start);
            self.code.patch_jump(exhausted);
            self.code.set_location(Some(line));
            self.code.emit(Opcode::EndFor);
        }
        Ok(())
    }

    fn compile_comprehension_element(&mut self, body: ComprehensionBody<'a>, depth: u32) -> CompileResult<()> {
        self.compile_expr(body.element)?;
        if let Some(value) = body.value {
            self.compile_expr(value)?;
        }
        self.code.set_location(Some(body.element.line));
        match body.kind {
            ComprehensionKind::Generator => {
                self.emit_yield();
                self.code.emit(Opcode::PopTop);
            }
            ComprehensionKind::List => self.code.emit_arg(Opcode::ListAppend, depth + 1),
            ComprehensionKind::Set => self.code.emit_arg(Opcode::SetAdd, depth + 1),
            ComprehensionKind::Dict => self.code.emit_arg(Opcode::MapAdd, depth + 1),
        }
        Ok(())
    }
}

// names and constants
impl Compiler<'_> {
    fn name_op(&mut self, name: &str, ctx: NameCtx) {
        let (opcode, arg) = match self.scope.name_scope(name) {
            NameScope::Local => {
                let opcode = match ctx {
                    NameCtx::Load => Opcode::LoadFast,
                    NameCtx::Store => Opcode::StoreFast,
                    NameCtx::Delete => Opcode::DeleteFast,
                };
                (opcode, self.code.add_varname(name))
            }
            NameScope::Cell | NameScope::Free => {
                let opcode = match ctx {
                    NameCtx::Load => Opcode::LoadDeref,
                    NameCtx::Store => Opcode::StoreDeref,
                    NameCtx::Delete => Opcode::DeleteDeref,
                };
                (opcode, self.deref_index(name))
            }
            NameScope::GlobalExplicit | NameScope::GlobalImplicit => {
                let index = self.code.add_name(name);
                match ctx {
                    NameCtx::Load => (Opcode::LoadGlobal, index << 1),
                    NameCtx::Store => (Opcode::StoreGlobal, index),
                    NameCtx::Delete => (Opcode::DeleteGlobal, index),
                }
            }
            NameScope::Name => {
                let opcode = match ctx {
                    NameCtx::Load => Opcode::LoadName,
                    NameCtx::Store => Opcode::StoreName,
                    NameCtx::Delete => Opcode::DeleteName,
                };
                (opcode, self.code.add_name(name))
            }
        };
        self.code.emit_arg(opcode, arg);
    }

    /// Index of a cell or free variable among `cellvars` followed by `freevars`.
    ///
    /// The builder maps it onto the frame slot once all locals are known.
    fn deref_index(&self, name: &str) -> u32 {
        let index = self
            .scope
            .cellvars
            .iter()
            .chain(&self.scope.freevars)
            .position(|var| var == name)
            .expect("closure variables are resolved by scope analysis");
        to_u32(index)
    }

    fn load_const(&mut self, constant: Constant) {
        let index = self.code.add_const(constant);
        self.code.emit_arg(Opcode::LoadConst, index);
    }

    fn return_const(&mut self, constant: Constant) {
        let index = self.code.add_const(constant);
        self.code.emit_arg(Opcode::ReturnConst, index);
    }

    fn patch_all(&mut self, labels: Vec<JumpLabel>) {
        for label in labels {
            self.code.patch_jump(label);
        }
    }
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).expect("operand exceeds u32::MAX")
}

/// The docstring of a module, class or function body.
fn docstring(body: &[Stmt]) -> Option<&str> {
    match &body.first()?.node {
        Node::Expr(ExprLoc {
            expr: Expr::Literal(Literal::Str(doc)),
            ..
        }) => Some(doc.as_str()),
        _ => None,
    }
}

/// Whether a module or class body has annotated assignments, outside nested definitions.
fn contains_annotations(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match &stmt.node {
        Node::AnnAssign { .. } => true,
        Node::If { body, or_else, .. } | Node::While { body, or_else, .. } | Node::For { body, or_else, .. } => {
            contains_annotations(body) || contains_annotations(or_else)
        }
        Node::Try(try_) => {
            contains_annotations(&try_.body)
                || try_.handlers.iter().any(|h| contains_annotations(&h.body))
                || contains_annotations(&try_.or_else)
                || contains_annotations(&try_.finally)
        }
        Node::With { body, .. } => contains_annotations(body),
        _ => false,
    })
}

/// Collects the names bound by imports at module level, including inside control flow.
fn collect_imports(stmts: &[Stmt], imports: &mut AHashSet<String>) {
    for stmt in stmts {
        match &stmt.node {
            Node::Import(aliases) => imports.extend(aliases.iter().map(|a| a.binding().to_owned())),
            Node::ImportFrom { names, .. } => imports.extend(
                names
                    .iter()
                    .filter(|a| a.name != "*")
                    .map(|a| a.asname.as_ref().unwrap_or(&a.name).clone()),
            ),
            Node::If { body, or_else, .. } | Node::While { body, or_else, .. } | Node::For { body, or_else, .. } => {
                collect_imports(body, imports);
                collect_imports(or_else, imports);
            }
            Node::Try(try_) => {
                collect_imports(&try_.body, imports);
                for handler in &try_.handlers {
                    collect_imports(&handler.body, imports);
                }
                collect_imports(&try_.or_else, imports);
                collect_imports(&try_.finally, imports);
            }
            Node::With { body, .. } => collect_imports(body, imports),
            _ => {}
        }
    }
}

fn is_starred(expr: &ExprLoc) -> bool {
    matches!(expr.expr, Expr::Starred(_))
}

fn all_constant(items: &[ExprLoc]) -> Option<Vec<Constant>> {
    items.iter().map(constant_value).collect()
}

/// The item of a one-element, non-constant list or tuple display.
fn single_item(expr: &ExprLoc) -> Option<&ExprLoc> {
    match &expr.expr {
        Expr::List(items) | Expr::Tuple(items) if iterable_constant(expr).is_none() => match items.as_slice() {
            [item] if !is_starred(item) => Some(item),
            _ => None,
        },
        _ => None,
    }
}

fn check_keywords(keywords: &[Keyword]) -> CompileResult<()> {
    let mut seen = AHashSet::new();
    for keyword in keywords {
        if let Some(name) = &keyword.name
            && !seen.insert(name.as_str())
        {
            return Err(CompileError::syntax(
                format!("keyword argument repeated: {name}"),
                keyword.value.line,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileErrorKind;

    /// Disassembles a code object as `OPNAME operand` lines, without `RESUME` and generator setup.
    fn listing(code: &CodeObject) -> Vec<String> {
        code.instructions()
            .filter(|i| !matches!(i.opcode, Opcode::Resume | Opcode::ReturnGenerator | Opcode::CopyFreeVars))
            .map(|i| match (i.argrepr.is_empty(), i.arg) {
                (false, _) => format!("{} {}", i.opname, i.argrepr),
                (true, Some(arg)) => format!("{} {arg}", i.opname),
                (true, None) => i.opname.to_owned(),
            })
            .collect()
    }

    fn module(source: &str) -> Rc<CodeObject> {
        compile(source, "<test>").unwrap()
    }

    fn nested(code: &CodeObject, name: &str) -> Rc<CodeObject> {
        code.nested_units()
            .find(|unit| unit.name() == name)
            .cloned()
            .unwrap_or_else(|| panic!("no nested unit {name}"))
    }

    fn error(source: &str) -> CompileError {
        compile(source, "<test>").unwrap_err()
    }

    #[test]
    fn module_assignment_and_call() {
        let code = module("x = 1\nprint(x)\n");
        assert_eq!(
            listing(&code),
            vec![
                "LOAD_CONST 1",
                "STORE_NAME x",
                "PUSH_NULL",
                "LOAD_NAME print",
                "LOAD_NAME x",
                "CALL 1",
                "POP_TOP",
                "RETURN_CONST None",
            ]
        );
    }

    #[test]
    fn function_uses_fast_locals_and_globals() {
        let code = module("def f(a):\n    b = a + 1\n    return len(b)\n");
        let f = nested(&code, "f");
        assert_eq!(
            listing(&f),
            vec![
                "LOAD_FAST a",
                "LOAD_CONST 1",
                "BINARY_OP +",
                "STORE_FAST b",
                "LOAD_GLOBAL NULL + len",
                "LOAD_FAST b",
                "CALL 1",
                "RETURN_VALUE",
            ]
        );
        assert_eq!(f.arg_count(), 1);
        assert_eq!(f.varnames(), ["a", "b"]);
    }

    #[test]
    fn method_calls_load_the_method_with_self() {
        let code = module("def f(s):\n    return s.split(',', maxsplit=1)\n");
        assert_eq!(
            listing(&nested(&code, "f")),
            vec![
                "LOAD_FAST s",
                "LOAD_ATTR NULL|self + split",
                "LOAD_CONST ','",
                "LOAD_CONST 1",
                "KW_NAMES ('maxsplit',)",
                "CALL 2",
                "RETURN_VALUE",
            ]
        );
    }

    #[test]
    fn attribute_calls_on_imported_modules_are_not_method_calls() {
        let code = module("import os\nos.getcwd()\n");
        let ops = listing(&code);
        assert!(ops.contains(&"LOAD_ATTR getcwd".to_owned()), "{ops:?}");
        assert!(ops.contains(&"PUSH_NULL".to_owned()));
    }

    #[test]
    fn star_args_use_call_function_ex() {
        let code = module("f(*a, **k)\n");
        assert_eq!(
            listing(&code),
            vec![
                "PUSH_NULL",
                "LOAD_NAME f",
                "LOAD_NAME a",
                "BUILD_MAP 0",
                "LOAD_NAME k",
                "DICT_MERGE 1",
                "CALL_FUNCTION_EX 1",
                "POP_TOP",
                "RETURN_CONST None",
            ]
        );
    }

    #[test]
    fn if_else_exits_get_their_own_returns() {
        let code = module("if x:\n    a = 1\nelse:\n    a = 2\n");
        assert_eq!(
            listing(&code),
            vec![
                "LOAD_NAME x",
                "POP_JUMP_IF_FALSE to 12",
                "LOAD_CONST 1",
                "STORE_NAME a",
                "RETURN_CONST None",
                "LOAD_CONST 2",
                "STORE_NAME a",
                "RETURN_CONST None",
            ]
        );
        let lines: Vec<_> = code.instructions().map(|i| i.line).collect();
        assert_eq!(lines[5], Some(2));
        assert_eq!(lines[8], Some(4));
    }

    #[test]
    fn for_loop_shape() {
        let code = module("for i in [1, 2]:\n    print(i)\n");
        let ops = listing(&code);
        assert_eq!(ops[0], "LOAD_CONST (1, 2)");
        assert_eq!(ops[1], "GET_ITER");
        assert!(ops[2].starts_with("FOR_ITER"));
        assert_eq!(ops[3], "STORE_NAME i");
        assert!(ops.iter().any(|op| op.starts_with("JUMP_BACKWARD")));
        assert_eq!(ops[ops.len() - 2], "END_FOR");
    }

    #[test]
    fn while_loop_retests_at_the_bottom() {
        let code = module("while x < 3:\n    x += 1\n");
        let ops = listing(&code);
        let compares = ops.iter().filter(|op| op.as_str() == "COMPARE_OP <").count();
        assert_eq!(compares, 2);
        assert!(ops.contains(&"BINARY_OP +=".to_owned()));
    }

    #[test]
    fn swap_assignment_avoids_tuple() {
        let code = module("a, b = b, a\n");
        assert_eq!(
            listing(&code),
            vec!["LOAD_NAME b", "LOAD_NAME a", "SWAP 2", "STORE_NAME a", "STORE_NAME b", "RETURN_CONST None"]
        );
        let code = module("def f(a, b):\n    a, b = b, a\n");
        assert_eq!(
            listing(&nested(&code, "f"))[..4],
            ["LOAD_FAST b", "LOAD_FAST a", "STORE_FAST b", "STORE_FAST a"]
        );
    }

    #[test]
    fn closures_pass_cells() {
        let code = module("def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n");
        let outer = nested(&code, "outer");
        let ops = listing(&outer);
        assert_eq!(ops[0], "MAKE_CELL x");
        assert!(ops.contains(&"LOAD_CLOSURE x".to_owned()), "{ops:?}");
        assert!(ops.contains(&"MAKE_FUNCTION closure".to_owned()));
        let inner = nested(&outer, "inner");
        assert_eq!(inner.qualname(), "outer.<locals>.inner");
        assert_eq!(listing(&inner), vec!["LOAD_DEREF x", "RETURN_VALUE"]);
    }

    #[test]
    fn function_defaults_and_annotations() {
        let code = module("def f(a: int = 1, *, b=2) -> str:\n    pass\n");
        assert_eq!(
            listing(&code)[..6],
            [
                "LOAD_CONST (1,)",
                "LOAD_CONST 'b'",
                "LOAD_CONST 2",
                "BUILD_MAP 1",
                "LOAD_CONST 'a'",
                "LOAD_NAME int",
            ]
        );
        assert!(listing(&code).contains(&"MAKE_FUNCTION defaults, kwdefaults, annotations".to_owned()));
    }

    #[test]
    fn class_body_and_qualnames() {
        let code = module("class A(B):\n    x = 1\n    def m(self):\n        return super().m()\n");
        assert_eq!(listing(&code)[..2], ["PUSH_NULL", "LOAD_BUILD_CLASS"]);
        let class = nested(&code, "A");
        let body = listing(&class);
        assert_eq!(body[0], "MAKE_CELL __class__");
        assert_eq!(
            body[1..5],
            ["LOAD_NAME __name__", "STORE_NAME __module__", "LOAD_CONST 'A'", "STORE_NAME __qualname__"]
        );
        assert_eq!(body[body.len() - 3..], ["COPY 1", "STORE_NAME __classcell__", "RETURN_VALUE"]);
        assert_eq!(nested(&class, "m").qualname(), "A.m");
    }

    #[test]
    fn list_comprehension_is_a_nested_unit() {
        let code = module("ys = [x * 2 for x in xs if x]\n");
        let comp = nested(&code, "<listcomp>");
        assert_eq!(comp.arg_count(), 1);
        let ops = listing(&comp);
        assert_eq!(ops[0], "BUILD_LIST 0");
        assert_eq!(ops[1], "LOAD_FAST .0");
        assert!(ops.contains(&"LIST_APPEND 2".to_owned()));
        assert_eq!(ops.last().map(String::as_str), Some("RETURN_VALUE"));
        let outer = listing(&code);
        assert_eq!(outer[2..5], ["LOAD_NAME xs", "GET_ITER", "CALL 0"]);
    }

    #[test]
    fn generator_expression_yields() {
        let code = module("g = (x for x in xs)\n");
        let genexpr = nested(&code, "<genexpr>");
        assert!(genexpr.is_generator());
        let ops = listing(&genexpr);
        assert!(ops.contains(&"YIELD_VALUE 1".to_owned()));
        assert_eq!(ops[ops.len() - 2..], ["CALL_INTRINSIC_1 INTRINSIC_STOPITERATION_ERROR", "RERAISE 1"]);
    }

    #[test]
    fn try_except_with_name() {
        let code = module("try:\n    f()\nexcept E as e:\n    g(e)\n");
        let ops = listing(&code);
        assert_eq!(ops[0], "NOP");
        let handler = ["PUSH_EXC_INFO", "CHECK_EXC_MATCH", "STORE_NAME e", "POP_EXCEPT", "DELETE_NAME e", "RERAISE 0"];
        for expected in handler {
            assert!(ops.contains(&expected.to_owned()), "missing {expected}: {ops:?}");
        }
        assert_eq!(ops[ops.len() - 3..], ["COPY 3", "POP_EXCEPT", "RERAISE 1"]);
    }

    #[test]
    fn with_calls_exit_on_both_paths() {
        let code = module("with a as b:\n    c()\n");
        let ops = listing(&code);
        assert_eq!(ops[..3], ["LOAD_NAME a", "BEFORE_WITH", "STORE_NAME b"]);
        let call = ops.iter().position(|op| op == "CALL 2").unwrap();
        assert_eq!(
            ops[call - 3..=call + 1],
            ["LOAD_CONST None", "LOAD_CONST None", "LOAD_CONST None", "CALL 2", "POP_TOP"]
        );
        assert!(ops[call + 2].starts_with("JUMP_FORWARD"), "{ops:?}");

        let handler = ops.iter().position(|op| op == "PUSH_EXC_INFO").unwrap();
        assert_eq!(handler, call + 3);
        assert_eq!(ops[handler + 1], "WITH_EXCEPT_START");
        assert!(ops[handler + 2].starts_with("POP_JUMP_IF_TRUE"), "{ops:?}");
        assert_eq!(ops[handler + 3..handler + 8], ["RERAISE 2", "POP_TOP", "POP_EXCEPT", "POP_TOP", "POP_TOP"]);
        assert!(ops[handler + 8].starts_with("JUMP_FORWARD"), "{ops:?}");
        assert_eq!(ops[handler + 9..], ["COPY 3", "POP_EXCEPT", "RERAISE 1", "RETURN_CONST None"]);
    }

    #[test]
    fn with_without_target_pops_the_entered_value() {
        let code = module("with a, b:\n    pass\n");
        let ops = listing(&code);
        assert_eq!(ops[..6], ["LOAD_NAME a", "BEFORE_WITH", "POP_TOP", "LOAD_NAME b", "BEFORE_WITH", "POP_TOP"]);
        assert_eq!(ops.iter().filter(|op| *op == "WITH_EXCEPT_START").count(), 2);
    }

    #[test]
    fn return_inside_with_calls_exit_first() {
        let code = module("def f():\n    with a:\n        return g()\n");
        let f = nested(&code, "f");
        let ops = listing(&f);
        let swap = ops.iter().position(|op| op == "SWAP 2").unwrap();
        assert_eq!(
            ops[swap..swap + 7],
            ["SWAP 2", "LOAD_CONST None", "LOAD_CONST None", "LOAD_CONST None", "CALL 2", "POP_TOP", "RETURN_VALUE"]
        );
        // the body never falls through, so only the exceptional exit follows the return
        assert_eq!(ops[swap + 7], "PUSH_EXC_INFO");
        let return_line = f.instructions().find(|i| i.opcode == Opcode::ReturnValue).unwrap().line;
        assert_eq!(return_line, Some(2));
    }

    #[test]
    fn yield_inside_with_counts_the_handler() {
        let code = module("def f():\n    with a:\n        yield 1\n");
        assert!(listing(&nested(&code, "f")).contains(&"YIELD_VALUE 2".to_owned()));
    }

    #[test]
    fn return_through_finally_runs_the_clause() {
        let code = module("def f():\n    try:\n        return g()\n    finally:\n        h()\n");
        let ops = listing(&nested(&code, "f"));
        let swap = ops.iter().position(|op| op == "SWAP 2");
        assert!(swap.is_none(), "{ops:?}");
        let first_return = ops.iter().position(|op| op == "RETURN_VALUE").unwrap();
        assert!(ops[..first_return].contains(&"LOAD_GLOBAL NULL + h".to_owned()), "{ops:?}");
    }

    #[test]
    fn fstrings_format_values() {
        let code = module("s = f'{a!r:>{w}} and {b}'\n");
        assert_eq!(
            listing(&code)[..9],
            [
                "LOAD_NAME a",
                "LOAD_CONST '>'",
                "LOAD_NAME w",
                "FORMAT_VALUE 0",
                "BUILD_STRING 2",
                "FORMAT_VALUE repr, with format",
                "LOAD_CONST ' and '",
                "LOAD_NAME b",
                "FORMAT_VALUE 0",
            ]
        );
    }

    #[test]
    fn is_none_tests_jump_directly() {
        let code = module("if x is None:\n    y()\n");
        assert!(listing(&code)[1].starts_with("POP_JUMP_IF_NOT_NONE"));
    }

    #[test]
    fn imports() {
        let code = module("import a.b as c\nfrom d import e as f, g\n");
        assert_eq!(
            listing(&code),
            vec![
                "LOAD_CONST 0",
                "LOAD_CONST None",
                "IMPORT_NAME a.b",
                "IMPORT_FROM b",
                "STORE_NAME c",
                "POP_TOP",
                "LOAD_CONST 0",
                "LOAD_CONST ('e', 'g')",
                "IMPORT_NAME d",
                "IMPORT_FROM e",
                "STORE_NAME f",
                "IMPORT_FROM g",
                "STORE_NAME g",
                "POP_TOP",
                "RETURN_CONST None",
            ]
        );
    }

    #[test]
    fn docstrings_are_stored() {
        let code = module("'''Module doc.'''\ndef f():\n    'Function doc.'\n");
        assert_eq!(listing(&code)[..2], ["LOAD_CONST 'Module doc.'", "STORE_NAME __doc__"]);
        let f = nested(&code, "f");
        assert_eq!(f.consts()[0].to_string(), "'Function doc.'");
        assert_eq!(listing(&f), vec!["RETURN_CONST None"]);
    }

    #[test]
    fn unreachable_statements_are_dropped() {
        let code = module("def f():\n    return 1\n    g()\n");
        assert_eq!(listing(&nested(&code, "f")), vec!["RETURN_CONST 1"]);
    }

    #[test]
    fn compile_time_errors() {
        for (source, message) in [
            ("return 1\n", "'return' outside function"),
            ("break\n", "'break' outside loop"),
            ("continue\n", "'continue' not properly in loop"),
            ("f(a=1, a=2)\n", "keyword argument repeated: a"),
            ("try:\n    pass\nexcept:\n    pass\nexcept E:\n    pass\n", "default 'except:' must be last"),
        ] {
            let error = error(source);
            assert_eq!(error.kind(), CompileErrorKind::SyntaxError, "{source}");
            assert_eq!(error.message(), message, "{source}");
        }
    }

    #[test]
    fn errors_carry_their_line() {
        let error = error("x = 1\nif x:\n    break\n");
        assert_eq!(error.line(), 3);
    }
}
