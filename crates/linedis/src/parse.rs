//! Conversion of ruff's syntax tree into the compiler's own tree (`expressions.rs`).
//!
//! Byte ranges are resolved to 1-based line numbers here, scope ids are handed out to every
//! function, lambda, class and comprehension, and syntax the compiler does not lower is
//! rejected with a `NotImplementedError` naming the construct.

use std::borrow::Cow;

use num_bigint::BigInt;
use ruff_python_ast::{
    self as ast, BoolOp, CmpOp, ConversionFlag as RuffConversionFlag, ElifElseClause, Expr as AstExpr,
    InterpolatedStringElement, Number, Operator as AstOperator, Stmt as AstStmt, UnaryOp,
};
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextSize};

use crate::{
    error::CompileError,
    expressions::{
        BoolOperator, ClassDef, CmpOperator, Comprehension, ComprehensionKind, ConversionFlag, DictItem,
        ExceptHandler, Expr, ExprLoc, FStringPart, FunctionDef, Generator, ImportAlias, Keyword, Literal,
        MODULE_SCOPE, Module, Node, Operator, Param, Parameters, ScopeId, Stmt, Target, TargetKind, Try,
        UnaryOperator, WithItem,
    },
};

type ParseResult<T> = Result<T, CompileError>;

/// Parses `code` into a `Module`.
pub(crate) fn parse(code: &str) -> ParseResult<Module> {
    let mut parser = Parser::new(code);
    match parse_module(code) {
        Ok(parsed) => {
            let module = parsed.into_syntax();
            let body = parser.parse_statements(module.body)?;
            Ok(Module {
                body,
                scope_count: parser.next_scope,
            })
        }
        Err(e) => Err(CompileError::syntax(e.error.to_string(), parser.line_of(e.location.start()))),
    }
}

struct Parser<'c> {
    code: &'c str,
    /// Byte offset at which each line starts, `line_starts[0]` is always 0.
    line_starts: Vec<usize>,
    next_scope: ScopeId,
}

impl<'c> Parser<'c> {
    fn new(code: &'c str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(code.bytes().enumerate().filter(|(_, b)| *b == b'\n').map(|(i, _)| i + 1));
        Self {
            code,
            line_starts,
            next_scope: MODULE_SCOPE + 1,
        }
    }

    fn line_of(&self, offset: TextSize) -> u32 {
        let offset = usize::from(offset);
        let line = self.line_starts.partition_point(|&start| start <= offset);
        u32::try_from(line).unwrap_or(u32::MAX)
    }

    fn line_at(&self, node: &impl Ranged) -> u32 {
        self.line_of(node.range().start())
    }

    fn new_scope(&mut self) -> ScopeId {
        let scope = self.next_scope;
        self.next_scope += 1;
        scope
    }

    fn parse_statements(&mut self, statements: Vec<AstStmt>) -> ParseResult<Vec<Stmt>> {
        statements.into_iter().map(|s| self.parse_statement(s)).collect()
    }

    fn parse_elif_else_clauses(&mut self, clauses: Vec<ElifElseClause>) -> ParseResult<Vec<Stmt>> {
        let mut tail = Vec::new();
        for clause in clauses.into_iter().rev() {
            let line = self.line_at(&clause);
            match clause.test {
                Some(test) => {
                    let test = self.parse_expression(test)?;
                    let body = self.parse_statements(clause.body)?;
                    let or_else = tail;
                    tail = vec![Stmt {
                        line,
                        node: Node::If { test, body, or_else },
                    }];
                }
                None => tail = self.parse_statements(clause.body)?,
            }
        }
        Ok(tail)
    }

    fn parse_statement(&mut self, statement: AstStmt) -> ParseResult<Stmt> {
        let line = self.line_at(&statement);
        let node = match statement {
            AstStmt::FunctionDef(function) => {
                let def_line = self.line_at(&function.name);
                if function.is_async {
                    return Err(CompileError::not_implemented("'async def'", line));
                }
                if function.type_params.is_some() {
                    return Err(CompileError::not_implemented("type parameters", line));
                }
                let scope = self.new_scope();
                let decorators = self.parse_decorators(function.decorator_list)?;
                let parameters = self.parse_parameters(*function.parameters)?;
                let returns = function.returns.map(|r| self.parse_expression(*r)).transpose()?;
                let body = self.parse_statements(function.body)?;
                return Ok(Stmt {
                    line: def_line,
                    node: Node::FunctionDef(Box::new(FunctionDef {
                        scope,
                        name: function.name.to_string(),
                        line: def_line,
                        parameters,
                        returns,
                        body,
                        decorators,
                        is_lambda: false,
                    })),
                });
            }
            AstStmt::ClassDef(class) => {
                let class_line = self.line_at(&class.name);
                if class.type_params.is_some() {
                    return Err(CompileError::not_implemented("type parameters", line));
                }
                let scope = self.new_scope();
                let decorators = self.parse_decorators(class.decorator_list)?;
                let (bases, keywords) = match class.arguments {
                    Some(arguments) => {
                        let ast::Arguments { args, keywords, .. } = *arguments;
                        (self.parse_expressions(args.into_vec())?, self.parse_keywords(keywords.into_vec())?)
                    }
                    None => (Vec::new(), Vec::new()),
                };
                let body = self.parse_statements(class.body)?;
                return Ok(Stmt {
                    line: class_line,
                    node: Node::ClassDef(Box::new(ClassDef {
                        scope,
                        name: class.name.to_string(),
                        line: class_line,
                        bases,
                        keywords,
                        body,
                        decorators,
                    })),
                });
            }
            AstStmt::Return(ast::StmtReturn { value, .. }) => {
                Node::Return(value.map(|v| self.parse_expression(*v)).transpose()?)
            }
            AstStmt::Delete(ast::StmtDelete { targets, .. }) => Node::Delete(
                targets
                    .into_iter()
                    .map(|t| self.parse_target(t))
                    .collect::<ParseResult<_>>()?,
            ),
            AstStmt::TypeAlias(_) => return Err(CompileError::not_implemented("type alias", line)),
            AstStmt::Assign(ast::StmtAssign { targets, value, .. }) => Node::Assign {
                targets: targets
                    .into_iter()
                    .map(|t| self.parse_target(t))
                    .collect::<ParseResult<_>>()?,
                value: self.parse_expression(*value)?,
            },
            AstStmt::AugAssign(ast::StmtAugAssign { target, op, value, .. }) => {
                let target = self.parse_target(*target)?;
                if matches!(target.kind, TargetKind::Unpack { .. }) {
                    return Err(CompileError::syntax(
                        "'tuple' is an illegal expression for augmented assignment",
                        line,
                    ));
                }
                Node::AugAssign {
                    target,
                    op: convert_op(op),
                    value: self.parse_expression(*value)?,
                }
            }
            AstStmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                simple,
                ..
            }) => Node::AnnAssign {
                target: self.parse_target(*target)?,
                annotation: self.parse_expression(*annotation)?,
                value: value.map(|v| self.parse_expression(*v)).transpose()?,
                simple,
            },
            AstStmt::For(ast::StmtFor {
                is_async,
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                if is_async {
                    return Err(CompileError::not_implemented("'async for'", line));
                }
                Node::For {
                    target: self.parse_target(*target)?,
                    iter: self.parse_expression(*iter)?,
                    body: self.parse_statements(body)?,
                    or_else: self.parse_statements(orelse)?,
                }
            }
            AstStmt::While(ast::StmtWhile { test, body, orelse, .. }) => Node::While {
                test: self.parse_expression(*test)?,
                body: self.parse_statements(body)?,
                or_else: self.parse_statements(orelse)?,
            },
            AstStmt::If(ast::StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => Node::If {
                test: self.parse_expression(*test)?,
                body: self.parse_statements(body)?,
                or_else: self.parse_elif_else_clauses(elif_else_clauses)?,
            },
            AstStmt::With(ast::StmtWith {
                is_async, items, body, ..
            }) => {
                if is_async {
                    return Err(CompileError::not_implemented("'async with' statement", line));
                }
                let items = items
                    .into_iter()
                    .map(|item| {
                        Ok(WithItem {
                            context: self.parse_expression(item.context_expr)?,
                            target: item.optional_vars.map(|t| self.parse_target(*t)).transpose()?,
                        })
                    })
                    .collect::<ParseResult<_>>()?;
                Node::With {
                    items,
                    body: self.parse_statements(body)?,
                }
            }
            AstStmt::Match(_) => return Err(CompileError::not_implemented("'match' statement", line)),
            AstStmt::Raise(ast::StmtRaise { exc, cause, .. }) => Node::Raise {
                exc: exc.map(|e| self.parse_expression(*e)).transpose()?,
                cause: cause.map(|c| self.parse_expression(*c)).transpose()?,
            },
            AstStmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
                ..
            }) => {
                if is_star {
                    return Err(CompileError::not_implemented("'try*' statement", line));
                }
                let handlers = handlers
                    .into_iter()
                    .map(|ast::ExceptHandler::ExceptHandler(handler)| {
                        Ok(ExceptHandler {
                            line: self.line_at(&handler),
                            exc_type: handler.type_.map(|t| self.parse_expression(*t)).transpose()?,
                            name: handler.name.map(|n| n.to_string()),
                            body: self.parse_statements(handler.body)?,
                        })
                    })
                    .collect::<ParseResult<_>>()?;
                Node::Try(Box::new(Try {
                    body: self.parse_statements(body)?,
                    handlers,
                    or_else: self.parse_statements(orelse)?,
                    finally: self.parse_statements(finalbody)?,
                }))
            }
            AstStmt::Assert(ast::StmtAssert { test, msg, .. }) => Node::Assert {
                test: self.parse_expression(*test)?,
                msg: msg.map(|m| self.parse_expression(*m)).transpose()?,
            },
            AstStmt::Import(ast::StmtImport { names, .. }) => {
                Node::Import(names.into_iter().map(convert_alias).collect())
            }
            AstStmt::ImportFrom(ast::StmtImportFrom {
                module, names, level, ..
            }) => Node::ImportFrom {
                module: module.map(|m| m.to_string()),
                names: names.into_iter().map(convert_alias).collect(),
                level,
            },
            AstStmt::Global(ast::StmtGlobal { names, .. }) => {
                Node::Global(names.iter().map(ToString::to_string).collect())
            }
            AstStmt::Nonlocal(ast::StmtNonlocal { names, .. }) => {
                Node::Nonlocal(names.iter().map(ToString::to_string).collect())
            }
            AstStmt::Expr(ast::StmtExpr { value, .. }) => Node::Expr(self.parse_expression(*value)?),
            AstStmt::Pass(_) => Node::Pass,
            AstStmt::Break(_) => Node::Break,
            AstStmt::Continue(_) => Node::Continue,
            AstStmt::IpyEscapeCommand(_) => {
                return Err(CompileError::not_implemented("IPython escape command", line));
            }
        };
        Ok(Stmt { line, node })
    }

    fn parse_decorators(&mut self, decorators: Vec<ast::Decorator>) -> ParseResult<Vec<ExprLoc>> {
        decorators
            .into_iter()
            .map(|d| self.parse_expression(d.expression))
            .collect()
    }

    fn parse_parameters(&mut self, parameters: ast::Parameters) -> ParseResult<Parameters> {
        let ast::Parameters {
            posonlyargs,
            args,
            vararg,
            kwonlyargs,
            kwarg,
            ..
        } = parameters;
        Ok(Parameters {
            posonly: self.parse_params(posonlyargs)?,
            args: self.parse_params(args)?,
            vararg: vararg.map(|p| self.parse_param(*p, None)).transpose()?,
            kwonly: self.parse_params(kwonlyargs)?,
            kwarg: kwarg.map(|p| self.parse_param(*p, None)).transpose()?,
        })
    }

    fn parse_param(&mut self, parameter: ast::Parameter, default: Option<Box<AstExpr>>) -> ParseResult<Param> {
        Ok(Param {
            name: parameter.name.to_string(),
            default: default.map(|d| self.parse_expression(*d)).transpose()?,
            annotation: parameter.annotation.map(|a| self.parse_expression(*a)).transpose()?,
        })
    }

    fn parse_params(&mut self, params: Vec<ast::ParameterWithDefault>) -> ParseResult<Vec<Param>> {
        params
            .into_iter()
            .map(|p| self.parse_param(p.parameter, p.default))
            .collect()
    }

    fn parse_target(&mut self, target: AstExpr) -> ParseResult<Target> {
        let line = self.line_at(&target);
        let kind = match target {
            AstExpr::Name(ast::ExprName { id, .. }) => TargetKind::Name(id.to_string()),
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => TargetKind::Attr {
                object: Box::new(self.parse_expression(*value)?),
                attr: attr.to_string(),
            },
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => TargetKind::Subscript {
                object: Box::new(self.parse_expression(*value)?),
                index: Box::new(self.parse_expression(*slice)?),
            },
            AstExpr::Tuple(ast::ExprTuple { elts, .. }) | AstExpr::List(ast::ExprList { elts, .. }) => {
                self.parse_unpack_target(elts, line)?
            }
            AstExpr::Starred(_) => {
                return Err(CompileError::syntax(
                    "starred assignment target must be in a list or tuple",
                    line,
                ));
            }
            other => {
                return Err(CompileError::syntax(
                    format!("cannot assign to {}", describe_expression(&other)),
                    line,
                ));
            }
        };
        Ok(Target { line, kind })
    }

    fn parse_unpack_target(&mut self, elts: Vec<AstExpr>, line: u32) -> ParseResult<TargetKind> {
        let mut starred = None;
        let mut targets = Vec::with_capacity(elts.len());
        for (index, elt) in elts.into_iter().enumerate() {
            if let AstExpr::Starred(ast::ExprStarred { value, .. }) = elt {
                if starred.is_some() {
                    return Err(CompileError::syntax("multiple starred expressions in assignment", line));
                }
                starred = Some(index);
                targets.push(self.parse_target(*value)?);
            } else {
                targets.push(self.parse_target(elt)?);
            }
        }
        Ok(TargetKind::Unpack { targets, starred })
    }

    fn parse_expressions(&mut self, expressions: Vec<AstExpr>) -> ParseResult<Vec<ExprLoc>> {
        expressions.into_iter().map(|e| self.parse_expression(e)).collect()
    }

    fn parse_keywords(&mut self, keywords: Vec<ast::Keyword>) -> ParseResult<Vec<Keyword>> {
        keywords
            .into_iter()
            .map(|k| {
                Ok(Keyword {
                    name: k.arg.map(|a| a.to_string()),
                    value: self.parse_expression(k.value)?,
                })
            })
            .collect()
    }

    fn parse_boxed(&mut self, expression: AstExpr) -> ParseResult<Box<ExprLoc>> {
        self.parse_expression(expression).map(Box::new)
    }

    fn parse_expression(&mut self, expression: AstExpr) -> ParseResult<ExprLoc> {
        let line = self.line_at(&expression);
        let expr = match expression {
            AstExpr::BoolOp(ast::ExprBoolOp { op, values, .. }) => Expr::BoolOp {
                op: match op {
                    BoolOp::And => BoolOperator::And,
                    BoolOp::Or => BoolOperator::Or,
                },
                values: self.parse_expressions(values)?,
            },
            AstExpr::Named(ast::ExprNamed { target, value, .. }) => match *target {
                AstExpr::Name(ast::ExprName { id, .. }) => Expr::Named {
                    target: id.to_string(),
                    value: self.parse_boxed(*value)?,
                },
                other => {
                    return Err(CompileError::syntax(
                        format!("cannot use assignment expressions with {}", describe_expression(&other)),
                        line,
                    ));
                }
            },
            AstExpr::BinOp(ast::ExprBinOp { left, op, right, .. }) => Expr::BinOp {
                left: self.parse_boxed(*left)?,
                op: convert_op(op),
                right: self.parse_boxed(*right)?,
            },
            AstExpr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => Expr::Unary {
                op: match op {
                    UnaryOp::Not => UnaryOperator::Not,
                    UnaryOp::USub => UnaryOperator::Neg,
                    UnaryOp::UAdd => UnaryOperator::Pos,
                    UnaryOp::Invert => UnaryOperator::Invert,
                },
                operand: self.parse_boxed(*operand)?,
            },
            AstExpr::Lambda(ast::ExprLambda { parameters, body, .. }) => {
                let scope = self.new_scope();
                let parameters = match parameters {
                    Some(parameters) => self.parse_parameters(*parameters)?,
                    None => Parameters::default(),
                };
                let body = self.parse_expression(*body)?;
                Expr::Lambda(Box::new(FunctionDef {
                    scope,
                    name: "<lambda>".to_owned(),
                    line,
                    parameters,
                    returns: None,
                    body: vec![Stmt {
                        line: body.line,
                        node: Node::Return(Some(body)),
                    }],
                    decorators: Vec::new(),
                    is_lambda: true,
                }))
            }
            AstExpr::If(ast::ExprIf { test, body, orelse, .. }) => Expr::IfElse {
                test: self.parse_boxed(*test)?,
                body: self.parse_boxed(*body)?,
                orelse: self.parse_boxed(*orelse)?,
            },
            AstExpr::Dict(ast::ExprDict { items, .. }) => Expr::Dict(
                items
                    .into_iter()
                    .map(|ast::DictItem { key, value }| {
                        Ok(DictItem {
                            key: key.map(|k| self.parse_expression(k)).transpose()?,
                            value: self.parse_expression(value)?,
                        })
                    })
                    .collect::<ParseResult<_>>()?,
            ),
            AstExpr::Set(ast::ExprSet { elts, .. }) => Expr::Set(self.parse_expressions(elts)?),
            AstExpr::ListComp(ast::ExprListComp { elt, generators, .. }) => {
                self.parse_comprehension(ComprehensionKind::List, *elt, None, generators, line)?
            }
            AstExpr::SetComp(ast::ExprSetComp { elt, generators, .. }) => {
                self.parse_comprehension(ComprehensionKind::Set, *elt, None, generators, line)?
            }
            AstExpr::DictComp(ast::ExprDictComp {
                key, value, generators, ..
            }) => self.parse_comprehension(ComprehensionKind::Dict, *key, Some(*value), generators, line)?,
            AstExpr::Generator(ast::ExprGenerator { elt, generators, .. }) => {
                self.parse_comprehension(ComprehensionKind::Generator, *elt, None, generators, line)?
            }
            AstExpr::Await(_) => return Err(CompileError::not_implemented("'await' expression", line)),
            AstExpr::Yield(ast::ExprYield { value, .. }) => {
                Expr::Yield(value.map(|v| self.parse_boxed(*v)).transpose()?)
            }
            AstExpr::YieldFrom(_) => return Err(CompileError::not_implemented("'yield from' expression", line)),
            AstExpr::Compare(ast::ExprCompare {
                left, ops, comparators, ..
            }) => {
                let left = self.parse_boxed(*left)?;
                let comparisons = ops
                    .into_vec()
                    .into_iter()
                    .zip(comparators.into_vec())
                    .map(|(op, right)| Ok((convert_compare_op(op), self.parse_expression(right)?)))
                    .collect::<ParseResult<_>>()?;
                Expr::Compare { left, comparisons }
            }
            AstExpr::Call(ast::ExprCall { func, arguments, .. }) => {
                let ast::Arguments { args, keywords, .. } = arguments;
                Expr::Call {
                    func: self.parse_boxed(*func)?,
                    args: self.parse_expressions(args.into_vec())?,
                    keywords: self.parse_keywords(keywords.into_vec())?,
                }
            }
            AstExpr::FString(ast::ExprFString { value, .. }) => self.parse_fstring(&value)?,
            AstExpr::TString(_) => return Err(CompileError::not_implemented("template string", line)),
            AstExpr::StringLiteral(ast::ExprStringLiteral { value, .. }) => {
                Expr::Literal(Literal::Str(value.to_string()))
            }
            AstExpr::BytesLiteral(ast::ExprBytesLiteral { value, .. }) => {
                let bytes: Cow<'_, [u8]> = Cow::from(&value);
                Expr::Literal(Literal::Bytes(bytes.into_owned()))
            }
            AstExpr::NumberLiteral(ast::ExprNumberLiteral { value, range, .. }) => {
                Expr::Literal(match value {
                    Number::Int(i) => match i.as_i64() {
                        Some(i) => Literal::Int(i),
                        None => Literal::BigInt(parse_big_int(&self.code[range], line)?),
                    },
                    Number::Float(f) => Literal::Float(f),
                    Number::Complex { imag, .. } => Literal::Imaginary(imag),
                })
            }
            AstExpr::BooleanLiteral(ast::ExprBooleanLiteral { value, .. }) => Expr::Literal(Literal::Bool(value)),
            AstExpr::NoneLiteral(_) => Expr::Literal(Literal::None),
            AstExpr::EllipsisLiteral(_) => Expr::Literal(Literal::Ellipsis),
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => Expr::Attribute {
                object: self.parse_boxed(*value)?,
                attr: attr.to_string(),
            },
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => Expr::Subscript {
                object: self.parse_boxed(*value)?,
                index: self.parse_boxed(*slice)?,
            },
            AstExpr::Starred(ast::ExprStarred { value, .. }) => Expr::Starred(self.parse_boxed(*value)?),
            AstExpr::Name(ast::ExprName { id, .. }) => Expr::Name(id.to_string()),
            AstExpr::List(ast::ExprList { elts, .. }) => Expr::List(self.parse_expressions(elts)?),
            AstExpr::Tuple(ast::ExprTuple { elts, .. }) => Expr::Tuple(self.parse_expressions(elts)?),
            AstExpr::Slice(ast::ExprSlice { lower, upper, step, .. }) => Expr::Slice {
                lower: lower.map(|e| self.parse_boxed(*e)).transpose()?,
                upper: upper.map(|e| self.parse_boxed(*e)).transpose()?,
                step: step.map(|e| self.parse_boxed(*e)).transpose()?,
            },
            AstExpr::IpyEscapeCommand(_) => {
                return Err(CompileError::not_implemented("IPython escape command", line));
            }
        };
        Ok(ExprLoc::new(line, expr))
    }

    fn parse_comprehension(
        &mut self,
        kind: ComprehensionKind,
        element: AstExpr,
        value: Option<AstExpr>,
        generators: Vec<ast::Comprehension>,
        line: u32,
    ) -> ParseResult<Expr> {
        let scope = self.new_scope();
        let generators = generators
            .into_iter()
            .map(|generator| {
                if generator.is_async {
                    return Err(CompileError::not_implemented("asynchronous comprehension", line));
                }
                Ok(Generator {
                    target: self.parse_target(generator.target)?,
                    iter: self.parse_expression(generator.iter)?,
                    ifs: self.parse_expressions(generator.ifs)?,
                })
            })
            .collect::<ParseResult<_>>()?;
        Ok(Expr::Comprehension(Box::new(Comprehension {
            scope,
            kind,
            element: self.parse_expression(element)?,
            value: value.map(|v| self.parse_expression(v)).transpose()?,
            generators,
        })))
    }

    /// Converts an f-string into its parts, merging adjacent literal text.
    ///
    /// An f-string without interpolations becomes a plain string literal.
    fn parse_fstring(&mut self, value: &ast::FStringValue) -> ParseResult<Expr> {
        let mut parts = Vec::new();
        for fstring_part in value {
            match fstring_part {
                ast::FStringPart::Literal(lit) => push_literal(&mut parts, &lit.value),
                ast::FStringPart::FString(fstring) => {
                    for element in &fstring.elements {
                        self.parse_fstring_element(element, &mut parts)?;
                    }
                }
            }
        }
        match parts.as_slice() {
            [] => Ok(Expr::Literal(Literal::Str(String::new()))),
            [FStringPart::Literal(s)] => Ok(Expr::Literal(Literal::Str(s.clone()))),
            _ => Ok(Expr::FString(parts)),
        }
    }

    fn parse_fstring_element(
        &mut self,
        element: &InterpolatedStringElement,
        parts: &mut Vec<FStringPart>,
    ) -> ParseResult<()> {
        match element {
            InterpolatedStringElement::Literal(lit) => push_literal(parts, &lit.value),
            InterpolatedStringElement::Interpolation(interp) => {
                let mut conversion = convert_conversion_flag(interp.conversion);
                // `f"{x=}"` renders the expression text before the value, with `repr` by default
                if let Some(debug) = &interp.debug_text {
                    let text = format!(
                        "{}{}{}",
                        debug.leading,
                        &self.code[interp.expression.range()],
                        debug.trailing
                    );
                    push_literal(parts, &text);
                    if conversion == ConversionFlag::None && interp.format_spec.is_none() {
                        conversion = ConversionFlag::Repr;
                    }
                }
                let expr = self.parse_boxed((*interp.expression).clone())?;
                let format_spec = match &interp.format_spec {
                    Some(spec) => {
                        let mut spec_parts = Vec::new();
                        for element in &spec.elements {
                            self.parse_fstring_element(element, &mut spec_parts)?;
                        }
                        Some(spec_parts)
                    }
                    None => None,
                };
                parts.push(FStringPart::Interpolation {
                    expr,
                    conversion,
                    format_spec,
                });
            }
        }
        Ok(())
    }
}

fn push_literal(parts: &mut Vec<FStringPart>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(FStringPart::Literal(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(FStringPart::Literal(text.to_owned()));
    }
}

/// Parses an integer literal too large for `i64` from its source text.
fn parse_big_int(text: &str, line: u32) -> ParseResult<BigInt> {
    let lower = text.to_ascii_lowercase();
    let (digits, radix) = if let Some(hex) = lower.strip_prefix("0x") {
        (hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        (oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        (bin, 2)
    } else {
        (lower.as_str(), 10)
    };
    let digits: String = digits.chars().filter(|c| *c != '_').collect();
    BigInt::parse_bytes(digits.as_bytes(), radix)
        .ok_or_else(|| CompileError::syntax(format!("invalid integer literal '{text}'"), line))
}

fn convert_alias(alias: ast::Alias) -> ImportAlias {
    ImportAlias {
        name: alias.name.to_string(),
        asname: alias.asname.map(|a| a.to_string()),
    }
}

/// Name CPython uses for an expression in "cannot assign to ..." messages.
fn describe_expression(expr: &AstExpr) -> &'static str {
    match expr {
        AstExpr::Call(_) => "function call",
        AstExpr::StringLiteral(_)
        | AstExpr::BytesLiteral(_)
        | AstExpr::NumberLiteral(_)
        | AstExpr::BooleanLiteral(_)
        | AstExpr::NoneLiteral(_)
        | AstExpr::EllipsisLiteral(_) => "literal",
        AstExpr::FString(_) => "f-string expression",
        AstExpr::Lambda(_) => "lambda",
        AstExpr::BinOp(_) | AstExpr::BoolOp(_) | AstExpr::UnaryOp(_) => "expression",
        AstExpr::Compare(_) => "comparison",
        AstExpr::If(_) => "conditional expression",
        AstExpr::Named(_) => "named expression",
        AstExpr::ListComp(_) => "list comprehension",
        AstExpr::SetComp(_) => "set comprehension",
        AstExpr::DictComp(_) => "dict comprehension",
        AstExpr::Generator(_) => "generator expression",
        AstExpr::Dict(_) => "dict literal",
        AstExpr::Set(_) => "set display",
        AstExpr::Yield(_) | AstExpr::YieldFrom(_) => "yield expression",
        AstExpr::Await(_) => "await expression",
        _ => "expression",
    }
}

fn convert_op(op: AstOperator) -> Operator {
    match op {
        AstOperator::Add => Operator::Add,
        AstOperator::Sub => Operator::Sub,
        AstOperator::Mult => Operator::Mult,
        AstOperator::MatMult => Operator::MatMult,
        AstOperator::Div => Operator::Div,
        AstOperator::Mod => Operator::Mod,
        AstOperator::Pow => Operator::Pow,
        AstOperator::LShift => Operator::LShift,
        AstOperator::RShift => Operator::RShift,
        AstOperator::BitOr => Operator::BitOr,
        AstOperator::BitXor => Operator::BitXor,
        AstOperator::BitAnd => Operator::BitAnd,
        AstOperator::FloorDiv => Operator::FloorDiv,
    }
}

fn convert_compare_op(op: CmpOp) -> CmpOperator {
    match op {
        CmpOp::Eq => CmpOperator::Eq,
        CmpOp::NotEq => CmpOperator::NotEq,
        CmpOp::Lt => CmpOperator::Lt,
        CmpOp::LtE => CmpOperator::LtE,
        CmpOp::Gt => CmpOperator::Gt,
        CmpOp::GtE => CmpOperator::GtE,
        CmpOp::Is => CmpOperator::Is,
        CmpOp::IsNot => CmpOperator::IsNot,
        CmpOp::In => CmpOperator::In,
        CmpOp::NotIn => CmpOperator::NotIn,
    }
}

fn convert_conversion_flag(flag: RuffConversionFlag) -> ConversionFlag {
    match flag {
        RuffConversionFlag::None => ConversionFlag::None,
        RuffConversionFlag::Str => ConversionFlag::Str,
        RuffConversionFlag::Repr => ConversionFlag::Repr,
        RuffConversionFlag::Ascii => ConversionFlag::Ascii,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileErrorKind;

    #[test]
    fn statement_lines_are_one_based() {
        let module = parse("x = 1\n\ny = 2\n").unwrap();
        let lines: Vec<u32> = module.body.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 3]);
    }

    #[test]
    fn decorated_def_uses_the_def_line() {
        let module = parse("@dec\ndef f():\n    pass\n").unwrap();
        let Node::FunctionDef(def) = &module.body[0].node else {
            panic!("expected a function definition, got: {:?}", module.body[0].node);
        };
        assert_eq!(def.line, 2);
        assert_eq!(def.decorators[0].line, 1);
        assert_eq!(module.scope_count, 2);
    }

    #[test]
    fn big_int_literals_are_kept() {
        let module = parse("n = 0x_FFFF_FFFF_FFFF_FFFF_FF\n").unwrap();
        let Node::Assign { value, .. } = &module.body[0].node else {
            panic!("expected an assignment");
        };
        let Expr::Literal(Literal::BigInt(n)) = &value.expr else {
            panic!("expected a big int literal, got: {:?}", value.expr);
        };
        assert_eq!(n.to_string(), "4722366482869645213695");
    }

    #[test]
    fn fstring_without_interpolation_is_a_plain_string() {
        let module = parse("s = f'abc' 'def'\n").unwrap();
        let Node::Assign { value, .. } = &module.body[0].node else {
            panic!("expected an assignment");
        };
        assert!(matches!(&value.expr, Expr::Literal(Literal::Str(s)) if s == "abcdef"));
    }

    #[test]
    fn unsupported_syntax_names_the_construct() {
        let err = parse("async def f():\n    async with g() as h:\n        pass\n").unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::NotImplementedError);
        let err = parse("match x:\n    case 1:\n        pass\n").unwrap_err();
        assert!(err.message().contains("'match' statement"), "got: {err}");
    }

    #[test]
    fn with_items_keep_their_targets() {
        let module = parse("with a() as b, c():\n    pass\n").unwrap();
        let Node::With { items, body } = &module.body[0].node else {
            panic!("expected a with statement");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0].target, Some(Target { kind: TargetKind::Name(n), .. }) if n == "b"));
        assert!(items[1].target.is_none());
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn parser_errors_report_their_line() {
        let err = parse("x = 1\ny = (2\n").unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::SyntaxError);
        assert!(err.line() >= 2, "got: {err}");
    }

    #[test]
    fn two_starred_targets_are_rejected() {
        let err = parse("*a, *b = c\n").unwrap_err();
        assert_eq!(err.message(), "multiple starred expressions in assignment");
    }
}
