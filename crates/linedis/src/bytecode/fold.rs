//! Compile-time evaluation of constant expressions.
//!
//! Mirrors the folding CPython's AST optimizer performs before code generation: literals,
//! `__debug__`, unary and binary operators on constant operands, and tuples made only of
//! constants all collapse into a single `LOAD_CONST`. Folding gives up (returns `None`) whenever
//! the result would be too large or the operation could raise.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use super::code::Constant;
use crate::expressions::{CmpOperator, Expr, ExprLoc, Literal, Operator, UnaryOperator};

/// Largest integer result, in bits, produced by folding `*`, `**` and `<<`.
const MAX_INT_BITS: u64 = 128;

/// Largest string or bytes length produced by folding `*`.
const MAX_STR_SIZE: usize = 4096;

/// Integers up to this magnitude convert to `f64` exactly.
const MAX_EXACT_FLOAT_INT: i64 = 1 << 53;

/// Returns the value of `expr` if it is known at compile time.
pub(crate) fn constant_value(expr: &ExprLoc) -> Option<Constant> {
    match &expr.expr {
        Expr::Literal(literal) => Some(literal_constant(literal)),
        Expr::Name(name) if name == "__debug__" => Some(Constant::Bool(true)),
        Expr::Tuple(items) => items
            .iter()
            .map(constant_value)
            .collect::<Option<Vec<_>>>()
            .map(Constant::Tuple),
        Expr::Unary { op, operand } => fold_unary(*op, &constant_value(operand)?),
        Expr::BinOp { left, op, right } => fold_binary(&constant_value(left)?, *op, &constant_value(right)?),
        _ => None,
    }
}

/// Like `constant_value`, but also turns a list display of constants into a tuple.
///
/// Used where the container is only iterated or searched: `for x in [1, 2]` and `x in [1, 2]`.
pub(crate) fn iterable_constant(expr: &ExprLoc) -> Option<Constant> {
    match &expr.expr {
        Expr::List(items) => items
            .iter()
            .map(constant_value)
            .collect::<Option<Vec<_>>>()
            .map(Constant::Tuple),
        _ => constant_value(expr),
    }
}

/// Folds a membership test's right operand, see `iterable_constant`.
pub(crate) fn comparison_operand(op: CmpOperator, expr: &ExprLoc) -> Option<Constant> {
    match op {
        CmpOperator::In | CmpOperator::NotIn => iterable_constant(expr),
        _ => constant_value(expr),
    }
}

pub(crate) fn literal_constant(literal: &Literal) -> Constant {
    match literal {
        Literal::None => Constant::None,
        Literal::Bool(b) => Constant::Bool(*b),
        Literal::Int(i) => Constant::Int(*i),
        Literal::BigInt(i) => Constant::BigInt(i.clone()),
        Literal::Float(f) => Constant::Float(*f),
        Literal::Imaginary(imag) => Constant::Complex(*imag),
        Literal::Str(s) => Constant::Str(s.clone()),
        Literal::Bytes(b) => Constant::Bytes(b.clone()),
        Literal::Ellipsis => Constant::Ellipsis,
    }
}

/// Python truthiness of a constant; `None` for code objects.
pub(crate) fn truthiness(constant: &Constant) -> Option<bool> {
    Some(match constant {
        Constant::None => false,
        Constant::Bool(b) => *b,
        Constant::Int(i) => *i != 0,
        Constant::BigInt(i) => !i.is_zero(),
        Constant::Float(f) | Constant::Complex(f) => *f != 0.0,
        Constant::Str(s) => !s.is_empty(),
        Constant::Bytes(b) => !b.is_empty(),
        Constant::Ellipsis => true,
        Constant::Tuple(items) => !items.is_empty(),
        Constant::Code(_) => return None,
    })
}

fn fold_unary(op: UnaryOperator, operand: &Constant) -> Option<Constant> {
    if op == UnaryOperator::Not {
        return truthiness(operand).map(|t| Constant::Bool(!t));
    }
    if let Constant::Float(f) = operand {
        return match op {
            UnaryOperator::Neg => Some(Constant::Float(-f)),
            UnaryOperator::Pos => Some(Constant::Float(*f)),
            _ => None,
        };
    }
    let value = as_int(operand)?;
    let result = match op {
        UnaryOperator::Neg => -value,
        UnaryOperator::Pos => value,
        UnaryOperator::Invert => -(value + 1i32),
        UnaryOperator::Not => unreachable!("handled above"),
    };
    Some(int_constant(result))
}

fn fold_binary(left: &Constant, op: Operator, right: &Constant) -> Option<Constant> {
    match (left, right) {
        (Constant::Str(a), Constant::Str(b)) if op == Operator::Add => Some(Constant::Str(format!("{a}{b}"))),
        (Constant::Bytes(a), Constant::Bytes(b)) if op == Operator::Add => Some(Constant::Bytes([&a[..], b].concat())),
        (Constant::Tuple(a), Constant::Tuple(b)) if op == Operator::Add => {
            Some(Constant::Tuple(a.iter().chain(b).cloned().collect()))
        }
        (Constant::Str(s), n) | (n, Constant::Str(s)) if op == Operator::Mult => {
            let count = repeat_count(s.len(), n)?;
            Some(Constant::Str(s.repeat(count)))
        }
        (Constant::Bytes(b), n) | (n, Constant::Bytes(b)) if op == Operator::Mult => {
            let count = repeat_count(b.len(), n)?;
            Some(Constant::Bytes(b.repeat(count)))
        }
        (Constant::Float(_), _) | (_, Constant::Float(_)) => fold_float(as_float(left)?, op, as_float(right)?),
        _ => fold_int(&as_int(left)?, op, &as_int(right)?),
    }
}

fn fold_int(a: &BigInt, op: Operator, b: &BigInt) -> Option<Constant> {
    let result = match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::BitAnd => a & b,
        Operator::BitOr => a | b,
        Operator::BitXor => a ^ b,
        Operator::Mult => {
            if a.bits() + b.bits() > MAX_INT_BITS {
                return None;
            }
            a * b
        }
        Operator::FloorDiv | Operator::Mod => {
            if b.is_zero() {
                return None;
            }
            let (quotient, remainder) = floor_div_mod(a, b);
            if op == Operator::FloorDiv { quotient } else { remainder }
        }
        Operator::Pow => {
            if b.is_negative() {
                return None;
            }
            let exponent = b.to_u32()?;
            if !a.is_zero() && a.bits().saturating_mul(u64::from(exponent)) > MAX_INT_BITS {
                return None;
            }
            a.pow(exponent)
        }
        Operator::LShift => {
            if b.is_negative() {
                return None;
            }
            let shift = b.to_u64()?;
            if !a.is_zero() && a.bits().saturating_add(shift) > MAX_INT_BITS {
                return None;
            }
            a << usize::try_from(shift).ok()?
        }
        Operator::RShift => {
            if b.is_negative() {
                return None;
            }
            match b.to_usize() {
                Some(shift) => a >> shift,
                None if a.is_negative() => BigInt::from(-1),
                None => BigInt::zero(),
            }
        }
        Operator::Div => {
            let (a, b) = (exact_float(a)?, exact_float(b)?);
            return (b != 0.0).then(|| Constant::Float(a / b));
        }
        Operator::MatMult => return None,
    };
    Some(int_constant(result))
}

fn fold_float(a: f64, op: Operator, b: f64) -> Option<Constant> {
    let result = match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::Mult => a * b,
        Operator::Div if b != 0.0 => a / b,
        _ => return None,
    };
    Some(Constant::Float(result))
}

/// Quotient and remainder rounded towards negative infinity, as Python's `//` and `%`.
fn floor_div_mod(a: &BigInt, b: &BigInt) -> (BigInt, BigInt) {
    let quotient = a / b;
    let remainder = a % b;
    if !remainder.is_zero() && remainder.is_negative() != b.is_negative() {
        (quotient - 1, remainder + b)
    } else {
        (quotient, remainder)
    }
}

/// Validates the repeat count of `sequence * n` against the folding size limit.
fn repeat_count(len: usize, n: &Constant) -> Option<usize> {
    let count = as_int(n)?.to_usize()?;
    (len == 0 || count <= MAX_STR_SIZE / len).then_some(count)
}

fn as_int(constant: &Constant) -> Option<BigInt> {
    match constant {
        Constant::Bool(b) => Some(BigInt::from(u8::from(*b))),
        Constant::Int(i) => Some(BigInt::from(*i)),
        Constant::BigInt(i) => Some(i.clone()),
        _ => None,
    }
}

fn as_float(constant: &Constant) -> Option<f64> {
    match constant {
        Constant::Float(f) => Some(*f),
        other => exact_float(&as_int(other)?),
    }
}

/// Converts an integer small enough to be represented exactly as `f64`.
#[expect(clippy::cast_precision_loss, reason = "the magnitude is checked to be exactly representable")]
fn exact_float(value: &BigInt) -> Option<f64> {
    let value = value.to_i64()?;
    (value.abs() <= MAX_EXACT_FLOAT_INT).then_some(value as f64)
}

fn int_constant(value: BigInt) -> Constant {
    match value.to_i64() {
        Some(i) => Constant::Int(i),
        None => Constant::BigInt(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{expressions::Node, parse::parse};

    /// Folds the value of a single expression statement.
    fn fold(source: &str) -> Option<String> {
        let module = parse(source).unwrap();
        let Node::Expr(expr) = &module.body[0].node else {
            panic!("expected an expression statement");
        };
        constant_value(expr).map(|c| c.to_string())
    }

    #[test]
    fn arithmetic_on_literals_folds() {
        assert_eq!(fold("1 + 2 * 3").as_deref(), Some("7"));
        assert_eq!(fold("-7 // 2").as_deref(), Some("-4"));
        assert_eq!(fold("-7 % 2").as_deref(), Some("1"));
        assert_eq!(fold("2 ** 64").as_deref(), Some("18446744073709551616"));
        assert_eq!(fold("1 / 2").as_deref(), Some("0.5"));
        assert_eq!(fold("1.5 * 2").as_deref(), Some("3.0"));
        assert_eq!(fold("~5").as_deref(), Some("-6"));
        assert_eq!(fold("-True").as_deref(), Some("-1"));
    }

    #[test]
    fn strings_and_tuples_fold() {
        assert_eq!(fold("'ab' + 'cd'").as_deref(), Some("'abcd'"));
        assert_eq!(fold("'ab' * 2").as_deref(), Some("'abab'"));
        assert_eq!(fold("(1, (2, 'x'), None)").as_deref(), Some("(1, (2, 'x'), None)"));
        assert_eq!(fold("(1,) + (2,)").as_deref(), Some("(1, 2)"));
    }

    #[test]
    fn unsafe_operations_are_left_alone() {
        assert_eq!(fold("1 / 0"), None);
        assert_eq!(fold("2 ** 100"), None);
        assert_eq!(fold("'x' * 5000"), None);
        assert_eq!(fold("1 << 200"), None);
        assert_eq!(fold("(1, x)"), None);
        assert_eq!(fold("-2j"), None);
    }

    #[test]
    fn debug_flag_is_constant() {
        assert_eq!(fold("__debug__").as_deref(), Some("True"));
        assert_eq!(fold("not __debug__").as_deref(), Some("False"));
    }
}
