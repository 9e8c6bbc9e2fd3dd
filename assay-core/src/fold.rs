#![forbid(unsafe_code)]

use assay_ir::{BinOp, Expr, ExprKind, LogicalOp, UnaryOp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstVal {
    Int(i128),
    Bool(bool),
}

/// Value of an expression that needs no inputs, if it has one.
///
/// Only literals and pure operators fold. A short-circuiting left operand folds the whole
/// logical expression even when the right operand does not.
pub fn fold(expr: &Expr) -> Option<ConstVal> {
    match &expr.kind {
        ExprKind::Int(v) => Some(ConstVal::Int(i128::from(*v))),
        ExprKind::Bool(b) => Some(ConstVal::Bool(*b)),
        ExprKind::Unary { op, operand } => fold_unary(*op, fold(operand)?),
        ExprKind::Binary { op, lhs, rhs } => fold_binary(*op, fold(lhs)?, fold(rhs)?),
        ExprKind::Logical { op, lhs, rhs } => match (op, fold(lhs)?) {
            (LogicalOp::And, ConstVal::Bool(false)) => Some(ConstVal::Bool(false)),
            (LogicalOp::Or, ConstVal::Bool(true)) => Some(ConstVal::Bool(true)),
            (_, ConstVal::Bool(_)) => match fold(rhs)? {
                ConstVal::Bool(b) => Some(ConstVal::Bool(b)),
                ConstVal::Int(_) => None,
            },
            _ => None,
        },
        _ => None,
    }
}

/// True when `lhs` decides `op` on its own, so the right operand never runs.
pub fn skips_rhs(op: LogicalOp, lhs: &Expr) -> bool {
    matches!(
        (op, fold(lhs)),
        (LogicalOp::And, Some(ConstVal::Bool(false))) | (LogicalOp::Or, Some(ConstVal::Bool(true)))
    )
}

/// True when `lhs` is a constant that forces the right operand to run.
pub fn forces_rhs(op: LogicalOp, lhs: &Expr) -> bool {
    matches!(
        (op, fold(lhs)),
        (LogicalOp::And, Some(ConstVal::Bool(true))) | (LogicalOp::Or, Some(ConstVal::Bool(false)))
    )
}

fn fold_unary(op: UnaryOp, v: ConstVal) -> Option<ConstVal> {
    match (op, v) {
        (UnaryOp::Neg, ConstVal::Int(n)) => n.checked_neg().map(ConstVal::Int),
        (UnaryOp::Not, ConstVal::Bool(b)) => Some(ConstVal::Bool(!b)),
        _ => None,
    }
}

fn fold_binary(op: BinOp, l: ConstVal, r: ConstVal) -> Option<ConstVal> {
    match (op, l, r) {
        (BinOp::Add, ConstVal::Int(a), ConstVal::Int(b)) => a.checked_add(b).map(ConstVal::Int),
        (BinOp::Sub, ConstVal::Int(a), ConstVal::Int(b)) => a.checked_sub(b).map(ConstVal::Int),
        (BinOp::Mul, ConstVal::Int(a), ConstVal::Int(b)) => a.checked_mul(b).map(ConstVal::Int),
        (BinOp::Div, ConstVal::Int(a), ConstVal::Int(b)) if b != 0 => {
            a.checked_div(b).map(ConstVal::Int)
        }
        (BinOp::Rem, ConstVal::Int(a), ConstVal::Int(b)) if b != 0 => {
            a.checked_rem(b).map(ConstVal::Int)
        }

        (BinOp::Eq, a, b) => Some(ConstVal::Bool(a == b)),
        (BinOp::Ne, a, b) => Some(ConstVal::Bool(a != b)),

        (BinOp::Lt, ConstVal::Int(a), ConstVal::Int(b)) => Some(ConstVal::Bool(a < b)),
        (BinOp::Le, ConstVal::Int(a), ConstVal::Int(b)) => Some(ConstVal::Bool(a <= b)),
        (BinOp::Gt, ConstVal::Int(a), ConstVal::Int(b)) => Some(ConstVal::Bool(a > b)),
        (BinOp::Ge, ConstVal::Int(a), ConstVal::Int(b)) => Some(ConstVal::Bool(a >= b)),

        _ => None,
    }
}
