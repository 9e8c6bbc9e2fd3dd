#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use assay_ir::{
    BinOp, Domain, Expr, ExprKind, FieldId, Place, Program, StmtKind, UnaryOp, ValueType,
    stmt_exprs, walk_expr, walk_stmts,
};
use tracing::trace;

use crate::fold::{ConstVal, fold};
use crate::interval::Interval;

const ROUNDS: usize = 5;

enum Write<'p> {
    Value(&'p Expr),
    Delta(i64),
}

/// Program-wide range of every integer field: its initializer joined with every value
/// any method can store into it.
#[derive(Clone, Debug, Default)]
pub struct FieldRanges {
    ranges: BTreeMap<FieldId, Interval>,
}

impl FieldRanges {
    pub fn compute(program: &Program) -> FieldRanges {
        let mut writes: BTreeMap<FieldId, Vec<Write<'_>>> = BTreeMap::new();
        for m in &program.methods {
            walk_stmts(&m.body, &mut |s| {
                if let StmtKind::Assign {
                    target: Place::Field(f),
                    value,
                } = &s.kind
                {
                    writes.entry(*f).or_default().push(Write::Value(value));
                }
                for root in stmt_exprs(s) {
                    walk_expr(root, &mut |e| match &e.kind {
                        ExprKind::Assign {
                            target: Place::Field(f),
                            value,
                        } => writes.entry(*f).or_default().push(Write::Value(value)),
                        ExprKind::Update {
                            op,
                            target: Place::Field(f),
                        } => writes.entry(*f).or_default().push(Write::Delta(op.delta())),
                        _ => {}
                    });
                }
            });
        }

        let init: BTreeMap<FieldId, Interval> = program
            .fields
            .iter()
            .map(|f| {
                let r = match (f.ty == ValueType::Int, f.init) {
                    (true, Some(v)) => Interval::point(i128::from(v)),
                    _ => Interval::TOP,
                };
                (f.id, r)
            })
            .collect();

        let mut ranges = init.clone();
        let mut stable = false;
        for round in 0..ROUNDS {
            let mut next_ranges = ranges.clone();
            let mut changed = false;
            for (f, ws) in &writes {
                let mut next = init.get(f).copied().unwrap_or(Interval::TOP);
                for w in ws {
                    let v = match w {
                        Write::Value(e) => static_range(e, &ranges),
                        Write::Delta(d) => ranges
                            .get(f)
                            .copied()
                            .unwrap_or(Interval::TOP)
                            .add_const(i128::from(*d)),
                    };
                    next = next.join(&v);
                }
                let current = ranges.get(f).copied().unwrap_or(Interval::TOP);
                if next.is_subset_of(&current) {
                    continue;
                }
                changed = true;
                let grown = if round == 0 {
                    current.join(&next)
                } else {
                    current.widen(&next)
                };
                next_ranges.insert(*f, grown);
            }
            ranges = next_ranges;
            if !changed {
                stable = true;
                break;
            }
        }
        if !stable {
            for f in writes.keys() {
                ranges.insert(*f, Interval::TOP);
            }
        }

        for f in &program.fields {
            let Some(r) = ranges.get_mut(&f.id) else {
                continue;
            };
            match &f.domain {
                Domain::NonNegative => *r = r.meet(&Interval::at_least(0)),
                Domain::Capped(b) => {
                    if let Some(ConstVal::Int(cap)) = fold(b) {
                        *r = r.meet(&Interval::at_most(cap));
                    }
                }
                Domain::Step(_) | Domain::Unbounded => {}
            }
            trace!(field = %program.field_name(f.id), range = %r, "field range");
        }
        FieldRanges { ranges }
    }

    pub fn range(&self, id: FieldId) -> Interval {
        self.ranges.get(&id).copied().unwrap_or(Interval::TOP)
    }
}

/// Interval of an expression that reads only constants and fields.
fn static_range(e: &Expr, fields: &BTreeMap<FieldId, Interval>) -> Interval {
    match &e.kind {
        ExprKind::Int(v) => Interval::point(i128::from(*v)),
        ExprKind::Field(f) => fields.get(f).copied().unwrap_or(Interval::TOP),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => static_range(operand, fields).neg(),
        ExprKind::Binary { op, lhs, rhs } => {
            let (l, r) = (static_range(lhs, fields), static_range(rhs, fields));
            match op {
                BinOp::Add => l.add(&r),
                BinOp::Sub => l.sub(&r),
                BinOp::Mul => l.mul(&r),
                BinOp::Div => l.div(&r),
                BinOp::Rem => l.rem(&r),
                _ => Interval::TOP,
            }
        }
        ExprKind::Assign { value, .. } => static_range(value, fields),
        _ => Interval::TOP,
    }
}
