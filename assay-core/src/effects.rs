#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use assay_ir::{Expr, ExprKind, Method, MethodId, Place, Program, StmtKind, stmt_exprs, walk_stmts};
use tracing::debug;

use crate::callgraph::{CallGraph, CallTarget};
use crate::fold::skips_rhs;

/// Which methods may mutate state outside their own frame.
#[derive(Clone, Debug, Default)]
pub struct Effects {
    local: BTreeMap<MethodId, bool>,
    effectful: BTreeMap<MethodId, bool>,
}

impl Effects {
    pub fn compute(program: &Program, graph: &CallGraph) -> Effects {
        let mut effects = Effects::default();
        for m in &program.methods {
            effects.local.insert(m.id, has_local_effect(m));
        }
        // Units are ordered callees-first, so every callee outside the unit is final here.
        for unit in &graph.units {
            let mut effectful = unit
                .members
                .iter()
                .any(|m| effects.local.get(m).copied().unwrap_or(true));
            if !effectful {
                effectful = unit.members.iter().any(|m| {
                    graph.live_callees(*m).any(|edge| match edge.target {
                        CallTarget::Opaque(_) => true,
                        CallTarget::Method(c) if graph.same_unit(*m, c) => false,
                        CallTarget::Method(c) => effects.is_effectful(c),
                    })
                });
            }
            for m in &unit.members {
                effects.effectful.insert(*m, effectful);
            }
        }
        debug!(
            effectful = effects.effectful.values().filter(|e| **e).count(),
            methods = program.methods.len(),
            "side effects propagated"
        );
        effects
    }

    /// Unknown methods count as effectful.
    pub fn is_effectful(&self, id: MethodId) -> bool {
        self.effectful.get(&id).copied().unwrap_or(true)
    }

    pub fn has_local_effect(&self, id: MethodId) -> bool {
        self.local.get(&id).copied().unwrap_or(true)
    }

    /// Whether evaluating `cond` inside `method` may change any state, locals included.
    /// Right operands skipped by a constant left operand are ignored.
    pub fn condition_has_side_effect(
        &self,
        graph: &CallGraph,
        method: &Method,
        cond: &Expr,
    ) -> bool {
        match &cond.kind {
            ExprKind::Update { .. } | ExprKind::Assign { .. } => true,
            ExprKind::Logical { op, lhs, rhs } => {
                self.condition_has_side_effect(graph, method, lhs)
                    || (!skips_rhs(*op, lhs) && self.condition_has_side_effect(graph, method, rhs))
            }
            ExprKind::Call { callee, args, .. } => {
                let callee_effect = match graph.resolve(method, callee, args.len()) {
                    Some(id) => self.is_effectful(id),
                    None => true,
                };
                callee_effect
                    || cond
                        .children()
                        .into_iter()
                        .any(|c| self.condition_has_side_effect(graph, method, c))
            }
            _ => cond
                .children()
                .into_iter()
                .any(|c| self.condition_has_side_effect(graph, method, c)),
        }
    }
}

/// A write that outlives the frame: fields, array elements, and wrapper objects passed in.
pub(crate) fn writes_external(method: &Method, place: &Place) -> bool {
    match place {
        Place::Local(name) => method.param(name).is_some_and(|p| p.domain.is_wrapper()),
        Place::Field(_) | Place::Element { .. } => true,
    }
}

fn has_local_effect(method: &Method) -> bool {
    let mut found = false;
    walk_stmts(&method.body, &mut |s| {
        if found {
            return;
        }
        found = match &s.kind {
            StmtKind::Assign { target, .. } => writes_external(method, target),
            StmtKind::ArrayStore { .. } => true,
            _ => false,
        } || stmt_exprs(s).into_iter().any(|e| expr_writes_external(method, e));
    });
    found
}

fn expr_writes_external(method: &Method, e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Update { target, .. } | ExprKind::Assign { target, .. }
            if writes_external(method, target) =>
        {
            true
        }
        ExprKind::Logical { op, lhs, rhs } => {
            expr_writes_external(method, lhs)
                || (!skips_rhs(*op, lhs) && expr_writes_external(method, rhs))
        }
        _ => e
            .children()
            .into_iter()
            .any(|c| expr_writes_external(method, c)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assay_ir::build::*;
    use assay_ir::{Param, ValueType};

    #[test]
    fn test_effects_propagate_through_call_chains() {
        let mut pb = ProgramBuilder::new();
        let counter = pb.static_field("Chain", "count", 0);
        let deep = pb
            .method("Chain", "deep")
            .body(vec![expr_stmt(post_inc(field_place(counter)))])
            .build();
        let mid = pb
            .method("Chain", "mid")
            .returns(ValueType::Bool)
            .body(vec![expr_stmt(call("deep", vec![])), ret(boolean(true))])
            .build();
        let top = pb
            .method("Chain", "top")
            .returns(ValueType::Bool)
            .body(vec![ret(call("mid", vec![]))])
            .build();
        let pure = pb
            .method("Chain", "pure")
            .param(Param::int("x"))
            .returns(ValueType::Int)
            .body(vec![
                let_local("y", ValueType::Int, int(0)),
                set(local("y"), add(var("x"), int(1))),
                ret(var("y")),
            ])
            .build();
        let program = pb.finish();
        let (graph, _) = CallGraph::build(&program);
        let effects = Effects::compute(&program, &graph);

        assert!(effects.has_local_effect(deep));
        assert!(!effects.has_local_effect(mid));
        assert!(effects.is_effectful(mid));
        assert!(effects.is_effectful(top));
        assert!(!effects.is_effectful(pure));
    }

    #[test]
    fn test_skipped_calls_do_not_propagate() {
        let mut pb = ProgramBuilder::new();
        let counter = pb.static_field("T", "n", 0);
        pb.method("T", "bump")
            .returns(ValueType::Bool)
            .body(vec![expr_stmt(post_inc(field_place(counter))), ret(boolean(true))])
            .build();
        let guarded = pb
            .method("T", "guarded")
            .body(vec![expr_stmt(and(boolean(false), call("bump", vec![])))])
            .build();
        let forced = pb
            .method("T", "forced")
            .body(vec![expr_stmt(or(boolean(false), call("bump", vec![])))])
            .build();
        let program = pb.finish();
        let (graph, _) = CallGraph::build(&program);
        let effects = Effects::compute(&program, &graph);

        assert!(!effects.is_effectful(guarded));
        assert!(effects.is_effectful(forced));
    }

    #[test]
    fn test_recursive_unit_inherits_member_effect() {
        let mut pb = ProgramBuilder::new();
        let arr = pb.field("T", "data", true, ValueType::IntArray, Default::default(), None);
        let a = pb
            .method("T", "a")
            .param(Param::int("n"))
            .body(vec![if_(
                gt(var("n"), int(0)),
                vec![expr_stmt(call("b", vec![sub(var("n"), int(1))]))],
            )])
            .build();
        let b = pb
            .method("T", "b")
            .param(Param::int("n"))
            .body(vec![
                store(field(arr), int(0), var("n")),
                expr_stmt(call("a", vec![var("n")])),
            ])
            .build();
        let program = pb.finish();
        let (graph, _) = CallGraph::build(&program);
        let effects = Effects::compute(&program, &graph);
        assert!(!effects.has_local_effect(a));
        assert!(effects.is_effectful(a) && effects.is_effectful(b));
    }

    #[test]
    fn test_wrapper_parameter_set_escapes() {
        let mut pb = ProgramBuilder::new();
        let m = pb
            .method("T", "withdraw")
            .param(Param::non_negative("balance"))
            .body(vec![set(local("balance"), sub(var("balance"), int(1)))])
            .build();
        let program = pb.finish();
        let (graph, _) = CallGraph::build(&program);
        assert!(Effects::compute(&program, &graph).is_effectful(m));
    }

    #[test]
    fn test_condition_side_effects() {
        let mut pb = ProgramBuilder::new();
        let counter = pb.static_field("T", "i", 0);
        pb.method("T", "bump")
            .returns(ValueType::Bool)
            .body(vec![expr_stmt(post_inc(field_place(counter))), ret(boolean(true))])
            .build();
        let m = pb.method("T", "m").param(Param::int("x")).build();
        let program = pb.finish();
        let (graph, _) = CallGraph::build(&program);
        let effects = Effects::compute(&program, &graph);
        let method = program.method(m).expect("method");

        let check = |e: &Expr| effects.condition_has_side_effect(&graph, method, e);
        assert!(check(&eq(post_inc(field_place(counter)), int(7))));
        assert!(check(&eq(assign(local("x"), int(3)), int(3))));
        assert!(check(&or(boolean(false), call("bump", vec![]))));
        assert!(!check(&and(boolean(false), call("bump", vec![]))));
        assert!(check(&call_static("Lib", "opaque", vec![])));
        assert!(!check(&gt(var("x"), int(0))));
    }
}
