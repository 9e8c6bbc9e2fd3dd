#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use assay_ir::{Callee, Expr, ExprKind, Method, MethodId, Program, Span, StmtKind, stmt_exprs};

use crate::error::Degradation;
use crate::fold::{forces_rhs, skips_rhs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallTarget {
    Method(MethodId),
    /// Index into [`CallGraph::opaque_names`]; no body is available.
    Opaque(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallEdge {
    pub caller: MethodId,
    pub target: CallTarget,
    pub span: Span,
    /// Evaluated on every execution of the caller that reaches its statement.
    pub guaranteed: bool,
    /// Inside the right operand of `&&` / `||`.
    pub short_circuit_rhs: bool,
    /// The left operand folds to the short-circuiting value, so the call never runs.
    pub skipped: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallGraphNode {
    pub method: MethodId,
    /// Indices into [`CallGraph::edges`].
    pub outgoing: Vec<usize>,
    pub incoming: Vec<usize>,
}

/// A strongly connected component of the call graph, analyzed as one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecursionUnit {
    pub id: usize,
    pub members: Vec<MethodId>,
    /// More than one member, or a member that calls itself.
    pub recursive: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    pub nodes: Vec<CallGraphNode>,
    pub edges: Vec<CallEdge>,
    pub opaque_names: Vec<String>,
    /// Callees before callers.
    pub units: Vec<RecursionUnit>,
    pub unit_of: BTreeMap<MethodId, usize>,
    /// `layers[n]` holds the units whose deepest callee chain has length `n`.
    pub layers: Vec<Vec<usize>>,
    index: BTreeMap<(String, String, usize), MethodId>,
}

impl CallGraph {
    pub fn build(program: &Program) -> (CallGraph, Vec<Degradation>) {
        let mut graph = CallGraph::default();
        for m in &program.methods {
            graph
                .index
                .entry((m.owner.clone(), m.name.clone(), m.params.len()))
                .or_insert(m.id);
            graph.nodes.push(CallGraphNode {
                method: m.id,
                outgoing: Vec::new(),
                incoming: Vec::new(),
            });
        }

        let mut degradations = Vec::new();
        let mut opaque: BTreeMap<String, usize> = BTreeMap::new();
        for m in &program.methods {
            let mut sites = Vec::new();
            collect_body_calls(&m.body, true, &mut sites);
            for site in sites {
                let target = match graph.resolve(m, site.callee, site.arity) {
                    Some(id) => CallTarget::Method(id),
                    None => {
                        let name = display_callee(m, site.callee);
                        degradations.push(Degradation::UnresolvedCallTarget {
                            caller: m.qualified_name(),
                            callee: name.clone(),
                        });
                        let next = opaque.len();
                        let idx = *opaque.entry(name).or_insert(next);
                        CallTarget::Opaque(idx)
                    }
                };
                graph.add_edge(CallEdge {
                    caller: m.id,
                    target,
                    span: site.span,
                    guaranteed: site.guaranteed,
                    short_circuit_rhs: site.short_circuit_rhs,
                    skipped: site.skipped,
                });
            }
        }
        let mut names: Vec<(usize, String)> = opaque.into_iter().map(|(n, i)| (i, n)).collect();
        names.sort();
        graph.opaque_names = names.into_iter().map(|(_, n)| n).collect();

        graph.compute_units();
        graph.compute_layers();
        (graph, degradations)
    }

    /// Static dispatch on `(owner, name, arity)`; the owner defaults to the caller's type.
    pub fn resolve(&self, caller: &Method, callee: &Callee, arity: usize) -> Option<MethodId> {
        let owner = callee.owner.as_deref().unwrap_or(&caller.owner);
        self.index
            .get(&(owner.to_string(), callee.name.clone(), arity))
            .copied()
    }

    pub fn node(&self, id: MethodId) -> Option<&CallGraphNode> {
        self.nodes.get(id.0 as usize)
    }

    /// Edges that can execute.
    pub fn live_callees(&self, id: MethodId) -> impl Iterator<Item = &CallEdge> + '_ {
        self.node(id)
            .into_iter()
            .flat_map(|n| n.outgoing.iter())
            .filter_map(|e| self.edges.get(*e))
            .filter(|e| !e.skipped)
    }

    pub fn unit(&self, id: MethodId) -> Option<&RecursionUnit> {
        self.unit_of.get(&id).and_then(|u| self.units.get(*u))
    }

    pub fn same_unit(&self, a: MethodId, b: MethodId) -> bool {
        matches!((self.unit_of.get(&a), self.unit_of.get(&b)), (Some(x), Some(y)) if x == y)
    }

    fn add_edge(&mut self, edge: CallEdge) {
        let idx = self.edges.len();
        if let Some(n) = self.nodes.get_mut(edge.caller.0 as usize) {
            n.outgoing.push(idx);
        }
        if let CallTarget::Method(callee) = edge.target {
            if let Some(n) = self.nodes.get_mut(callee.0 as usize) {
                n.incoming.push(idx);
            }
        }
        self.edges.push(edge);
    }

    fn successors(&self, id: MethodId) -> Vec<MethodId> {
        let set: BTreeSet<MethodId> = self
            .live_callees(id)
            .filter_map(|e| match e.target {
                CallTarget::Method(m) => Some(m),
                CallTarget::Opaque(_) => None,
            })
            .collect();
        set.into_iter().collect()
    }

    fn compute_units(&mut self) {
        let mut tarjan = Tarjan::new(self.nodes.len());
        for i in 0..self.nodes.len() {
            if tarjan.index[i].is_none() {
                tarjan.visit(self, i);
            }
        }
        for (id, mut members) in tarjan.components.into_iter().enumerate() {
            members.sort();
            let recursive = members.len() > 1
                || members
                    .first()
                    .is_some_and(|m| self.successors(*m).contains(m));
            for m in &members {
                self.unit_of.insert(*m, id);
            }
            self.units.push(RecursionUnit {
                id,
                members,
                recursive,
            });
        }
    }

    fn compute_layers(&mut self) {
        let mut layer_of: Vec<usize> = vec![0; self.units.len()];
        for unit in &self.units {
            let mut layer = 0;
            for m in &unit.members {
                for callee in self.successors(*m) {
                    let Some(&cu) = self.unit_of.get(&callee) else {
                        continue;
                    };
                    if cu != unit.id {
                        layer = layer.max(layer_of[cu] + 1);
                    }
                }
            }
            layer_of[unit.id] = layer;
        }
        let depth = layer_of.iter().copied().max().map_or(0, |d| d + 1);
        self.layers = vec![Vec::new(); depth];
        for (unit, layer) in layer_of.into_iter().enumerate() {
            self.layers[layer].push(unit);
        }
    }
}

/// Tarjan's algorithm; components come out callees-first.
struct Tarjan {
    next: usize,
    index: Vec<Option<usize>>,
    low: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<MethodId>>,
}

impl Tarjan {
    fn new(n: usize) -> Self {
        Self {
            next: 0,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, graph: &CallGraph, v: usize) {
        self.index[v] = Some(self.next);
        self.low[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for w in graph.successors(MethodId(v as u32)) {
            let w = w.0 as usize;
            match self.index[w] {
                None => {
                    self.visit(graph, w);
                    self.low[v] = self.low[v].min(self.low[w]);
                }
                Some(iw) if self.on_stack[w] => self.low[v] = self.low[v].min(iw),
                Some(_) => {}
            }
        }

        if Some(self.low[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(MethodId(w as u32));
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

fn display_callee(caller: &Method, callee: &Callee) -> String {
    format!(
        "{}.{}",
        callee.owner.as_deref().unwrap_or(&caller.owner),
        callee.name
    )
}

struct CallSite<'a> {
    callee: &'a Callee,
    arity: usize,
    span: Span,
    guaranteed: bool,
    short_circuit_rhs: bool,
    skipped: bool,
}

#[derive(Clone, Copy)]
struct Ctx {
    guaranteed: bool,
    rhs: bool,
    skipped: bool,
}

fn collect_body_calls<'a>(
    body: &'a [assay_ir::Stmt],
    guaranteed: bool,
    out: &mut Vec<CallSite<'a>>,
) {
    let mut guaranteed = guaranteed;
    for stmt in body {
        let ctx = Ctx {
            guaranteed,
            rhs: false,
            skipped: false,
        };
        for e in stmt_exprs(stmt) {
            collect_expr_calls(e, ctx, stmt.span, out);
        }
        match &stmt.kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                collect_body_calls(then_body, false, out);
                collect_body_calls(else_body, false, out);
            }
            StmtKind::While { body, .. } => collect_body_calls(body, false, out),
            // Nothing after these runs.
            StmtKind::Return { .. } | StmtKind::Throw { .. } => guaranteed = false,
            _ => {}
        }
    }
}

fn collect_expr_calls<'a>(expr: &'a Expr, ctx: Ctx, stmt_span: Span, out: &mut Vec<CallSite<'a>>) {
    match &expr.kind {
        ExprKind::Logical { op, lhs, rhs } => {
            collect_expr_calls(lhs, ctx, stmt_span, out);
            let rhs_ctx = Ctx {
                guaranteed: ctx.guaranteed && forces_rhs(*op, lhs),
                rhs: true,
                skipped: ctx.skipped || skips_rhs(*op, lhs),
            };
            collect_expr_calls(rhs, rhs_ctx, stmt_span, out);
        }
        ExprKind::Call { callee, args, .. } => {
            for child in expr.children() {
                collect_expr_calls(child, ctx, stmt_span, out);
            }
            out.push(CallSite {
                callee,
                arity: args.len(),
                span: if expr.span.is_unknown() {
                    stmt_span
                } else {
                    expr.span
                },
                guaranteed: ctx.guaranteed && !ctx.skipped,
                short_circuit_rhs: ctx.rhs,
                skipped: ctx.skipped,
            });
        }
        _ => {
            for child in expr.children() {
                collect_expr_calls(child, ctx, stmt_span, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assay_ir::build::*;
    use assay_ir::{Param, ValueType};

    #[test]
    fn test_units_come_out_callees_first() {
        let mut pb = ProgramBuilder::new();
        let main = pb
            .method("T", "main")
            .body(vec![expr_stmt(call("even", vec![int(4)]))])
            .build();
        let even = pb
            .method("T", "even")
            .param(Param::int("n"))
            .returns(ValueType::Bool)
            .body(vec![ret(call("odd", vec![sub(var("n"), int(1))]))])
            .build();
        let odd = pb
            .method("T", "odd")
            .param(Param::int("n"))
            .returns(ValueType::Bool)
            .body(vec![ret(call("even", vec![sub(var("n"), int(1))]))])
            .build();
        let program = pb.finish();
        let (graph, degradations) = CallGraph::build(&program);

        assert!(degradations.is_empty());
        assert_eq!(graph.units.len(), 2);
        assert!(graph.same_unit(even, odd));
        let cycle = graph.unit(even).expect("unit");
        assert!(cycle.recursive);
        assert_eq!(cycle.members, vec![even, odd]);
        // The cycle is emitted before its caller and sits one layer below it.
        assert!(graph.unit_of[&even] < graph.unit_of[&main]);
        assert_eq!(graph.layers.len(), 2);
        assert_eq!(graph.layers[1], vec![graph.unit_of[&main]]);
        assert!(!graph.unit(main).expect("unit").recursive);
    }

    #[test]
    fn test_edge_flags_follow_short_circuit_folding() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "f").returns(ValueType::Bool).build();
        let m = pb
            .method("T", "m")
            .param(Param::int("x"))
            .body(vec![
                assert_(or(boolean(false), call("f", vec![]))),
                assert_(and(boolean(false), call("f", vec![]))),
                assert_(and(gt(var("x"), int(0)), call("f", vec![]))),
            ])
            .build();
        let program = pb.finish();
        let (graph, _) = CallGraph::build(&program);
        let edges: Vec<&CallEdge> = graph
            .node(m)
            .expect("node")
            .outgoing
            .iter()
            .map(|e| &graph.edges[*e])
            .collect();

        assert_eq!(edges.len(), 3);
        assert!(edges[0].guaranteed && edges[0].short_circuit_rhs && !edges[0].skipped);
        assert!(!edges[1].guaranteed && edges[1].skipped);
        assert!(!edges[2].guaranteed && !edges[2].skipped);
        assert_eq!(graph.live_callees(m).count(), 2);
    }

    #[test]
    fn test_unresolved_calls_become_opaque() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "m")
            .body(vec![expr_stmt(call_static("Lib", "log", vec![int(1)]))])
            .build();
        let program = pb.finish();
        let (graph, degradations) = CallGraph::build(&program);
        assert_eq!(graph.opaque_names, vec!["Lib.log".to_string()]);
        assert_eq!(graph.edges[0].target, CallTarget::Opaque(0));
        assert!(matches!(
            &degradations[0],
            Degradation::UnresolvedCallTarget { callee, .. } if callee == "Lib.log"
        ));
    }

    #[test]
    fn test_resolution_uses_arity() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "g").param(Param::int("a")).build();
        let caller = pb
            .method("T", "m")
            .body(vec![expr_stmt(call("g", vec![int(1), int(2)]))])
            .build();
        let program = pb.finish();
        let (graph, degradations) = CallGraph::build(&program);
        assert_eq!(degradations.len(), 1);
        assert!(graph.live_callees(caller).all(|e| matches!(e.target, CallTarget::Opaque(_))));
    }
}
