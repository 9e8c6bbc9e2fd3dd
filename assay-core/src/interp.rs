#![forbid(unsafe_code)]

//! Path-sensitive abstract interpretation of one method.
//!
//! Integer values are linear forms over atoms; booleans are formulas over linear
//! constraints. Every path carries the facts established so far (parameter domains,
//! branch guards, assertions, successful array accesses, divisions and wrapper writes).
//! Branches are explored separately and joined with fresh atoms bound by a disjunctive
//! fact; loops are widened before their body is analyzed with the guard assumed.
//!
//! A run analyzes one method, inlining resolved callees up to the configured depth, and
//! records for every failure site whether it can be reached with the failing values and
//! for every assert of the method whether its condition is decided.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use assay_ir::{
    BinOp, Callee, Domain, Expr, ExprKind, FieldId, LogicalOp, Method, MethodId, Place, Program,
    Span, Stmt, StmtKind, UnaryOp, ValueType, format_expr, format_place, stmt_exprs, walk_expr,
    walk_stmts,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::callgraph::CallGraph;
use crate::config::AnalysisConfig;
use crate::effects::Effects;
use crate::error::Degradation;
use crate::fields::FieldRanges;
use crate::interval::{Bound, Interval};
use crate::linear::{AtomId, Constraint, Formula, Linear, Rel};
use crate::solver::{AtomTable, Sat, Solver, Theory};
use crate::summary::MethodSummary;

const LOOP_ROUNDS: usize = 3;
const RETURN_SLOT: &str = "$return";

/// Identity of an IR node within one immutable program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct NodeRef(usize);

impl NodeRef {
    pub(crate) fn of<T>(node: &T) -> Self {
        NodeRef((node as *const T).addr())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    IndexOutOfBounds,
    DivisionByZero,
    ExplicitThrow,
    WrapperViolation,
    /// A summarized callee that may fail under some of its inputs.
    CalleeFailure,
}

/// Ordered so that merging visits keeps the maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Outcome {
    Safe,
    Unknown,
    MayFail,
}

/// A failure site together with the chain of call expressions that inlined it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FailureKey {
    pub chain: Vec<NodeRef>,
    pub node: NodeRef,
    pub kind: FailureKind,
}

/// Entry values of the analyzed method's integer parameters under which a site fails.
pub type Witness = BTreeMap<String, i64>;

#[derive(Clone, Debug)]
pub(crate) struct FailureRecord {
    pub outcome: Outcome,
    pub kind: FailureKind,
    pub method: MethodId,
    pub span: Span,
    pub depth: usize,
    pub guard: Option<String>,
    pub witness: Option<Witness>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SiteVerdict {
    pub reachable: usize,
    pub tautology: usize,
    pub contradiction: usize,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct RunOutcome {
    pub failures: BTreeMap<FailureKey, FailureRecord>,
    pub sites: BTreeMap<usize, SiteVerdict>,
    pub return_range: Option<Interval>,
    /// A summary run reached a failure site it could not rule out.
    pub may_fail: bool,
    pub degradations: BTreeSet<Degradation>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RunMode {
    pub record: bool,
    pub inline_calls: bool,
    /// Ordinal of an assert of the analyzed method to treat as a no-op.
    pub skip: Option<usize>,
}

impl RunMode {
    pub(crate) fn summary() -> Self {
        Self {
            record: false,
            inline_calls: false,
            skip: None,
        }
    }

    pub(crate) fn baseline() -> Self {
        Self {
            record: true,
            inline_calls: true,
            skip: None,
        }
    }

    pub(crate) fn without(ordinal: usize) -> Self {
        Self {
            skip: Some(ordinal),
            ..Self::baseline()
        }
    }
}

/// Everything a run reads but never changes.
pub(crate) struct Context<'a> {
    pub program: &'a Program,
    pub graph: &'a CallGraph,
    pub effects: &'a Effects,
    pub fields: &'a FieldRanges,
    pub summaries: &'a BTreeMap<MethodId, MethodSummary>,
    pub config: &'a AnalysisConfig,
    pub ordinals: &'a BTreeMap<NodeRef, usize>,
}

/// Pre-order position of every assert statement within its method.
pub(crate) fn assert_ordinals(program: &Program) -> BTreeMap<NodeRef, usize> {
    let mut out = BTreeMap::new();
    for m in &program.methods {
        let mut next = 0;
        walk_stmts(&m.body, &mut |s| {
            if matches!(s.kind, StmtKind::Assert { .. }) {
                out.insert(NodeRef::of(s), next);
                next += 1;
            }
        });
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Value {
    Int(Linear),
    Bool(Formula),
    Array(Linear),
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum WrapperFact {
    NonNegative,
    Capped { cap: Linear, text: String },
    Step { step: Linear, text: String },
}

#[derive(Clone, Debug, Default)]
struct State {
    env: BTreeMap<String, Value>,
    fields: BTreeMap<FieldId, Value>,
    wrappers: BTreeMap<String, WrapperFact>,
    facts: Vec<Formula>,
    joins: usize,
    /// Changes whenever fields or array elements may have been written.
    heap: u32,
    live: bool,
}

struct Frame<'a> {
    method: &'a Method,
    chain: Vec<NodeRef>,
    returns: Vec<State>,
}

enum Merge {
    Int {
        a: Linear,
        b: Linear,
        range: Interval,
        step: Option<Linear>,
    },
    Array {
        a: Linear,
        b: Linear,
        range: Interval,
    },
    Bool {
        a: Formula,
        b: Formula,
    },
    Opaque,
}

fn bool_of(a: AtomId) -> Formula {
    let mut form = Linear::atom(a);
    form.constant = -1;
    Formula::lit(Constraint::new(form, Rel::Ge))
}

fn compare(op: BinOp, l: &Linear, r: &Linear) -> Option<Formula> {
    let (form, rel) = match op {
        BinOp::Lt => (r.sub(l)?.add_const(-1)?, Rel::Ge),
        BinOp::Le => (r.sub(l)?, Rel::Ge),
        BinOp::Gt => (l.sub(r)?.add_const(-1)?, Rel::Ge),
        BinOp::Ge => (l.sub(r)?, Rel::Ge),
        BinOp::Eq => (l.sub(r)?, Rel::Eq),
        BinOp::Ne => (l.sub(r)?, Rel::Ne),
        _ => return None,
    };
    Some(Formula::lit(Constraint::new(form, rel)))
}

fn zero() -> Linear {
    Linear::constant(0)
}

fn exact_div(l: &Linear, k: i128) -> Option<Linear> {
    if k == 0 || l.constant % k != 0 || l.terms.values().any(|c| c % k != 0) {
        return None;
    }
    Some(Linear {
        terms: l.terms.iter().map(|(a, c)| (*a, c / k)).collect(),
        constant: l.constant / k,
    })
}

/// Evaluating the expression can neither fail nor change state.
fn is_simple(e: &Expr) -> bool {
    let mut simple = true;
    walk_expr(e, &mut |x| {
        if matches!(
            x.kind,
            ExprKind::Call { .. }
                | ExprKind::Update { .. }
                | ExprKind::Assign { .. }
                | ExprKind::ArrayLoad { .. }
                | ExprKind::NewArray { .. }
                | ExprKind::Binary {
                    op: BinOp::Div | BinOp::Rem,
                    ..
                }
        ) {
            simple = false;
        }
    });
    simple
}

fn loop_assigned(cond: &Expr, body: &[Stmt]) -> (BTreeSet<String>, bool) {
    let mut names = BTreeSet::new();
    let mut touches_state = false;
    let mut visit = |e: &Expr| match &e.kind {
        ExprKind::Update { target, .. } | ExprKind::Assign { target, .. } => match target {
            Place::Local(n) => {
                names.insert(n.clone());
            }
            Place::Field(_) => touches_state = true,
            Place::Element { .. } => {}
        },
        ExprKind::Call { .. } => touches_state = true,
        _ => {}
    };
    walk_expr(cond, &mut visit);
    walk_stmts(body, &mut |s| {
        for root in stmt_exprs(s) {
            walk_expr(root, &mut visit);
        }
    });
    walk_stmts(body, &mut |s| match &s.kind {
        StmtKind::Let { name, .. } => {
            names.insert(name.clone());
        }
        StmtKind::Assign {
            target: Place::Local(n),
            ..
        } => {
            names.insert(n.clone());
        }
        StmtKind::Assign {
            target: Place::Field(_),
            ..
        } => touches_state = true,
        _ => {}
    });
    (names, touches_state)
}

pub(crate) struct Interp<'a> {
    cx: &'a Context<'a>,
    root: &'a Method,
    mode: RunMode,
    record: bool,
    /// Summary runs only note whether any failure site is possible.
    observe: bool,
    atoms: AtomTable,
    /// Entry atoms of the root's integer parameters.
    inputs: Vec<(String, AtomId)>,
    frames: Vec<Frame<'a>>,
    stmt_span: Span,
    heaps: u32,
    out: RunOutcome,
}

impl<'a> Interp<'a> {
    pub(crate) fn new(cx: &'a Context<'a>, root: &'a Method, mode: RunMode) -> Self {
        Self {
            cx,
            root,
            mode,
            record: mode.record,
            observe: !mode.record,
            atoms: AtomTable::new(),
            inputs: Vec::new(),
            frames: Vec::new(),
            stmt_span: root.span,
            heaps: 0,
            out: RunOutcome::default(),
        }
    }

    pub(crate) fn run(mut self) -> RunOutcome {
        let root = self.root;
        let mut st = State {
            live: true,
            ..State::default()
        };
        self.frames.push(Frame {
            method: root,
            chain: Vec::new(),
            returns: Vec::new(),
        });
        self.bind_entry(&mut st, root);
        self.exec_block(&mut st, &root.body);
        let returns = self
            .frames
            .pop()
            .map(|f| f.returns)
            .unwrap_or_default();
        let end = self.finish_frame(&mut st, returns);

        if root.ret == ValueType::Int && end.live {
            if let Some(Value::Int(l)) = end.env.get(RETURN_SLOT) {
                let solver = Solver::new(&self.atoms, self.cx.config.branch_budget);
                let range = solver
                    .refine(&end.facts)
                    .map_or_else(|| self.atoms.eval(l), |t| t.range_of(l));
                self.out.return_range = (!range.is_top()).then_some(range);
            }
        }
        trace!(
            method = %root.qualified_name(),
            atoms = self.atoms.len(),
            failures = self.out.failures.len(),
            "run finished"
        );
        self.out
    }

    fn current(&self) -> &'a Method {
        self.frames.last().map_or(self.root, |f| f.method)
    }

    fn depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    fn span_of(&self, e: &Expr) -> Span {
        if e.span.is_unknown() {
            self.stmt_span
        } else {
            e.span
        }
    }

    fn text(&self, e: &Expr) -> String {
        format_expr(self.cx.program, e)
    }

    fn unsupported(&mut self, what: impl Into<String>) {
        self.out
            .degradations
            .insert(Degradation::UnsupportedExpressionForm {
                method: self.current().qualified_name(),
                what: what.into(),
            });
    }

    fn touch_heap(&mut self, st: &mut State) {
        self.heaps += 1;
        st.heap = self.heaps;
    }

    fn fresh_int(&mut self, label: &str, range: Interval) -> Linear {
        Linear::atom(self.atoms.fresh(label, range))
    }

    fn fresh_bool(&mut self, label: &str) -> Formula {
        bool_of(self.atoms.fresh(label, Interval::BOOL))
    }

    fn fresh_of(&mut self, ty: &ValueType, label: &str) -> Value {
        match ty {
            ValueType::Int => Value::Int(self.fresh_int(label, Interval::TOP)),
            ValueType::Bool => Value::Bool(self.fresh_bool(label)),
            ValueType::IntArray => Value::Array(self.fresh_int(label, Interval::at_least(0))),
            ValueType::Void | ValueType::Object(_) | ValueType::Opaque => Value::Other,
        }
    }

    fn as_int(&mut self, v: Value, what: &str) -> Linear {
        match v {
            Value::Int(l) => l,
            _ => {
                self.unsupported(format!("non-integer operand in {what}"));
                self.fresh_int(what, Interval::TOP)
            }
        }
    }

    fn as_cond(&mut self, v: Value) -> Formula {
        match v {
            Value::Bool(f) => f,
            Value::Int(l) => compare(BinOp::Ne, &l, &zero()).unwrap_or(Formula::True),
            Value::Array(_) | Value::Other => self.fresh_bool("cond"),
        }
    }

    fn solver(&self) -> Solver<'_> {
        Solver::new(&self.atoms, self.cx.config.branch_budget)
    }

    fn check(&mut self, facts: &[Formula]) -> Sat {
        let sat = self.solver().check(facts);
        if sat == Sat::Unknown {
            self.out
                .degradations
                .insert(Degradation::SolverBudgetExhausted {
                    method: self.root.qualified_name(),
                });
        }
        sat
    }

    fn check_with(&mut self, st: &State, extra: Formula) -> Sat {
        let mut q = st.facts.clone();
        q.push(extra);
        self.check(&q)
    }

    fn assume(&self, st: &mut State, f: Formula) {
        match f {
            Formula::True => {}
            Formula::False => {
                st.facts.push(Formula::False);
                st.live = false;
            }
            other => st.facts.push(other),
        }
    }

    /// Marks the path dead when its unconditional facts already contradict each other.
    fn prune(&self, st: &mut State) {
        if st.live && self.solver().refine(&st.facts).is_none() {
            st.live = false;
        }
    }

    fn assume_range(&self, st: &mut State, v: &Linear, r: Interval) {
        if let Some(lo) = r.lo.finite() {
            if let Some(f) = compare(BinOp::Ge, v, &Linear::constant(lo)) {
                self.assume(st, f);
            }
        }
        if let Some(hi) = r.hi.finite() {
            if let Some(f) = compare(BinOp::Le, v, &Linear::constant(hi)) {
                self.assume(st, f);
            }
        }
    }

    /// Ranges of `forms` under the path's unconditional facts; `nonzero` forms have a
    /// zero endpoint trimmed when the facts exclude it.
    fn path_ranges(&self, st: &State, forms: &[(&Linear, bool)]) -> Vec<Interval> {
        let solver = self.solver();
        let theory: Option<Theory<'_>> = solver.refine(&st.facts);
        forms
            .iter()
            .map(|(l, nonzero)| {
                let Some(t) = &theory else {
                    return self.atoms.eval(l);
                };
                let mut r = t.range_of(l);
                if *nonzero && t.excludes_zero(l) {
                    if r.lo == Bound::Finite(0) {
                        r.lo = Bound::Finite(1);
                    }
                    if r.hi == Bound::Finite(0) {
                        r.hi = Bound::Finite(-1);
                    }
                }
                r
            })
            .collect()
    }

    fn watching(&self) -> bool {
        self.record || (self.observe && !self.out.may_fail)
    }

    fn failure(
        &mut self,
        st: &State,
        node: NodeRef,
        span: Span,
        kind: FailureKind,
        fail: Formula,
        guard: Option<String>,
    ) {
        if !self.watching() {
            return;
        }
        let mut q = st.facts.clone();
        q.push(fail);
        let outcome = if !st.live {
            Outcome::Safe
        } else {
            match self.check(&q) {
                Sat::Infeasible => Outcome::Safe,
                Sat::Feasible => Outcome::MayFail,
                Sat::Unknown => Outcome::Unknown,
            }
        };
        let witness = if self.record && outcome == Outcome::MayFail {
            self.witness(&q)
        } else {
            None
        };
        self.settle(node, span, kind, outcome, guard, witness);
    }

    fn witness(&self, facts: &[Formula]) -> Option<Witness> {
        let model = self.solver().witness(facts)?;
        let inputs: Witness = self
            .inputs
            .iter()
            .filter_map(|(name, a)| Some((name.clone(), i64::try_from(*model.get(a)?).ok()?)))
            .collect();
        (!inputs.is_empty()).then_some(inputs)
    }

    /// A call to a summarized callee that may fail: whether it fails depends on detail
    /// the summary does not keep, so a reachable call is never counted as safe.
    fn callee_failure(&mut self, st: &State, node: NodeRef, span: Span) {
        if !self.watching() {
            return;
        }
        let outcome = if !st.live {
            Outcome::Safe
        } else {
            match self.check(&st.facts) {
                Sat::Infeasible => Outcome::Safe,
                Sat::Feasible | Sat::Unknown => Outcome::Unknown,
            }
        };
        self.settle(node, span, FailureKind::CalleeFailure, outcome, None, None);
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &mut self,
        node: NodeRef,
        span: Span,
        kind: FailureKind,
        outcome: Outcome,
        guard: Option<String>,
        witness: Option<Witness>,
    ) {
        if !self.record {
            self.out.may_fail |= self.observe && outcome != Outcome::Safe;
            return;
        }
        let key = FailureKey {
            chain: self.frames.last().map(|f| f.chain.clone()).unwrap_or_default(),
            node,
            kind,
        };
        let record = FailureRecord {
            outcome,
            kind,
            method: self.current().id,
            span,
            depth: self.depth(),
            guard,
            witness,
        };
        self.out
            .failures
            .entry(key)
            .and_modify(|r| {
                r.outcome = r.outcome.max(record.outcome);
                if r.witness.is_none() {
                    r.witness = record.witness.clone();
                }
            })
            .or_insert(record);
    }

    fn verdict(&mut self, st: &State, ordinal: usize, cond: &Formula) {
        self.out.sites.entry(ordinal).or_default();
        if !st.live {
            return;
        }
        match self.check(&st.facts) {
            Sat::Infeasible => return,
            Sat::Unknown => {
                self.out.sites.entry(ordinal).or_default().reachable += 1;
                return;
            }
            Sat::Feasible => {}
        }
        let tautology = self.check_with(st, cond.not()) == Sat::Infeasible;
        let contradiction = self.check_with(st, cond.clone()) == Sat::Infeasible;
        if tautology && contradiction {
            // Each outcome refuted separately: the path itself is dead.
            return;
        }
        let v = self.out.sites.entry(ordinal).or_default();
        v.reachable += 1;
        v.tautology += usize::from(tautology);
        v.contradiction += usize::from(contradiction);
    }

    // ---- entry and wrappers -------------------------------------------------------

    fn bind_entry(&mut self, st: &mut State, method: &'a Method) {
        for p in &method.params {
            let label = format!("param:{}", p.name);
            let v = match (&p.ty, &p.domain) {
                (ValueType::Int, Domain::NonNegative) => {
                    Value::Int(self.fresh_int(&label, Interval::at_least(0)))
                }
                (ty, _) => self.fresh_of(ty, &label),
            };
            if let Some(a) = match &v {
                Value::Int(l) => l.as_atom(),
                _ => None,
            } {
                self.inputs.push((p.name.clone(), a));
            }
            st.env.insert(p.name.clone(), v);
        }
        for p in &method.params {
            if let Some(Value::Int(v)) = st.env.get(&p.name).cloned() {
                self.establish_wrapper(st, &p.name, &p.domain, v, true);
            }
        }
    }

    fn bound_value(&mut self, st: &mut State, name: &str, bound: &'a Expr) -> Linear {
        match &bound.kind {
            ExprKind::Bound(n) if n == name => {
                self.fresh_int(&format!("bound:{name}"), Interval::TOP)
            }
            _ => {
                let v = self.eval(st, bound);
                self.as_int(v, "wrapper bound")
            }
        }
    }

    fn wrapper_fact(
        &mut self,
        st: &mut State,
        name: &str,
        domain: &'a Domain,
    ) -> Option<WrapperFact> {
        match domain {
            Domain::Unbounded => None,
            Domain::NonNegative => Some(WrapperFact::NonNegative),
            Domain::Capped(b) => Some(WrapperFact::Capped {
                cap: self.bound_value(st, name, b),
                text: self.text(b),
            }),
            Domain::Step(b) => Some(WrapperFact::Step {
                step: self.bound_value(st, name, b),
                text: self.text(b),
            }),
        }
    }

    /// A wrapper that already exists satisfies its invariant.
    fn establish_wrapper(
        &mut self,
        st: &mut State,
        name: &str,
        domain: &'a Domain,
        v: Linear,
        owned: bool,
    ) {
        let Some(fact) = self.wrapper_fact(st, name, domain) else {
            return;
        };
        self.adopt_wrapper(st, name, fact, v, owned);
    }

    fn adopt_wrapper(
        &mut self,
        st: &mut State,
        name: &str,
        fact: WrapperFact,
        v: Linear,
        owned: bool,
    ) {
        let v = match &fact {
            WrapperFact::Step { step, .. } => {
                if let Some(f) = compare(BinOp::Ne, step, &zero()) {
                    self.assume(st, f);
                }
                if owned && self.own_step(&v, step) {
                    v
                } else {
                    self.with_step(st, v, step)
                }
            }
            _ => v,
        };
        let inv = self.invariant(st, &fact, &v);
        self.assume(st, inv);
        st.env.insert(name.to_string(), Value::Int(v));
        st.wrappers.insert(name.to_string(), fact);
    }

    fn invariant(&mut self, st: &mut State, fact: &WrapperFact, v: &Linear) -> Formula {
        match fact {
            WrapperFact::NonNegative => compare(BinOp::Ge, v, &zero()),
            WrapperFact::Capped { cap, .. } => compare(BinOp::Le, v, cap),
            WrapperFact::Step { step, .. } => {
                let r = self.remainder(st, v, step);
                compare(BinOp::Eq, &r, &zero())
            }
        }
        .unwrap_or(Formula::True)
    }

    /// Gives a fresh atom its step. Atoms shared with other paths are left alone.
    fn own_step(&mut self, v: &Linear, step: &Linear) -> bool {
        match v.as_atom() {
            Some(a) if self.atoms.step(a).is_none() => {
                self.atoms.set_step(a, step.clone());
                true
            }
            _ => false,
        }
    }

    /// `v`, as a value known to be a multiple of `step`.
    fn with_step(&mut self, st: &mut State, v: Linear, step: &Linear) -> Linear {
        if v.as_constant().is_some() {
            return v;
        }
        if v.as_atom().and_then(|a| self.atoms.step(a)) == Some(step) {
            return v;
        }
        let range = self.atoms.eval(&v);
        let a = self.atoms.fresh("stepped", range);
        self.atoms.set_step(a, step.clone());
        let stepped = Linear::atom(a);
        if let Some(f) = compare(BinOp::Eq, &stepped, &v) {
            self.assume(st, f);
        }
        stepped
    }

    /// The wrapper's `set`: fails when the new value breaks the invariant, which holds after.
    fn checked_set(
        &mut self,
        st: &mut State,
        fact: &WrapperFact,
        v: Linear,
        node: NodeRef,
        span: Span,
        text: &str,
    ) -> Linear {
        let inv = self.invariant(st, fact, &v);
        let (fail, guard) = match fact {
            WrapperFact::NonNegative => (inv.not(), format!("{text} >= 0")),
            WrapperFact::Capped { text: cap, .. } => (inv.not(), format!("{text} <= {cap}")),
            WrapperFact::Step { step, text: k } => {
                let zero_step = compare(BinOp::Eq, step, &zero()).unwrap_or(Formula::True);
                (
                    Formula::or(vec![zero_step.clone(), inv.not()]),
                    format!("{text} % {k} == 0"),
                )
            }
        };
        self.failure(st, node, span, FailureKind::WrapperViolation, fail, Some(guard));
        if let WrapperFact::Step { step, .. } = fact {
            if let Some(f) = compare(BinOp::Ne, step, &zero()) {
                self.assume(st, f);
            }
            self.assume(st, inv);
            return self.with_step(st, v, step);
        }
        self.assume(st, inv);
        v
    }

    fn field_wrapper(&mut self, st: &mut State, f: FieldId) -> Option<WrapperFact> {
        let decl = self.cx.program.field(f)?;
        let name = format!("{}.{}", decl.owner, decl.name);
        self.wrapper_fact(st, &name, &decl.domain)
    }

    // ---- arithmetic ---------------------------------------------------------------

    fn divisible(&self, l: &Linear, d: &Linear) -> bool {
        if let Some(k) = d.as_constant() {
            if k == 0 || l.constant % k != 0 {
                return false;
            }
            return l.terms.iter().all(|(a, c)| {
                c % k == 0
                    || self
                        .atoms
                        .step(*a)
                        .and_then(Linear::as_constant)
                        .and_then(|s| c.checked_mul(s))
                        .is_some_and(|cs| cs % k == 0)
            });
        }
        if l.constant == 0
            && l
                .terms
                .keys()
                .all(|a| self.atoms.step(*a).is_some_and(|s| s == d))
        {
            return true;
        }
        // l == m * d for a constant m
        let Some((a, c)) = d.terms.iter().next() else {
            return false;
        };
        let Some(lc) = l.terms.get(a) else {
            return false;
        };
        if lc % c != 0 {
            return false;
        }
        d.scale(lc / c).is_some_and(|m| m == *l)
    }

    fn mul(&mut self, st: &mut State, l: Linear, r: Linear) -> Linear {
        if let Some(k) = r.as_constant() {
            if let Some(p) = l.scale(k) {
                return p;
            }
        }
        if let Some(k) = l.as_constant() {
            if let Some(p) = r.scale(k) {
                return p;
            }
        }
        let (a, b) = if l <= r { (l, r) } else { (r, l) };
        let square = a == b;
        let mut global = self.atoms.eval(&a).mul(&self.atoms.eval(&b));
        let ranges = self.path_ranges(st, &[(&a, false), (&b, false)]);
        let mut local = ranges[0].mul(&ranges[1]);
        if square {
            global = global.meet(&Interval::at_least(0));
            local = local.meet(&Interval::at_least(0));
        }
        let atom = Linear::atom(self.atoms.keyed(&format!("mul:{a}*{b}"), global));
        self.assume_range(st, &atom, local);
        atom
    }

    fn quotient(&mut self, st: &mut State, l: Linear, r: Linear) -> Linear {
        if let (Some(a), Some(d)) = (l.as_constant(), r.as_constant()) {
            if let Some(q) = a.checked_div(d) {
                return Linear::constant(q);
            }
        }
        if let Some(k) = r.as_constant() {
            if let Some(q) = exact_div(&l, k) {
                return q;
            }
        }
        let global = self.atoms.eval(&l).div(&self.atoms.eval(&r));
        let ranges = self.path_ranges(st, &[(&l, false), (&r, true)]);
        let local = ranges[0].div(&ranges[1]);
        let atom = Linear::atom(self.atoms.keyed(&format!("div:{l}/{r}"), global));
        self.assume_range(st, &atom, local);
        atom
    }

    fn remainder(&mut self, st: &mut State, l: &Linear, r: &Linear) -> Linear {
        if let (Some(a), Some(d)) = (l.as_constant(), r.as_constant()) {
            if let Some(m) = a.checked_rem(d) {
                return Linear::constant(m);
            }
        }
        if self.divisible(l, r) {
            return zero();
        }
        let global = self.atoms.eval(l).rem(&self.atoms.eval(r));
        let ranges = self.path_ranges(st, &[(l, false), (r, true)]);
        let local = ranges[0].rem(&ranges[1]);
        let atom = Linear::atom(self.atoms.keyed(&format!("rem:{l}%{r}"), global));
        self.assume_range(st, &atom, local);
        atom
    }

    fn offset(&mut self, l: &Linear, k: i128, what: &str) -> Linear {
        match l.add_const(k) {
            Some(v) => v,
            None => self.fresh_int(what, Interval::TOP),
        }
    }

    // ---- statements ---------------------------------------------------------------

    fn exec_block(&mut self, st: &mut State, body: &'a [Stmt]) {
        for stmt in body {
            if !st.live {
                break;
            }
            self.exec_stmt(st, stmt);
        }
    }

    fn exec_stmt(&mut self, st: &mut State, stmt: &'a Stmt) {
        self.stmt_span = stmt.span;
        let node = NodeRef::of(stmt);
        match &stmt.kind {
            StmtKind::Let {
                name,
                ty,
                domain,
                init,
            } => {
                let v = match init {
                    Some(e) => self.eval(st, e),
                    None => self.fresh_of(ty, name),
                };
                if !domain.is_wrapper() {
                    st.env.insert(name.clone(), v);
                    return;
                }
                let v = self.as_int(v, "wrapper construction");
                let Some(fact) = self.wrapper_fact(st, name, domain) else {
                    return;
                };
                let text = init.as_ref().map_or_else(|| name.clone(), |e| self.text(e));
                let stored = self.checked_set(st, &fact, v, node, stmt.span, &text);
                st.env.insert(name.clone(), Value::Int(stored));
                st.wrappers.insert(name.clone(), fact);
            }
            StmtKind::Assign { target, value } => {
                self.assign(st, node, stmt.span, target, value);
            }
            StmtKind::ArrayStore {
                array,
                index,
                value,
            } => {
                let a = self.eval(st, array);
                let i = self.eval(st, index);
                self.eval(st, value);
                self.check_index(st, node, stmt.span, &a, i, array, index);
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let c = self.eval_cond(st, cond);
                match c.as_constant() {
                    Some(true) => self.exec_block(st, then_body),
                    Some(false) => self.exec_block(st, else_body),
                    None => {
                        let mut taken = st.clone();
                        self.assume(&mut taken, c.clone());
                        self.prune(&mut taken);
                        self.exec_block(&mut taken, then_body);
                        let mut other = mem::take(st);
                        self.assume(&mut other, c.not());
                        self.prune(&mut other);
                        self.exec_block(&mut other, else_body);
                        *st = self.join(taken, other);
                    }
                }
            }
            StmtKind::While { cond, body } => self.exec_while(st, cond, body),
            StmtKind::Assert { cond } => {
                let ordinal = if self.depth() == 0 {
                    self.cx.ordinals.get(&node).copied()
                } else {
                    None
                };
                if ordinal.is_some() && ordinal == self.mode.skip {
                    return;
                }
                let c = self.eval_cond(st, cond);
                if let (Some(ord), true) = (ordinal, self.record) {
                    self.verdict(st, ord, &c);
                }
                self.assume(st, c);
            }
            StmtKind::Return { value } => {
                let v = match value {
                    Some(e) => self.eval(st, e),
                    None => Value::Other,
                };
                if !st.live {
                    return;
                }
                let mut ret = st.clone();
                ret.env.insert(RETURN_SLOT.to_string(), v);
                if let Some(f) = self.frames.last_mut() {
                    f.returns.push(ret);
                }
                st.live = false;
            }
            StmtKind::Expr(e) => {
                self.eval(st, e);
            }
            StmtKind::Throw { .. } => {
                self.failure(st, node, stmt.span, FailureKind::ExplicitThrow, Formula::True, None);
                st.live = false;
            }
        }
    }

    fn assign(
        &mut self,
        st: &mut State,
        node: NodeRef,
        span: Span,
        target: &'a Place,
        value: &'a Expr,
    ) -> Value {
        match target {
            Place::Element { array, index } => {
                let a = self.eval(st, array);
                let i = self.eval(st, index);
                let v = self.eval(st, value);
                self.check_index(st, node, span, &a, i, array, index);
                v
            }
            Place::Local(_) | Place::Field(_) => {
                let v = self.eval(st, value);
                let text = self.text(value);
                self.write_place(st, target, v, node, span, &text)
            }
        }
    }

    /// Stores into a local or field, applying its wrapper's `set` check.
    fn write_place(
        &mut self,
        st: &mut State,
        target: &Place,
        v: Value,
        node: NodeRef,
        span: Span,
        text: &str,
    ) -> Value {
        let fact = match target {
            Place::Local(name) => st.wrappers.get(name).cloned(),
            Place::Field(f) => self.field_wrapper(st, *f),
            Place::Element { .. } => None,
        };
        let stored = match (fact, v) {
            (Some(fact), Value::Int(l)) => {
                Value::Int(self.checked_set(st, &fact, l, node, span, text))
            }
            (_, v) => v,
        };
        match target {
            Place::Local(name) => {
                st.env.insert(name.clone(), stored.clone());
            }
            Place::Field(f) => {
                st.fields.insert(*f, stored.clone());
                self.touch_heap(st);
            }
            Place::Element { .. } => self.touch_heap(st),
        }
        stored
    }

    #[allow(clippy::too_many_arguments)]
    fn check_index(
        &mut self,
        st: &mut State,
        node: NodeRef,
        span: Span,
        array: &Value,
        index: Value,
        array_expr: &Expr,
        index_expr: &Expr,
    ) {
        let len = match array {
            Value::Array(l) => l.clone(),
            _ => {
                self.unsupported("array access on a non-array value");
                self.fresh_int("len", Interval::at_least(0))
            }
        };
        let i = self.as_int(index, "array index");
        let below = compare(BinOp::Lt, &i, &zero()).unwrap_or(Formula::True);
        let above = compare(BinOp::Ge, &i, &len).unwrap_or(Formula::True);
        let fail = Formula::or(vec![below, above]);
        let (a, ix) = (self.text(array_expr), self.text(index_expr));
        let guard = format!("0 <= {ix} && {ix} < {a}.length");
        self.failure(st, node, span, FailureKind::IndexOutOfBounds, fail.clone(), Some(guard));
        self.assume(st, fail.not());
    }

    fn check_divisor(
        &mut self,
        st: &mut State,
        node: NodeRef,
        span: Span,
        d: &Linear,
        d_expr: &Expr,
    ) {
        let fail = compare(BinOp::Eq, d, &zero()).unwrap_or(Formula::True);
        let guard = format!("{} != 0", self.text(d_expr));
        self.failure(st, node, span, FailureKind::DivisionByZero, fail.clone(), Some(guard));
        self.assume(st, fail.not());
    }

    fn exec_while(&mut self, st: &mut State, cond: &'a Expr, body: &'a [Stmt]) {
        let (mut assigned, touches_state) = loop_assigned(cond, body);
        if touches_state {
            // Calls may write wrapper objects passed to them.
            assigned.extend(st.wrappers.keys().cloned());
        }
        let names: Vec<String> = assigned
            .into_iter()
            .filter(|n| st.env.contains_key(n))
            .collect();

        let mut intervals: BTreeMap<String, Interval> = BTreeMap::new();
        {
            let forms: Vec<(String, Linear)> = names
                .iter()
                .filter_map(|n| match st.env.get(n) {
                    Some(Value::Int(l)) => Some((n.clone(), l.clone())),
                    _ => None,
                })
                .collect();
            let refs: Vec<(&Linear, bool)> = forms.iter().map(|(_, l)| (l, false)).collect();
            let ranges = self.path_ranges(st, &refs);
            for ((n, _), r) in forms.iter().zip(ranges) {
                intervals.insert(n.clone(), r);
            }
        }

        let (saved_record, saved_observe) = (self.record, self.observe);
        let saved_returns = self.frames.last().map_or(0, |f| f.returns.len());
        self.record = false;
        self.observe = false;
        for round in 0..LOOP_ROUNDS {
            let mut round_state = self.loop_head(st, &names, &intervals, touches_state);
            let c = self.eval_cond(&mut round_state, cond);
            self.assume(&mut round_state, c);
            self.prune(&mut round_state);
            self.exec_block(&mut round_state, body);
            if let Some(f) = self.frames.last_mut() {
                f.returns.truncate(saved_returns);
            }
            if !round_state.live {
                break;
            }
            let forms: Vec<(String, Linear)> = names
                .iter()
                .filter_map(|n| match round_state.env.get(n) {
                    Some(Value::Int(l)) => Some((n.clone(), l.clone())),
                    _ => None,
                })
                .collect();
            let refs: Vec<(&Linear, bool)> = forms.iter().map(|(_, l)| (l, false)).collect();
            let after = self.path_ranges(&round_state, &refs);
            let mut stable = true;
            for ((n, _), r) in forms.iter().zip(after) {
                let current = intervals.get(n).copied().unwrap_or(Interval::TOP);
                if r.is_subset_of(&current) {
                    continue;
                }
                stable = false;
                let next = if round + 1 == LOOP_ROUNDS {
                    Interval::TOP
                } else {
                    current.widen(&r)
                };
                intervals.insert(n.clone(), next);
            }
            if stable {
                break;
            }
        }
        self.record = saved_record;
        self.observe = saved_observe;

        let mut head = self.loop_head(st, &names, &intervals, touches_state);
        let c = self.eval_cond(&mut head, cond);
        let mut inside = head.clone();
        self.assume(&mut inside, c.clone());
        self.prune(&mut inside);
        self.exec_block(&mut inside, body);
        self.assume(&mut head, c.not());
        self.prune(&mut head);
        *st = head;
    }

    /// State at the top of any iteration: loop-carried variables rebound to fresh atoms.
    fn loop_head(
        &mut self,
        entry: &State,
        names: &[String],
        intervals: &BTreeMap<String, Interval>,
        touches_state: bool,
    ) -> State {
        let mut head = entry.clone();
        if touches_state {
            head.fields.clear();
            self.touch_heap(&mut head);
        }
        for n in names {
            let label = format!("loop:{n}");
            let fresh = match head.env.get(n) {
                Some(Value::Int(_)) => {
                    let r = intervals.get(n).copied().unwrap_or(Interval::TOP);
                    Value::Int(self.fresh_int(&label, r))
                }
                Some(Value::Bool(_)) => Value::Bool(self.fresh_bool(&label)),
                Some(Value::Array(_)) => {
                    Value::Array(self.fresh_int(&label, Interval::at_least(0)))
                }
                Some(Value::Other) | None => continue,
            };
            head.env.insert(n.clone(), fresh.clone());
            if let (Some(fact), Value::Int(v)) = (head.wrappers.get(n).cloned(), fresh) {
                if let WrapperFact::Step { step, .. } = &fact {
                    self.own_step(&v, step);
                }
                let inv = self.invariant(&mut head, &fact, &v);
                self.assume(&mut head, inv);
            }
        }
        head
    }

    // ---- expressions --------------------------------------------------------------

    fn eval_cond(&mut self, st: &mut State, e: &'a Expr) -> Formula {
        let v = self.eval(st, e);
        self.as_cond(v)
    }

    fn eval(&mut self, st: &mut State, expr: &'a Expr) -> Value {
        let node = NodeRef::of(expr);
        match &expr.kind {
            ExprKind::Int(v) => Value::Int(Linear::constant(i128::from(*v))),
            ExprKind::Bool(b) => Value::Bool(Formula::from_bool(*b)),
            ExprKind::Var(name) => match st.env.get(name) {
                Some(v) => v.clone(),
                None => {
                    self.unsupported(format!("unbound variable `{name}`"));
                    Value::Int(self.fresh_int(name, Interval::TOP))
                }
            },
            ExprKind::Field(f) => self.read_field(st, *f),
            ExprKind::ArrayLoad { array, index } => {
                let a = self.eval(st, array);
                let i = self.eval(st, index);
                let span = self.span_of(expr);
                self.check_index(st, node, span, &a, i, array, index);
                Value::Int(self.fresh_int("element", Interval::TOP))
            }
            ExprKind::ArrayLen(array) => match self.eval(st, array) {
                Value::Array(len) => Value::Int(len),
                _ => {
                    self.unsupported("length of a non-array value");
                    Value::Int(self.fresh_int("len", Interval::at_least(0)))
                }
            },
            ExprKind::NewArray { len } => {
                let v = self.eval(st, len);
                let l = self.as_int(v, "array size");
                // A negative size throws before the array exists.
                if let Some(f) = compare(BinOp::Ge, &l, &zero()) {
                    self.assume(st, f);
                }
                Value::Array(l)
            }
            ExprKind::ArrayLit(items) => {
                for item in items {
                    self.eval(st, item);
                }
                Value::Array(Linear::constant(items.len() as i128))
            }
            ExprKind::Unary { op, operand } => {
                let v = self.eval(st, operand);
                match op {
                    UnaryOp::Not => Value::Bool(self.as_cond(v).not()),
                    UnaryOp::Neg => {
                        let l = self.as_int(v, "negation");
                        match l.scale(-1) {
                            Some(n) => Value::Int(n),
                            None => Value::Int(self.fresh_int("neg", Interval::TOP)),
                        }
                    }
                }
            }
            ExprKind::Update { op, target } => {
                let span = self.span_of(expr);
                let delta = i128::from(op.delta());
                let (old, new) = match target {
                    Place::Element { array, index } => {
                        let a = self.eval(st, array);
                        let i = self.eval(st, index);
                        self.check_index(st, node, span, &a, i, array, index);
                        let old = self.fresh_int("element", Interval::TOP);
                        let new = self.offset(&old, delta, "element");
                        (old, new)
                    }
                    Place::Local(_) | Place::Field(_) => {
                        let current = match target {
                            Place::Local(name) => st.env.get(name).cloned().unwrap_or(Value::Other),
                            Place::Field(f) => self.read_field(st, *f),
                            Place::Element { .. } => Value::Other,
                        };
                        let old = self.as_int(current, "increment");
                        let new = self.offset(&old, delta, "increment");
                        let sign = if delta > 0 { '+' } else { '-' };
                        let text = format!("{} {sign} 1", format_place(self.cx.program, target));
                        let stored =
                            self.write_place(st, target, Value::Int(new), node, span, &text);
                        let new = self.as_int(stored, "increment");
                        (old, new)
                    }
                };
                Value::Int(if op.is_post() { old } else { new })
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.eval(st, lhs);
                let r = self.eval(st, rhs);
                self.binary(st, expr, *op, l, r, rhs)
            }
            ExprKind::Logical { op, lhs, rhs } => self.logical(st, *op, lhs, rhs),
            ExprKind::Call {
                callee,
                receiver,
                args,
            } => self.call(st, expr, callee, receiver.as_deref(), args),
            ExprKind::Assign { target, value } => {
                let span = self.span_of(expr);
                self.assign(st, node, span, target, value)
            }
            ExprKind::Bound(name) => match st.wrappers.get(name) {
                Some(WrapperFact::Capped { cap: b, .. } | WrapperFact::Step { step: b, .. }) => {
                    Value::Int(b.clone())
                }
                Some(WrapperFact::NonNegative) | None => {
                    self.unsupported(format!("bound of `{name}`, which has none"));
                    Value::Int(self.fresh_int(&format!("bound:{name}"), Interval::TOP))
                }
            },
            ExprKind::Opaque(text) => {
                self.unsupported(text.clone());
                Value::Int(self.fresh_int("opaque", Interval::TOP))
            }
        }
    }

    fn binary(
        &mut self,
        st: &mut State,
        expr: &'a Expr,
        op: BinOp,
        l: Value,
        r: Value,
        rhs: &'a Expr,
    ) -> Value {
        if op.is_comparison() {
            return match (l, r) {
                (Value::Int(a), Value::Int(b)) => match compare(op, &a, &b) {
                    Some(f) => Value::Bool(f),
                    None => Value::Bool(self.fresh_bool("cmp")),
                },
                (Value::Bool(a), Value::Bool(b)) if matches!(op, BinOp::Eq | BinOp::Ne) => {
                    let same = Formula::or(vec![
                        Formula::and(vec![a.clone(), b.clone()]),
                        Formula::and(vec![a.not(), b.not()]),
                    ]);
                    Value::Bool(if op == BinOp::Eq { same } else { same.not() })
                }
                _ => {
                    self.unsupported(format!("comparison `{}` of mixed operands", op.symbol()));
                    Value::Bool(self.fresh_bool("cmp"))
                }
            };
        }
        let a = self.as_int(l, op.symbol());
        let b = self.as_int(r, op.symbol());
        let v = match op {
            BinOp::Add => a.add(&b),
            BinOp::Sub => a.sub(&b),
            BinOp::Mul => Some(self.mul(st, a, b)),
            BinOp::Div | BinOp::Rem => {
                let span = self.span_of(expr);
                self.check_divisor(st, NodeRef::of(expr), span, &b, rhs);
                Some(if op == BinOp::Div {
                    self.quotient(st, a, b)
                } else {
                    self.remainder(st, &a, &b)
                })
            }
            _ => None,
        };
        match v {
            Some(l) => Value::Int(l),
            None => Value::Int(self.fresh_int(op.symbol(), Interval::TOP)),
        }
    }

    fn logical(&mut self, st: &mut State, op: LogicalOp, lhs: &'a Expr, rhs: &'a Expr) -> Value {
        let is_and = op == LogicalOp::And;
        let a = self.eval_cond(st, lhs);
        match a.as_constant() {
            // `false && _` and `true || _` never evaluate the right operand.
            Some(v) if v != is_and => return Value::Bool(a),
            Some(_) => return Value::Bool(self.eval_cond(st, rhs)),
            None => {}
        }
        let combine = |a: Formula, b: Formula| {
            if is_and {
                Formula::and(vec![a, b])
            } else {
                Formula::or(vec![a, b])
            }
        };
        if is_simple(rhs) {
            let b = self.eval_cond(st, rhs);
            return Value::Bool(combine(a, b));
        }
        let runs_rhs = if is_and { a.clone() } else { a.not() };
        let mut taken = st.clone();
        self.assume(&mut taken, runs_rhs.clone());
        self.prune(&mut taken);
        let b = if taken.live {
            self.eval_cond(&mut taken, rhs)
        } else {
            Formula::False
        };
        let mut skipped = mem::take(st);
        self.assume(&mut skipped, runs_rhs.not());
        self.prune(&mut skipped);
        *st = self.join(taken, skipped);
        Value::Bool(combine(a, b))
    }

    fn read_field(&mut self, st: &mut State, f: FieldId) -> Value {
        if let Some(v) = st.fields.get(&f) {
            return v.clone();
        }
        let Some(decl) = self.cx.program.field(f) else {
            return Value::Other;
        };
        let label = format!("field:{}.{}", decl.owner, decl.name);
        let v = match decl.ty {
            ValueType::Int => Value::Int(self.fresh_int(&label, self.cx.fields.range(f))),
            ref ty => self.fresh_of(ty, &label),
        };
        st.fields.insert(f, v.clone());
        if let (true, Value::Int(l)) = (decl.domain.is_wrapper(), &v) {
            if let Some(fact) = self.field_wrapper(st, f) {
                if let WrapperFact::Step { step, .. } = &fact {
                    self.own_step(l, step);
                }
                let inv = self.invariant(st, &fact, l);
                self.assume(st, inv);
            }
        }
        v
    }

    // ---- calls --------------------------------------------------------------------

    fn call(
        &mut self,
        st: &mut State,
        expr: &'a Expr,
        callee: &'a Callee,
        receiver: Option<&'a Expr>,
        args: &'a [Expr],
    ) -> Value {
        if let Some(r) = receiver {
            self.eval(st, r);
        }
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.eval(st, a));
        }
        let caller = self.current();
        let Some(target) = self
            .cx
            .graph
            .resolve(caller, callee, args.len())
            .and_then(|id| self.cx.program.method(id))
        else {
            self.out
                .degradations
                .insert(Degradation::UnresolvedCallTarget {
                    caller: caller.qualified_name(),
                    callee: format!(
                        "{}.{}",
                        callee.owner.as_deref().unwrap_or(&caller.owner),
                        callee.name
                    ),
                });
            st.fields.clear();
            self.touch_heap(st);
            self.havoc_wrapper_args(st, None, args);
            return Value::Int(self.fresh_int("opaque-call", Interval::TOP));
        };

        let on_stack = self
            .frames
            .iter()
            .filter(|f| f.method.id == target.id)
            .count();
        let recursion_ok = on_stack == 0 || on_stack < self.cx.config.unroll_depth;
        let has_summary = self.cx.summaries.contains_key(&target.id);
        let wants_inline =
            self.record && self.mode.inline_calls && self.depth() < self.cx.config.inline_depth;
        if recursion_ok && (wants_inline || !has_summary) {
            return self.inline_call(st, expr, target, args, values);
        }
        if !has_summary {
            self.out
                .degradations
                .insert(Degradation::RecursionDepthExceeded {
                    method: target.qualified_name(),
                });
        }
        self.summary_call(st, expr, target, args, values)
    }

    fn havoc_wrapper_args(&mut self, st: &mut State, target: Option<&Method>, args: &[Expr]) {
        for (i, arg) in args.iter().enumerate() {
            let passes_wrapper = target
                .is_none_or(|m| m.params.get(i).is_some_and(|p| p.domain.is_wrapper()));
            let ExprKind::Var(n) = &arg.kind else {
                continue;
            };
            let Some(fact) = st.wrappers.get(n).cloned() else {
                continue;
            };
            if !passes_wrapper {
                continue;
            }
            let v = self.fresh_int(&format!("havoc:{n}"), Interval::TOP);
            self.adopt_wrapper(st, n, fact, v, true);
        }
    }

    fn summary_call(
        &mut self,
        st: &mut State,
        expr: &'a Expr,
        target: &'a Method,
        args: &'a [Expr],
        values: Vec<Value>,
    ) -> Value {
        let summary = self.cx.summaries.get(&target.id);
        if summary.is_some_and(|s| s.may_fail) {
            let span = self.span_of(expr);
            self.callee_failure(st, NodeRef::of(expr), span);
        }
        let effectful = self.cx.effects.is_effectful(target.id);
        if effectful {
            st.fields.clear();
            self.touch_heap(st);
            self.havoc_wrapper_args(st, Some(target), args);
        }
        let range = summary.and_then(|s| s.return_range).unwrap_or(Interval::TOP);
        let key = (!effectful && !values.iter().any(|v| *v == Value::Other)).then(|| {
            let rendered: Vec<String> = values
                .iter()
                .map(|v| match v {
                    Value::Int(l) => l.to_string(),
                    Value::Bool(f) => f.to_string(),
                    Value::Array(l) => format!("[{l}]"),
                    Value::Other => String::new(),
                })
                .collect();
            format!("call:{}@{}({})", target.id.0, st.heap, rendered.join(", "))
        });
        let label = format!("ret:{}", target.qualified_name());
        match target.ret {
            ValueType::Int => {
                let a = match &key {
                    Some(k) => self.atoms.keyed(k, range),
                    None => self.atoms.fresh(label, range),
                };
                Value::Int(Linear::atom(a))
            }
            ValueType::Bool => {
                let a = match &key {
                    Some(k) => self.atoms.keyed(k, Interval::BOOL),
                    None => self.atoms.fresh(label, Interval::BOOL),
                };
                Value::Bool(bool_of(a))
            }
            ref ty => self.fresh_of(ty, &label),
        }
    }

    fn inline_call(
        &mut self,
        st: &mut State,
        expr: &'a Expr,
        target: &'a Method,
        args: &'a [Expr],
        values: Vec<Value>,
    ) -> Value {
        let mut chain = self.frames.last().map(|f| f.chain.clone()).unwrap_or_default();
        chain.push(NodeRef::of(expr));
        let caller_env = mem::take(&mut st.env);
        let caller_wrappers = mem::take(&mut st.wrappers);

        for (p, v) in target.params.iter().zip(values) {
            st.env.insert(p.name.clone(), v);
        }
        for (i, p) in target.params.iter().enumerate() {
            let Some(Value::Int(v)) = st.env.get(&p.name).cloned() else {
                continue;
            };
            let passed = match args.get(i).map(|a| &a.kind) {
                Some(ExprKind::Var(n)) => caller_wrappers.get(n).cloned(),
                _ => None,
            };
            match (passed, &p.domain) {
                (Some(fact), domain) if domain.is_wrapper() && same_kind(&fact, domain) => {
                    self.adopt_wrapper(st, &p.name, fact, v, false);
                }
                _ => self.establish_wrapper(st, &p.name, &p.domain, v, false),
            }
        }

        let saved_span = self.stmt_span;
        self.frames.push(Frame {
            method: target,
            chain,
            returns: Vec::new(),
        });
        self.exec_block(st, &target.body);
        let returns = self
            .frames
            .pop()
            .map(|f| f.returns)
            .unwrap_or_default();
        self.stmt_span = saved_span;
        let mut end = self.finish_frame(st, returns);

        let result = end.env.get(RETURN_SLOT).cloned().unwrap_or(Value::Other);
        let callee_env = mem::replace(&mut end.env, caller_env);
        end.wrappers = caller_wrappers;
        for (i, p) in target.params.iter().enumerate() {
            if !p.domain.is_wrapper() {
                continue;
            }
            let Some(ExprKind::Var(n)) = args.get(i).map(|a| &a.kind) else {
                continue;
            };
            if let (true, Some(v)) = (end.wrappers.contains_key(n), callee_env.get(&p.name)) {
                end.env.insert(n.clone(), v.clone());
            }
        }
        *st = end;
        result
    }

    /// Joins every returning path of a frame with the fall-through path.
    fn finish_frame(&mut self, st: &mut State, returns: Vec<State>) -> State {
        let mut states = returns;
        if st.live {
            states.push(mem::take(st));
        }
        let mut it = states.into_iter();
        match it.next() {
            Some(first) => it.fold(first, |a, b| self.join(a, b)),
            None => {
                let mut dead = mem::take(st);
                dead.live = false;
                dead
            }
        }
    }

    // ---- joins --------------------------------------------------------------------

    fn plan<K: Ord + Clone>(
        &self,
        a: &BTreeMap<K, Value>,
        b: &BTreeMap<K, Value>,
        ta: Option<&Theory<'_>>,
        tb: Option<&Theory<'_>>,
    ) -> (BTreeMap<K, Value>, Vec<(K, Merge)>) {
        let mut same = BTreeMap::new();
        let mut merges = Vec::new();
        for (k, va) in a {
            let Some(vb) = b.get(k) else {
                continue;
            };
            if va == vb {
                same.insert(k.clone(), va.clone());
                continue;
            }
            let merge = match (va, vb) {
                (Value::Int(x), Value::Int(y)) => {
                    let step = match (x.as_atom(), y.as_atom()) {
                        (Some(p), Some(q)) => match (self.atoms.step(p), self.atoms.step(q)) {
                            (Some(s), Some(t)) if s == t => Some(s.clone()),
                            _ => None,
                        },
                        _ => None,
                    };
                    Merge::Int {
                        a: x.clone(),
                        b: y.clone(),
                        range: self.range_under(ta, x).join(&self.range_under(tb, y)),
                        step,
                    }
                }
                (Value::Array(x), Value::Array(y)) => Merge::Array {
                    a: x.clone(),
                    b: y.clone(),
                    range: self.range_under(ta, x).join(&self.range_under(tb, y)),
                },
                (Value::Bool(x), Value::Bool(y)) => Merge::Bool {
                    a: x.clone(),
                    b: y.clone(),
                },
                _ => Merge::Opaque,
            };
            merges.push((k.clone(), merge));
        }
        (same, merges)
    }

    fn range_under(&self, theory: Option<&Theory<'_>>, l: &Linear) -> Interval {
        theory.map_or_else(|| self.atoms.eval(l), |t| t.range_of(l))
    }

    fn apply(
        &mut self,
        merge: Merge,
        bind_a: &mut Vec<Formula>,
        bind_b: &mut Vec<Formula>,
    ) -> Value {
        let eq = |j: &Linear, v: &Linear| compare(BinOp::Eq, j, v).unwrap_or(Formula::True);
        match merge {
            Merge::Int { a, b, range, step } => {
                let j = self.atoms.fresh("join", range);
                if let Some(s) = step {
                    self.atoms.set_step(j, s);
                }
                let j = Linear::atom(j);
                bind_a.push(eq(&j, &a));
                bind_b.push(eq(&j, &b));
                Value::Int(j)
            }
            Merge::Array { a, b, range } => {
                let j = Linear::atom(self.atoms.fresh("join", range.meet(&Interval::at_least(0))));
                bind_a.push(eq(&j, &a));
                bind_b.push(eq(&j, &b));
                Value::Array(j)
            }
            Merge::Bool { a, b } => {
                let j = self.fresh_bool("join");
                let bind = |v: Formula| {
                    Formula::or(vec![
                        Formula::and(vec![v.clone(), j.clone()]),
                        Formula::and(vec![v.not(), j.not()]),
                    ])
                };
                bind_a.push(bind(a));
                bind_b.push(bind(b));
                Value::Bool(j)
            }
            Merge::Opaque => Value::Other,
        }
    }

    fn join(&mut self, a: State, b: State) -> State {
        if !b.live {
            return a;
        }
        if !a.live {
            return b;
        }
        let prefix = a
            .facts
            .iter()
            .zip(&b.facts)
            .take_while(|(x, y)| x == y)
            .count();

        let (env_same, env_merges, field_same, field_merges) = {
            let solver = self.solver();
            let ta = solver.refine(&a.facts);
            let tb = solver.refine(&b.facts);
            let (env_same, env_merges) = self.plan(&a.env, &b.env, ta.as_ref(), tb.as_ref());
            let (field_same, field_merges) =
                self.plan(&a.fields, &b.fields, ta.as_ref(), tb.as_ref());
            (env_same, env_merges, field_same, field_merges)
        };

        let mut bind_a = Vec::new();
        let mut bind_b = Vec::new();
        let mut env = env_same;
        let merged_names: Vec<String> = env_merges.iter().map(|(k, _)| k.clone()).collect();
        for (k, m) in env_merges {
            let v = self.apply(m, &mut bind_a, &mut bind_b);
            env.insert(k, v);
        }
        let mut fields = field_same;
        for (k, m) in field_merges {
            let v = self.apply(m, &mut bind_a, &mut bind_b);
            fields.insert(k, v);
        }
        let wrappers: BTreeMap<String, WrapperFact> = a
            .wrappers
            .iter()
            .filter(|(k, w)| b.wrappers.get(*k) == Some(*w))
            .map(|(k, w)| (k.clone(), w.clone()))
            .collect();

        let mut facts: Vec<Formula> = a.facts[..prefix].to_vec();
        let mut joins = a.joins.max(b.joins);
        let heap = if a.heap == b.heap {
            a.heap
        } else {
            self.heaps += 1;
            self.heaps
        };
        let side_a = Formula::and(a.facts[prefix..].iter().cloned().chain(bind_a).collect());
        let side_b = Formula::and(b.facts[prefix..].iter().cloned().chain(bind_b).collect());
        let disjunction = Formula::or(vec![side_a, side_b]);
        if disjunction != Formula::True {
            if joins < self.cx.config.max_join_facts {
                facts.push(disjunction);
                joins += 1;
            } else {
                trace!(joins, "join facts dropped");
            }
        }

        let mut st = State {
            env,
            fields,
            wrappers,
            facts,
            joins,
            heap,
            live: true,
        };
        // Wrapper invariants hold on every path, whatever detail was dropped above.
        for name in merged_names {
            let (Some(fact), Some(Value::Int(v))) =
                (st.wrappers.get(&name).cloned(), st.env.get(&name).cloned())
            else {
                continue;
            };
            let inv = self.invariant(&mut st, &fact, &v);
            self.assume(&mut st, inv);
        }
        st
    }
}

fn same_kind(fact: &WrapperFact, domain: &Domain) -> bool {
    matches!(
        (fact, domain),
        (WrapperFact::NonNegative, Domain::NonNegative)
            | (WrapperFact::Capped { .. }, Domain::Capped(_))
            | (WrapperFact::Step { .. }, Domain::Step(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Analysis;
    use crate::summary::SummaryCache;
    use assay_ir::build::*;
    use assay_ir::Param;

    fn run(program: &Program, method: MethodId, mode: RunMode) -> RunOutcome {
        let config = AnalysisConfig::default();
        let analysis =
            Analysis::prepare(program, &config, &mut SummaryCache::new()).expect("valid program");
        let cx = analysis.context(&config);
        let m = program.method(method).expect("method");
        Interp::new(&cx, m, mode).run()
    }

    fn tautology(out: &RunOutcome, ordinal: usize) -> bool {
        out.sites
            .get(&ordinal)
            .is_some_and(|v| v.reachable > 0 && v.tautology == v.reachable)
    }

    #[test]
    fn test_join_keeps_per_branch_ranges() {
        let mut pb = ProgramBuilder::new();
        let m = pb
            .method("T", "m")
            .param(Param::int("x"))
            .body(vec![
                let_local("y", ValueType::Int, int(0)),
                if_else(
                    gt(var("x"), int(0)),
                    vec![set(local("y"), var("x"))],
                    vec![set(local("y"), int(1))],
                ),
                assert_(gt(var("y"), int(0))),
            ])
            .build();
        let out = run(&pb.finish(), m, RunMode::baseline());
        assert!(tautology(&out, 0));
    }

    #[test]
    fn test_loop_counter_stays_non_negative() {
        let mut pb = ProgramBuilder::new();
        let m = pb
            .method("T", "count")
            .param(Param::int("n"))
            .body(vec![
                let_local("i", ValueType::Int, int(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![expr_stmt(post_inc(local("i")))],
                ),
                assert_(ge(var("i"), int(0))),
            ])
            .build();
        let out = run(&pb.finish(), m, RunMode::baseline());
        assert!(tautology(&out, 0));
    }

    #[test]
    fn test_return_range_joins_every_path() {
        let mut pb = ProgramBuilder::new();
        let f = pb
            .method("T", "clamp")
            .param(Param::int("x"))
            .returns(ValueType::Int)
            .body(vec![if_(lt(var("x"), int(0)), vec![ret(int(0))]), ret(int(5))])
            .build();
        let out = run(&pb.finish(), f, RunMode::summary());
        assert_eq!(out.return_range, Some(Interval::range(0, 5)));
        assert!(out.failures.is_empty());
    }

    #[test]
    fn test_inlined_sites_carry_the_call_chain() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "g")
            .param(Param::int("d"))
            .returns(ValueType::Int)
            .body(vec![ret(div(int(10), var("d")))])
            .build();
        let m = pb
            .method("T", "m")
            .param(Param::int("a"))
            .returns(ValueType::Int)
            .body(vec![assert_(ne(var("a"), int(0))), ret(call("g", vec![var("a")]))])
            .build();
        let program = pb.finish();

        let base = run(&program, m, RunMode::baseline());
        let (key, record) = base.failures.iter().next().expect("one failure site");
        assert_eq!(key.chain.len(), 1);
        assert_eq!(key.kind, FailureKind::DivisionByZero);
        assert_eq!((record.outcome, record.depth), (Outcome::Safe, 1));

        let removed = run(&program, m, RunMode::without(0));
        assert_eq!(removed.failures.get(key).map(|r| r.outcome), Some(Outcome::MayFail));
    }

    #[test]
    fn test_step_wrapper_remainder_is_zero() {
        let mut pb = ProgramBuilder::new();
        let m = pb
            .method("T", "m")
            .param(Param::step("s", int(4)))
            .body(vec![assert_(eq(rem(var("s"), int(2)), int(0)))])
            .build();
        let out = run(&pb.finish(), m, RunMode::baseline());
        assert!(tautology(&out, 0));
    }
}
