#![forbid(unsafe_code)]

//! Feasibility of path facts.
//!
//! Facts are formulas over linear constraints. Disjunctions are case-split depth first
//! under a branch budget; each branch is checked by a theory that keeps an interval per
//! gcd-normalized linear form and per atom, propagating bounds between the two until
//! nothing changes. A feasible branch can also be turned into concrete atom values by
//! pinning one atom at a time and checking every literal against the result.

use std::collections::{BTreeMap, BTreeSet};

use crate::interval::{Bound, Interval};
use crate::linear::{AtomId, Constraint, Formula, Linear, Rel};

const PROPAGATION_ROUNDS: usize = 8;

/// Concrete atom values satisfying a set of facts.
pub type Model = BTreeMap<AtomId, i128>;

#[derive(Clone, Debug)]
pub struct AtomInfo {
    pub label: String,
    pub range: Interval,
    /// The atom is known to be a multiple of this form.
    pub step: Option<Linear>,
}

#[derive(Clone, Debug, Default)]
pub struct AtomTable {
    atoms: Vec<AtomInfo>,
    keyed: BTreeMap<String, AtomId>,
}

impl AtomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, label: impl Into<String>, range: Interval) -> AtomId {
        let id = AtomId(self.atoms.len() as u32);
        self.atoms.push(AtomInfo {
            label: label.into(),
            range,
            step: None,
        });
        id
    }

    /// The atom registered under `key`, created with `range` on first use.
    pub fn keyed(&mut self, key: &str, range: Interval) -> AtomId {
        if let Some(id) = self.keyed.get(key) {
            return *id;
        }
        let id = self.fresh(key, range);
        self.keyed.insert(key.to_string(), id);
        id
    }

    pub fn lookup(&self, key: &str) -> Option<AtomId> {
        self.keyed.get(key).copied()
    }

    pub fn info(&self, id: AtomId) -> Option<&AtomInfo> {
        self.atoms.get(id.0 as usize)
    }

    pub fn range(&self, id: AtomId) -> Interval {
        self.info(id).map_or(Interval::TOP, |a| a.range)
    }

    pub fn step(&self, id: AtomId) -> Option<&Linear> {
        self.info(id).and_then(|a| a.step.as_ref())
    }

    pub fn restrict(&mut self, id: AtomId, range: Interval) {
        if let Some(a) = self.atoms.get_mut(id.0 as usize) {
            a.range = a.range.meet(&range);
        }
    }

    pub fn set_step(&mut self, id: AtomId, step: Linear) {
        if let Some(a) = self.atoms.get_mut(id.0 as usize) {
            a.step = Some(step);
        }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Interval of a form using only the declared atom ranges.
    pub fn eval(&self, form: &Linear) -> Interval {
        eval_with(form, |a| self.range(a))
    }
}

fn eval_with(form: &Linear, range: impl Fn(AtomId) -> Interval) -> Interval {
    form.terms
        .iter()
        .fold(Interval::point(form.constant), |acc, (a, c)| {
            acc.add(&range(*a).scale(*c))
        })
}

/// `form == offset + scale * key`, with `key` primitive and its first coefficient positive.
struct Canonical {
    key: Linear,
    scale: i128,
    offset: i128,
}

fn canonical(form: &Linear) -> Option<Canonical> {
    let g = form.coeff_gcd();
    if g == 0 {
        return None;
    }
    let first = form.terms.values().next().copied()?;
    let scale = if first < 0 { -g } else { g };
    let mut key = Linear::default();
    for (a, c) in &form.terms {
        key.terms.insert(*a, c / scale);
    }
    Some(Canonical {
        key,
        scale,
        offset: form.constant,
    })
}

#[derive(Clone, Debug, Default)]
struct FormState {
    range: Interval,
    excluded: BTreeSet<i128>,
}

impl FormState {
    fn shrink(&mut self) {
        while let Bound::Finite(lo) = self.range.lo {
            if !self.excluded.contains(&lo) || self.range.is_empty() {
                break;
            }
            self.range.lo = Bound::Finite(lo + 1);
        }
        while let Bound::Finite(hi) = self.range.hi {
            if !self.excluded.contains(&hi) || self.range.is_empty() {
                break;
            }
            self.range.hi = Bound::Finite(hi - 1);
        }
    }
}

/// Conjunction of literals, refined by bound propagation.
#[derive(Clone, Debug)]
pub struct Theory<'t> {
    table: &'t AtomTable,
    ranges: BTreeMap<AtomId, Interval>,
    forms: BTreeMap<Linear, FormState>,
    consistent: bool,
}

impl<'t> Theory<'t> {
    pub fn new(table: &'t AtomTable) -> Self {
        Self {
            table,
            ranges: BTreeMap::new(),
            forms: BTreeMap::new(),
            consistent: true,
        }
    }

    pub fn range(&self, a: AtomId) -> Interval {
        self.ranges
            .get(&a)
            .copied()
            .unwrap_or_else(|| self.table.range(a))
    }

    fn form_state(&mut self, key: Linear) -> &mut FormState {
        self.forms.entry(key).or_insert_with(|| FormState {
            range: Interval::TOP,
            excluded: BTreeSet::new(),
        })
    }

    /// Adds one literal; returns `false` once the conjunction is known to be inconsistent.
    pub fn add(&mut self, c: &Constraint) -> bool {
        if !self.consistent {
            return false;
        }
        if let Some(truth) = c.eval_constant() {
            self.consistent = truth;
            return truth;
        }
        let Some(Canonical { key, scale, offset }) = canonical(&c.form) else {
            return true;
        };
        // offset + scale * key REL 0
        let Some(target) = offset.checked_neg() else {
            return true;
        };
        let st = self.form_state(key);
        match c.rel {
            Rel::Ge => st.range = st.range.meet(&Interval::at_least(target).div_exact(scale)),
            Rel::Eq => st.range = st.range.meet(&Interval::point(target).div_exact(scale)),
            Rel::Ne => {
                if target % scale == 0 {
                    st.excluded.insert(target / scale);
                }
            }
        }
        st.shrink();
        if st.range.is_empty() {
            self.consistent = false;
        }
        self.consistent
    }

    fn set_range(&mut self, a: AtomId, r: Interval) -> bool {
        let old = self.range(a);
        let new = old.meet(&r);
        if new == old {
            return false;
        }
        self.ranges.insert(a, new);
        true
    }

    /// Propagates bounds; returns `false` when the literals cannot hold together.
    pub fn check(&mut self) -> bool {
        if !self.consistent {
            return false;
        }
        for _ in 0..PROPAGATION_ROUNDS {
            let mut changed = false;
            let keys: Vec<Linear> = self.forms.keys().cloned().collect();
            for key in &keys {
                let direct = eval_with(key, |a| self.range(a));
                let Some(st) = self.forms.get_mut(key) else {
                    continue;
                };
                let before = st.range;
                st.range = st.range.meet(&direct);
                st.shrink();
                if st.range.is_empty() {
                    self.consistent = false;
                    return false;
                }
                let form_range = st.range;
                changed |= form_range != before;

                for (a, c) in &key.terms {
                    let mut rest = key.clone();
                    rest.terms.remove(a);
                    let others = eval_with(&rest, |b| self.range(b));
                    let bound = form_range.sub(&others).div_exact(*c);
                    changed |= self.set_range(*a, bound);
                    if self.range(*a).is_empty() {
                        self.consistent = false;
                        return false;
                    }
                }
            }

            let atoms: BTreeSet<AtomId> =
                keys.iter().flat_map(|k| k.terms.keys().copied()).collect();
            for a in atoms {
                let Some(step) = self.table.step(a) else {
                    continue;
                };
                let Some(k) = eval_with(step, |b| self.range(b)).as_point() else {
                    continue;
                };
                if k == 0 {
                    continue;
                }
                changed |= self.set_range(a, self.range(a).align_to(k));
                if self.range(a).is_empty() {
                    self.consistent = false;
                    return false;
                }
            }

            if !changed {
                break;
            }
        }
        true
    }

    /// Best interval for a form under the literals added so far.
    pub fn range_of(&self, form: &Linear) -> Interval {
        let direct = eval_with(form, |a| self.range(a));
        let Some(Canonical { key, scale, offset }) = canonical(form) else {
            return direct;
        };
        match self.forms.get(&key) {
            Some(st) => direct.meet(&st.range.scale(scale).add_const(offset)),
            None => direct,
        }
    }

    /// True when the literals force `form != 0`.
    pub fn excludes_zero(&self, form: &Linear) -> bool {
        if !self.range_of(form).contains(0) {
            return true;
        }
        let Some(Canonical { key, scale, offset }) = canonical(form) else {
            return false;
        };
        match (self.forms.get(&key), offset.checked_neg()) {
            (Some(st), Some(target)) if target % scale == 0 => {
                st.excluded.contains(&(target / scale))
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sat {
    /// Not refuted by case splitting and propagation.
    Feasible,
    /// Proven impossible.
    Infeasible,
    /// The branch budget ran out first.
    Unknown,
}

pub struct Solver<'t> {
    table: &'t AtomTable,
    budget: usize,
}

impl<'t> Solver<'t> {
    pub fn new(table: &'t AtomTable, budget: usize) -> Self {
        Self { table, budget }
    }

    pub fn check(&self, facts: &[Formula]) -> Sat {
        self.explore(facts, &mut |_| true)
    }

    /// Values for the atoms of `facts` under which all of them hold. `None` when the facts
    /// are infeasible, the budget runs out, or no branch yields values that check out.
    pub fn witness(&self, facts: &[Formula]) -> Option<Model> {
        let mut found = None;
        let sat = self.explore(facts, &mut |lits| {
            found = self.model(lits);
            found.is_some()
        });
        if sat == Sat::Feasible { found } else { None }
    }

    fn explore(&self, facts: &[Formula], accept: &mut dyn FnMut(&[Constraint]) -> bool) -> Sat {
        let mut lits = Vec::new();
        let mut pending = Vec::new();
        for f in facts {
            if !split(f, &mut lits, &mut pending) {
                return Sat::Infeasible;
            }
        }
        let mut steps = 0;
        self.search(lits, pending, &mut steps, accept)
    }

    /// A branch with no disjunction left is feasible once `accept` takes its literals.
    fn search(
        &self,
        lits: Vec<Constraint>,
        mut pending: Vec<Vec<Formula>>,
        steps: &mut usize,
        accept: &mut dyn FnMut(&[Constraint]) -> bool,
    ) -> Sat {
        *steps += 1;
        if *steps > self.budget {
            return Sat::Unknown;
        }
        let mut theory = Theory::new(self.table);
        for c in &lits {
            if !theory.add(c) {
                return Sat::Infeasible;
            }
        }
        if !theory.check() {
            return Sat::Infeasible;
        }
        let Some(alternatives) = pending.pop() else {
            return if accept(&lits) {
                Sat::Feasible
            } else {
                Sat::Infeasible
            };
        };
        let mut unknown = false;
        for alt in alternatives {
            let mut lits = lits.clone();
            let mut pending = pending.clone();
            if !split(&alt, &mut lits, &mut pending) {
                continue;
            }
            match self.search(lits, pending, steps, accept) {
                Sat::Feasible => return Sat::Feasible,
                Sat::Unknown => unknown = true,
                Sat::Infeasible => {}
            }
        }
        if unknown { Sat::Unknown } else { Sat::Infeasible }
    }

    fn theory_of(&self, lits: &[Constraint]) -> Option<Theory<'t>> {
        let mut theory = Theory::new(self.table);
        for c in lits {
            if !theory.add(c) {
                return None;
            }
        }
        theory.check().then_some(theory)
    }

    /// Pins every atom of `lits` (and of their steps) to a value near zero that keeps the
    /// literals consistent, then evaluates each literal exactly.
    fn model(&self, lits: &[Constraint]) -> Option<Model> {
        let mut atoms: BTreeSet<AtomId> = lits
            .iter()
            .flat_map(|c| c.form.terms.keys().copied())
            .collect();
        let step_atoms: Vec<AtomId> = atoms
            .iter()
            .filter_map(|a| self.table.step(*a))
            .flat_map(|s| s.terms.keys().copied())
            .collect();
        atoms.extend(step_atoms);

        let mut fixed = lits.to_vec();
        let mut model = Model::new();
        for a in atoms {
            let range = self.theory_of(&fixed)?.range(a);
            let v = candidates(range).into_iter().find(|v| {
                fixed.push(pin(a, *v));
                let ok = self.theory_of(&fixed).is_some();
                fixed.pop();
                ok
            })?;
            fixed.push(pin(a, v));
            model.insert(a, v);
        }

        let holds = |c: &Constraint| {
            value_at(&c.form, &model).is_some_and(|k| match c.rel {
                Rel::Ge => k >= 0,
                Rel::Eq => k == 0,
                Rel::Ne => k != 0,
            })
        };
        let in_range = model.iter().all(|(a, v)| {
            self.table.range(*a).contains(*v)
                && self.table.step(*a).is_none_or(|s| {
                    value_at(s, &model).and_then(|k| v.checked_rem(k)) == Some(0)
                })
        });
        (in_range && lits.iter().all(holds)).then_some(model)
    }

    /// Propagated bounds from the unconditional literals of `facts`; `None` when those
    /// literals alone are inconsistent.
    pub fn refine(&self, facts: &[Formula]) -> Option<Theory<'t>> {
        let mut theory = Theory::new(self.table);
        for f in facts {
            if !add_units(&mut theory, f) {
                return None;
            }
        }
        theory.check().then_some(theory)
    }
}

/// `a == v`
fn pin(a: AtomId, v: i128) -> Constraint {
    let mut form = Linear::atom(a);
    form.constant = -v;
    Constraint::new(form, Rel::Eq)
}

fn value_at(form: &Linear, model: &Model) -> Option<i128> {
    form.terms.iter().try_fold(form.constant, |acc, (a, c)| {
        acc.checked_add(c.checked_mul(*model.get(a)?)?)
    })
}

/// Values of `r` closest to zero first, then its bounds.
fn candidates(r: Interval) -> Vec<i128> {
    if r.is_empty() {
        return Vec::new();
    }
    let near = match (r.lo, r.hi) {
        (Bound::Finite(lo), _) if lo > 0 => lo,
        (_, Bound::Finite(hi)) if hi < 0 => hi,
        _ => 0,
    };
    let mut out = Vec::new();
    let picks = [
        Some(near),
        near.checked_add(1),
        near.checked_sub(1),
        near.checked_add(2),
        near.checked_sub(2),
        r.lo.finite(),
        r.hi.finite(),
    ];
    for v in picks.into_iter().flatten() {
        if r.contains(v) && !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

fn add_units(theory: &mut Theory<'_>, f: &Formula) -> bool {
    match f {
        Formula::False => false,
        Formula::Lit(c) => theory.add(c),
        Formula::And(parts) => parts.iter().all(|p| add_units(theory, p)),
        Formula::True | Formula::Or(_) => true,
    }
}

/// Moves the literals of a conjunction into `lits` and its disjunctions into `pending`.
fn split(f: &Formula, lits: &mut Vec<Constraint>, pending: &mut Vec<Vec<Formula>>) -> bool {
    match f {
        Formula::True => true,
        Formula::False => false,
        Formula::Lit(c) => {
            lits.push(c.clone());
            true
        }
        Formula::And(parts) => parts.iter().all(|p| split(p, lits, pending)),
        Formula::Or(parts) => {
            pending.push(parts.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lin(terms: &[(AtomId, i128)], k: i128) -> Linear {
        let mut l = Linear::constant(k);
        for (a, c) in terms {
            l.terms.insert(*a, *c);
        }
        l
    }

    fn lit(terms: &[(AtomId, i128)], k: i128, rel: Rel) -> Formula {
        Formula::lit(Constraint::new(lin(terms, k), rel))
    }

    #[test]
    fn test_relational_facts_share_a_form() {
        let mut t = AtomTable::new();
        let a = t.fresh("a", Interval::TOP);
        let b = t.fresh("b", Interval::TOP);
        let s = Solver::new(&t, 64);
        // a == b and a - b >= 1
        let facts = vec![
            lit(&[(a, 1), (b, -1)], 0, Rel::Eq),
            lit(&[(a, 1), (b, -1)], -1, Rel::Ge),
        ];
        assert_eq!(s.check(&facts), Sat::Infeasible);
        // 2a - 2b == 0 normalizes to the same form
        let facts = vec![
            lit(&[(a, 2), (b, -2)], 0, Rel::Eq),
            lit(&[(b, 1), (a, -1)], -1, Rel::Ge),
        ];
        assert_eq!(s.check(&facts), Sat::Infeasible);
    }

    #[test]
    fn test_back_propagation_reaches_atoms() {
        let mut t = AtomTable::new();
        let i = t.fresh("i", Interval::at_least(0));
        let limit = t.fresh("limit", Interval::at_least(0));
        let s = Solver::new(&t, 64);
        // i <= limit, limit <= 99, i >= 100
        let facts = vec![
            lit(&[(limit, 1), (i, -1)], 0, Rel::Ge),
            lit(&[(limit, -1)], 99, Rel::Ge),
            lit(&[(i, 1)], -100, Rel::Ge),
        ];
        assert_eq!(s.check(&facts), Sat::Infeasible);
        assert_eq!(s.check(&facts[..2]), Sat::Feasible);
    }

    #[test]
    fn test_excluded_points_shrink_bounds() {
        let mut t = AtomTable::new();
        let a = t.fresh("a", Interval::at_least(0));
        let b = t.fresh("b", Interval::at_least(0));
        let s = Solver::new(&t, 64);
        // a + b != 0 and a + b <= 0
        let facts = vec![
            lit(&[(a, 1), (b, 1)], 0, Rel::Ne),
            lit(&[(a, -1), (b, -1)], 0, Rel::Ge),
        ];
        assert_eq!(s.check(&facts), Sat::Infeasible);
        let theory = s.refine(&facts[..1]).expect("consistent");
        assert!(theory.excludes_zero(&lin(&[(a, 1), (b, 1)], 0)));
        assert_eq!(theory.range_of(&lin(&[(a, 1), (b, 1)], 0)), Interval::at_least(1));
    }

    #[test]
    fn test_disjunctions_are_case_split() {
        let mut t = AtomTable::new();
        let x = t.fresh("x", Interval::TOP);
        let s = Solver::new(&t, 64);
        // (x <= -1 || x >= 1) && x == 0
        let facts = vec![
            Formula::or(vec![lit(&[(x, -1)], -1, Rel::Ge), lit(&[(x, 1)], -1, Rel::Ge)]),
            lit(&[(x, 1)], 0, Rel::Eq),
        ];
        assert_eq!(s.check(&facts), Sat::Infeasible);
        assert_eq!(s.check(&facts[..1]), Sat::Feasible);
    }

    #[test]
    fn test_witness_satisfies_every_fact() {
        let mut t = AtomTable::new();
        let x = t.fresh("x", Interval::TOP);
        let y = t.fresh("y", Interval::at_least(0));
        let s = Solver::new(&t, 64);
        // x - y >= 1, x != 1, (y == 3 || y == 5)
        let facts = vec![
            lit(&[(x, 1), (y, -1)], -1, Rel::Ge),
            lit(&[(x, 1)], -1, Rel::Ne),
            Formula::or(vec![lit(&[(y, 1)], -3, Rel::Eq), lit(&[(y, 1)], -5, Rel::Eq)]),
        ];
        let model = s.witness(&facts).expect("witness");
        let (vx, vy) = (model[&x], model[&y]);
        assert!(vy == 3 || vy == 5, "{model:?}");
        assert!(vx > vy && vx != 1, "{model:?}");

        // x == 0 and x != 0
        let contradictory = vec![lit(&[(x, 1)], 0, Rel::Eq), lit(&[(x, 1)], 0, Rel::Ne)];
        assert_eq!(s.witness(&contradictory), None);
    }

    #[test]
    fn test_budget_exhaustion_is_unknown() {
        let mut t = AtomTable::new();
        let x = t.fresh("x", Interval::TOP);
        let s = Solver::new(&t, 2);
        let either = Formula::or(vec![lit(&[(x, 1)], 0, Rel::Eq), lit(&[(x, 1)], -1, Rel::Eq)]);
        let facts = vec![either.clone(), either.clone(), either, lit(&[(x, 1)], -5, Rel::Eq)];
        assert_eq!(s.check(&facts), Sat::Unknown);
    }

    #[test]
    fn test_step_atoms_need_a_multiple_in_range() {
        let mut t = AtomTable::new();
        let v = t.fresh("v", Interval::TOP);
        t.set_step(v, Linear::constant(5));
        let s = Solver::new(&t, 64);
        // 1 <= v <= 4
        let facts = vec![lit(&[(v, 1)], -1, Rel::Ge), lit(&[(v, -1)], 4, Rel::Ge)];
        assert_eq!(s.check(&facts), Sat::Infeasible);
    }

    #[test]
    fn test_unsatisfiable_equality_modulo_gcd() {
        let mut t = AtomTable::new();
        let x = t.fresh("x", Interval::TOP);
        let s = Solver::new(&t, 64);
        // 2x == 3
        assert_eq!(s.check(&[lit(&[(x, 2)], -3, Rel::Eq)]), Sat::Infeasible);
        // 2x != 3 always holds
        assert_eq!(s.check(&[lit(&[(x, 2)], -3, Rel::Ne)]), Sat::Feasible);
    }
}
