#![forbid(unsafe_code)]

//! Linear forms over atoms and the boolean formulas built from them.

use std::collections::BTreeMap;
use std::fmt;

/// An opaque integer quantity: a parameter, a field read, an array length, a join point...
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AtomId(pub u32);

/// `constant + sum(coeff * atom)`; zero coefficients are never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Linear {
    pub terms: BTreeMap<AtomId, i128>,
    pub constant: i128,
}

impl Linear {
    pub fn constant(c: i128) -> Self {
        Self {
            terms: BTreeMap::new(),
            constant: c,
        }
    }

    pub fn atom(id: AtomId) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(id, 1);
        Self { terms, constant: 0 }
    }

    pub fn as_constant(&self) -> Option<i128> {
        self.terms.is_empty().then_some(self.constant)
    }

    /// `Some(atom)` when the form is exactly one atom with coefficient 1 and no offset.
    pub fn as_atom(&self) -> Option<AtomId> {
        match (self.terms.len(), self.constant) {
            (1, 0) => self
                .terms
                .iter()
                .next()
                .and_then(|(a, c)| (*c == 1).then_some(*a)),
            _ => None,
        }
    }

    /// Checked sum; `None` when a coefficient leaves `i128`.
    pub fn add(&self, other: &Linear) -> Option<Linear> {
        let mut out = self.clone();
        out.constant = out.constant.checked_add(other.constant)?;
        for (a, c) in &other.terms {
            let slot = out.terms.entry(*a).or_insert(0);
            *slot = slot.checked_add(*c)?;
            if *slot == 0 {
                out.terms.remove(a);
            }
        }
        Some(out)
    }

    pub fn sub(&self, other: &Linear) -> Option<Linear> {
        self.add(&other.scale(-1)?)
    }

    pub fn scale(&self, k: i128) -> Option<Linear> {
        if k == 0 {
            return Some(Linear::constant(0));
        }
        let mut terms = BTreeMap::new();
        for (a, c) in &self.terms {
            terms.insert(*a, c.checked_mul(k)?);
        }
        Some(Linear {
            terms,
            constant: self.constant.checked_mul(k)?,
        })
    }

    pub fn add_const(&self, k: i128) -> Option<Linear> {
        self.add(&Linear::constant(k))
    }

    /// Gcd of the atom coefficients (0 for a constant form).
    pub fn coeff_gcd(&self) -> i128 {
        self.terms.values().fold(0, |g, c| gcd(g, *c))
    }
}

pub(crate) fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    i128::try_from(a).unwrap_or(i128::MAX)
}

impl fmt::Display for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (a, c) in &self.terms {
            match (first, *c) {
                (true, 1) => write!(f, "a{}", a.0)?,
                (true, -1) => write!(f, "-a{}", a.0)?,
                (true, c) => write!(f, "{c}*a{}", a.0)?,
                (false, 1) => write!(f, " + a{}", a.0)?,
                (false, -1) => write!(f, " - a{}", a.0)?,
                (false, c) if c < 0 => write!(f, " - {}*a{}", -c, a.0)?,
                (false, c) => write!(f, " + {c}*a{}", a.0)?,
            }
            first = false;
        }
        match (first, self.constant) {
            (true, k) => write!(f, "{k}"),
            (false, 0) => Ok(()),
            (false, k) if k < 0 => write!(f, " - {}", -k),
            (false, k) => write!(f, " + {k}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rel {
    /// `form >= 0`
    Ge,
    /// `form == 0`
    Eq,
    /// `form != 0`
    Ne,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Constraint {
    pub form: Linear,
    pub rel: Rel,
}

impl Constraint {
    pub fn new(form: Linear, rel: Rel) -> Self {
        Self { form, rel }
    }

    pub fn negate(&self) -> Option<Constraint> {
        Some(match self.rel {
            // !(f >= 0)  <=>  -f - 1 >= 0
            Rel::Ge => Constraint::new(self.form.scale(-1)?.add_const(-1)?, Rel::Ge),
            Rel::Eq => Constraint::new(self.form.clone(), Rel::Ne),
            Rel::Ne => Constraint::new(self.form.clone(), Rel::Eq),
        })
    }

    /// Truth value when the form has no atoms.
    pub fn eval_constant(&self) -> Option<bool> {
        let k = self.form.as_constant()?;
        Some(match self.rel {
            Rel::Ge => k >= 0,
            Rel::Eq => k == 0,
            Rel::Ne => k != 0,
        })
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rel = match self.rel {
            Rel::Ge => ">=",
            Rel::Eq => "==",
            Rel::Ne => "!=",
        };
        write!(f, "{} {rel} 0", self.form)
    }
}

/// Negation-normal boolean formula over constraints.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Formula {
    True,
    False,
    Lit(Constraint),
    And(Vec<Formula>),
    Or(Vec<Formula>),
}

impl Formula {
    pub fn lit(c: Constraint) -> Formula {
        match c.eval_constant() {
            Some(true) => Formula::True,
            Some(false) => Formula::False,
            None => Formula::Lit(c),
        }
    }

    pub fn from_bool(b: bool) -> Formula {
        if b { Formula::True } else { Formula::False }
    }

    pub fn as_constant(&self) -> Option<bool> {
        match self {
            Formula::True => Some(true),
            Formula::False => Some(false),
            _ => None,
        }
    }

    pub fn and(parts: Vec<Formula>) -> Formula {
        let mut out = Vec::new();
        for p in parts {
            match p {
                Formula::True => {}
                Formula::False => return Formula::False,
                Formula::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Formula::True,
            1 => out.pop().unwrap_or(Formula::True),
            _ => Formula::And(out),
        }
    }

    pub fn or(parts: Vec<Formula>) -> Formula {
        let mut out = Vec::new();
        for p in parts {
            match p {
                Formula::False => {}
                Formula::True => return Formula::True,
                Formula::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Formula::False,
            1 => out.pop().unwrap_or(Formula::False),
            _ => Formula::Or(out),
        }
    }

    /// Negation pushed down to the literals. A literal whose negation overflows becomes
    /// `True`, which only weakens the facts it ends up in.
    pub fn not(&self) -> Formula {
        match self {
            Formula::True => Formula::False,
            Formula::False => Formula::True,
            Formula::Lit(c) => c.negate().map_or(Formula::True, Formula::lit),
            Formula::And(parts) => Formula::or(parts.iter().map(Formula::not).collect()),
            Formula::Or(parts) => Formula::and(parts.iter().map(Formula::not).collect()),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Formula::True | Formula::False | Formula::Lit(_) => 1,
            Formula::And(parts) | Formula::Or(parts) => {
                1 + parts.iter().map(Formula::size).sum::<usize>()
            }
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Formula::True => write!(f, "true"),
            Formula::False => write!(f, "false"),
            Formula::Lit(c) => write!(f, "{c}"),
            Formula::And(parts) | Formula::Or(parts) => {
                let sep = if matches!(self, Formula::And(_)) { " && " } else { " || " };
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{sep}")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
        }
    }
}
