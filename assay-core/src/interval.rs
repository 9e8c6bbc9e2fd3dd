#![forbid(unsafe_code)]

//! Integer intervals over `i128` extended with infinities.
//!
//! Arithmetic that overflows `i128` saturates to the matching infinity, so every
//! operation stays an over-approximation of the mathematical result.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    NegInf,
    Finite(i128),
    PosInf,
}

impl Bound {
    pub fn finite(self) -> Option<i128> {
        match self {
            Bound::Finite(v) => Some(v),
            _ => None,
        }
    }

    fn signum(self) -> i32 {
        match self {
            Bound::NegInf => -1,
            Bound::PosInf => 1,
            Bound::Finite(v) => v.signum() as i32,
        }
    }

    fn neg(self) -> Bound {
        match self {
            Bound::NegInf => Bound::PosInf,
            Bound::PosInf => Bound::NegInf,
            Bound::Finite(v) => v.checked_neg().map_or(Bound::PosInf, Bound::Finite),
        }
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Bound::NegInf, Bound::NegInf) | (Bound::PosInf, Bound::PosInf) => Ordering::Equal,
            (Bound::NegInf, _) | (_, Bound::PosInf) => Ordering::Less,
            (_, Bound::NegInf) | (Bound::PosInf, _) => Ordering::Greater,
            (Bound::Finite(a), Bound::Finite(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::NegInf => write!(f, "-inf"),
            Bound::PosInf => write!(f, "+inf"),
            Bound::Finite(v) => write!(f, "{v}"),
        }
    }
}

fn bound_add(a: Bound, b: Bound) -> Bound {
    match (a, b) {
        // Only reachable from empty operands; callers check emptiness first.
        (Bound::NegInf, Bound::PosInf) | (Bound::PosInf, Bound::NegInf) => Bound::Finite(0),
        (Bound::NegInf, _) | (_, Bound::NegInf) => Bound::NegInf,
        (Bound::PosInf, _) | (_, Bound::PosInf) => Bound::PosInf,
        (Bound::Finite(x), Bound::Finite(y)) => x.checked_add(y).map_or(
            if x > 0 { Bound::PosInf } else { Bound::NegInf },
            Bound::Finite,
        ),
    }
}

fn bound_mul(a: Bound, b: Bound) -> Bound {
    match (a, b) {
        (Bound::Finite(0), _) | (_, Bound::Finite(0)) => Bound::Finite(0),
        (Bound::Finite(x), Bound::Finite(y)) => x.checked_mul(y).map_or(
            if (x > 0) == (y > 0) {
                Bound::PosInf
            } else {
                Bound::NegInf
            },
            Bound::Finite,
        ),
        _ => {
            if a.signum() * b.signum() > 0 {
                Bound::PosInf
            } else {
                Bound::NegInf
            }
        }
    }
}

/// Truncating division of bounds; `b` is never zero.
fn bound_div(a: Bound, b: Bound) -> Bound {
    match (a, b) {
        (Bound::Finite(x), Bound::Finite(y)) => {
            x.checked_div(y).map_or(Bound::PosInf, Bound::Finite)
        }
        (Bound::Finite(_), _) => Bound::Finite(0),
        _ => {
            if a.signum() * b.signum() > 0 {
                Bound::PosInf
            } else {
                Bound::NegInf
            }
        }
    }
}

pub(crate) fn floor_div(a: i128, b: i128) -> i128 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

pub(crate) fn ceil_div(a: i128, b: i128) -> i128 {
    let q = a / b;
    if a % b != 0 && ((a < 0) == (b < 0)) {
        q + 1
    } else {
        q
    }
}

/// A closed interval `[lo, hi]`; empty when `lo > hi`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub lo: Bound,
    pub hi: Bound,
}

impl Interval {
    pub const TOP: Interval = Interval {
        lo: Bound::NegInf,
        hi: Bound::PosInf,
    };

    pub const EMPTY: Interval = Interval {
        lo: Bound::PosInf,
        hi: Bound::NegInf,
    };

    pub const BOOL: Interval = Interval {
        lo: Bound::Finite(0),
        hi: Bound::Finite(1),
    };

    pub fn new(lo: Bound, hi: Bound) -> Self {
        Self { lo, hi }
    }

    pub fn point(v: i128) -> Self {
        Self::new(Bound::Finite(v), Bound::Finite(v))
    }

    pub fn range(lo: i128, hi: i128) -> Self {
        Self::new(Bound::Finite(lo), Bound::Finite(hi))
    }

    pub fn at_least(v: i128) -> Self {
        Self::new(Bound::Finite(v), Bound::PosInf)
    }

    pub fn at_most(v: i128) -> Self {
        Self::new(Bound::NegInf, Bound::Finite(v))
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    pub fn is_top(&self) -> bool {
        *self == Self::TOP
    }

    pub fn as_point(&self) -> Option<i128> {
        match (self.lo, self.hi) {
            (Bound::Finite(a), Bound::Finite(b)) if a == b => Some(a),
            _ => None,
        }
    }

    pub fn contains(&self, v: i128) -> bool {
        self.lo <= Bound::Finite(v) && Bound::Finite(v) <= self.hi
    }

    pub fn is_subset_of(&self, other: &Interval) -> bool {
        self.is_empty() || (other.lo <= self.lo && self.hi <= other.hi)
    }

    pub fn is_non_negative(&self) -> bool {
        self.lo >= Bound::Finite(0)
    }

    pub fn is_non_positive(&self) -> bool {
        self.hi <= Bound::Finite(0)
    }

    pub fn meet(&self, other: &Interval) -> Interval {
        Interval::new(self.lo.max(other.lo), self.hi.min(other.hi))
    }

    pub fn join(&self, other: &Interval) -> Interval {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Interval::new(self.lo.min(other.lo), self.hi.max(other.hi))
    }

    /// Join, sending every bound that moved outward to infinity.
    pub fn widen(&self, next: &Interval) -> Interval {
        if self.is_empty() {
            return *next;
        }
        if next.is_empty() {
            return *self;
        }
        let lo = if next.lo < self.lo { Bound::NegInf } else { self.lo };
        let hi = if next.hi > self.hi { Bound::PosInf } else { self.hi };
        Interval::new(lo, hi)
    }

    pub fn neg(&self) -> Interval {
        if self.is_empty() {
            return Self::EMPTY;
        }
        Interval::new(self.hi.neg(), self.lo.neg())
    }

    pub fn add(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        Interval::new(bound_add(self.lo, other.lo), bound_add(self.hi, other.hi))
    }

    pub fn sub(&self, other: &Interval) -> Interval {
        self.add(&other.neg())
    }

    pub fn add_const(&self, k: i128) -> Interval {
        self.add(&Interval::point(k))
    }

    pub fn scale(&self, k: i128) -> Interval {
        self.mul(&Interval::point(k))
    }

    pub fn mul(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        let products = [
            bound_mul(self.lo, other.lo),
            bound_mul(self.lo, other.hi),
            bound_mul(self.hi, other.lo),
            bound_mul(self.hi, other.hi),
        ];
        let lo = products.iter().copied().min().unwrap_or(Bound::NegInf);
        let hi = products.iter().copied().max().unwrap_or(Bound::PosInf);
        Interval::new(lo, hi)
    }

    /// Truncating division. Exact on points; bounded when the dividend has a known sign
    /// and the divisor's sign excludes zero; otherwise unbounded.
    pub fn div(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        if let (Some(a), Some(d)) = (self.as_point(), other.as_point()) {
            return match a.checked_div(d) {
                Some(q) => Interval::point(q),
                None => Self::TOP,
            };
        }
        let positive_divisor = other.lo >= Bound::Finite(1);
        let negative_divisor = other.hi <= Bound::Finite(-1);
        if !positive_divisor && !negative_divisor {
            return Self::TOP;
        }
        let divisor = if positive_divisor { *other } else { other.neg() };
        let quotient = if self.is_non_negative() {
            Interval::new(bound_div(self.lo, divisor.hi), bound_div(self.hi, divisor.lo))
        } else if self.is_non_positive() {
            Interval::new(bound_div(self.lo, divisor.lo), bound_div(self.hi, divisor.hi))
        } else {
            return Self::TOP;
        };
        if positive_divisor { quotient } else { quotient.neg() }
    }

    /// Truncating remainder: magnitude below the divisor's, sign of the dividend.
    pub fn rem(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        if let (Some(a), Some(d)) = (self.as_point(), other.as_point()) {
            return match a.checked_rem(d) {
                Some(r) => Interval::point(r),
                None => Self::TOP,
            };
        }
        let magnitude = other.lo.neg().max(other.hi);
        let limit = match magnitude {
            Bound::Finite(m) if m > 0 => Bound::Finite(m - 1),
            Bound::Finite(_) => return Self::TOP,
            _ => Bound::PosInf,
        };
        if self.is_non_negative() {
            Interval::new(Bound::Finite(0), limit.min(self.hi))
        } else if self.is_non_positive() {
            Interval::new(limit.neg().max(self.lo), Bound::Finite(0))
        } else {
            Interval::new(limit.neg(), limit)
        }
    }

    /// The integers `x` with `k * x` inside this interval.
    pub fn div_exact(&self, k: i128) -> Interval {
        if self.is_empty() || k == 0 {
            return if self.contains(0) { Self::TOP } else { Self::EMPTY };
        }
        let (lo, hi) = if k > 0 { (self.lo, self.hi) } else { (self.hi, self.lo) };
        let lo = match lo {
            Bound::Finite(v) => Bound::Finite(ceil_div(v, k)),
            b if k > 0 => b,
            b => b.neg(),
        };
        let hi = match hi {
            Bound::Finite(v) => Bound::Finite(floor_div(v, k)),
            b if k > 0 => b,
            b => b.neg(),
        };
        Interval::new(lo, hi)
    }

    /// Shrinks both ends to multiples of `k`.
    pub fn align_to(&self, k: i128) -> Interval {
        let k = k.abs();
        if k <= 1 || self.is_empty() {
            return *self;
        }
        let lo = match self.lo {
            Bound::Finite(v) => Bound::Finite(ceil_div(v, k).saturating_mul(k)),
            b => b,
        };
        let hi = match self.hi {
            Bound::Finite(v) => Bound::Finite(floor_div(v, k).saturating_mul(k)),
            b => b,
        };
        Interval::new(lo, hi)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::TOP
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}, {}]", self.lo, self.hi)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_mul() {
        let a = Interval::range(-2, 3);
        let b = Interval::range(4, 5);
        assert_eq!(a.add(&b), Interval::range(2, 8));
        assert_eq!(a.mul(&b), Interval::range(-10, 15));
        assert_eq!(Interval::at_least(0).mul(&Interval::at_least(0)), Interval::at_least(0));
    }

    #[test]
    fn test_overflow_saturates_to_infinity() {
        let big = Interval::point(i128::MAX);
        assert_eq!(big.add_const(1).hi, Bound::PosInf);
        assert_eq!(big.mul(&Interval::point(-2)).lo, Bound::NegInf);
    }

    #[test]
    fn test_division() {
        assert_eq!(Interval::point(7).div(&Interval::point(-2)), Interval::point(-3));
        assert_eq!(
            Interval::range(0, 100).div(&Interval::range(1, 10)),
            Interval::range(0, 100)
        );
        assert_eq!(
            Interval::range(-9, -3).div(&Interval::range(-3, -1)),
            Interval::range(1, 9)
        );
        assert_eq!(Interval::at_least(0).div(&Interval::at_least(1)), Interval::at_least(0));
        assert!(Interval::range(0, 4).div(&Interval::range(0, 2)).is_top());
        assert!(Interval::range(-1, 4).div(&Interval::range(1, 2)).is_top());
    }

    #[test]
    fn test_remainder_follows_dividend_sign() {
        assert_eq!(Interval::point(-7).rem(&Interval::point(3)), Interval::point(-1));
        assert_eq!(Interval::at_least(0).rem(&Interval::range(1, 5)), Interval::range(0, 4));
        assert_eq!(Interval::TOP.rem(&Interval::range(-5, 5)), Interval::range(-4, 4));
    }

    #[test]
    fn test_div_exact_rounds_inward() {
        assert_eq!(Interval::range(1, 7).div_exact(2), Interval::range(1, 3));
        assert_eq!(Interval::range(-7, -1).div_exact(2), Interval::range(-3, -1));
        assert_eq!(Interval::range(1, 7).div_exact(-2), Interval::range(-3, -1));
        assert_eq!(Interval::at_least(5).div_exact(-1), Interval::at_most(-5));
        assert!(Interval::range(1, 1).div_exact(2).is_empty());
    }

    #[test]
    fn test_widen_moves_growing_bounds_to_infinity() {
        let a = Interval::point(0);
        assert_eq!(a.widen(&Interval::point(1)), Interval::at_least(0));
        assert_eq!(a.widen(&Interval::point(-1)), Interval::at_most(0));
        assert_eq!(a.widen(&Interval::point(0)), a);
    }

    #[test]
    fn test_align_to_multiples() {
        assert_eq!(Interval::range(1, 14).align_to(5), Interval::range(5, 10));
        assert!(Interval::range(1, 4).align_to(5).is_empty());
    }
}
