#![forbid(unsafe_code)]

use crate::interp::{Outcome, RunOutcome, Witness};

/// What removing one assert does to the failure sites of its method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct GuardImpact {
    pub useful: bool,
    pub useless: bool,
    /// Inputs that reach a newly failing site.
    pub witness: Option<Witness>,
}

/// Compares the baseline run with the run where the assert was a no-op.
///
/// A site missing from a run was never reached there, which counts as safe.
pub(crate) fn impact(baseline: &RunOutcome, removed: &RunOutcome) -> GuardImpact {
    let mut exposed = removed.failures.iter().filter(|(key, r)| {
        r.outcome == Outcome::MayFail
            && baseline
                .failures
                .get(*key)
                .is_none_or(|b| b.outcome == Outcome::Safe)
    });
    let first = exposed.next();
    let useful = first.is_some();
    let witness = first
        .into_iter()
        .chain(exposed)
        .find_map(|(_, r)| r.witness.clone());
    let undecided = baseline
        .failures
        .values()
        .chain(removed.failures.values())
        .any(|r| r.outcome == Outcome::Unknown);
    GuardImpact {
        useful,
        useless: !useful && !undecided,
        witness,
    }
}

/// The assert that rules out exactly the inputs of `witness`.
pub(crate) fn exclusion(witness: &Witness) -> String {
    witness
        .iter()
        .map(|(name, v)| format!("{name} != {v}"))
        .collect::<Vec<_>>()
        .join(" || ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{FailureKey, FailureKind, FailureRecord, NodeRef};
    use assay_ir::{MethodId, Span};

    fn key(n: &u8) -> FailureKey {
        FailureKey {
            chain: Vec::new(),
            node: NodeRef::of(n),
            kind: FailureKind::DivisionByZero,
        }
    }

    fn run(sites: &[(&FailureKey, Outcome)]) -> RunOutcome {
        let mut out = RunOutcome::default();
        for (k, outcome) in sites {
            out.failures.insert(
                (*k).clone(),
                FailureRecord {
                    outcome: *outcome,
                    kind: FailureKind::DivisionByZero,
                    method: MethodId(0),
                    span: Span::default(),
                    depth: 0,
                    guard: None,
                    witness: None,
                },
            );
        }
        out
    }

    #[test]
    fn test_safe_to_may_fail_is_useful() {
        let (a, b) = (1u8, 2u8);
        let (ka, kb) = (key(&a), key(&b));
        let base = run(&[(&ka, Outcome::Safe), (&kb, Outcome::MayFail)]);
        let removed = run(&[(&ka, Outcome::MayFail), (&kb, Outcome::MayFail)]);
        assert_eq!(
            impact(&base, &removed),
            GuardImpact {
                useful: true,
                useless: false,
                witness: None,
            }
        );
        let unchanged = impact(&base, &base);
        assert!(!unchanged.useful && unchanged.useless);
    }

    #[test]
    fn test_unknown_blocks_useless() {
        let a = 1u8;
        let ka = key(&a);
        let base = run(&[(&ka, Outcome::Unknown)]);
        let verdict = impact(&base, &base);
        assert!(!verdict.useful && !verdict.useless);
    }

    #[test]
    fn test_site_reached_only_without_the_assert() {
        let a = 1u8;
        let ka = key(&a);
        let removed = run(&[(&ka, Outcome::MayFail)]);
        assert!(impact(&RunOutcome::default(), &removed).useful);
    }

    #[test]
    fn test_witness_of_exposed_site_is_kept() {
        let a = 1u8;
        let ka = key(&a);
        let mut removed = run(&[(&ka, Outcome::MayFail)]);
        let inputs: Witness = [("x".to_string(), 0), ("y".to_string(), -3)].into_iter().collect();
        if let Some(r) = removed.failures.get_mut(&ka) {
            r.witness = Some(inputs.clone());
        }
        let verdict = impact(&RunOutcome::default(), &removed);
        assert_eq!(verdict.witness.as_ref(), Some(&inputs));
        assert_eq!(exclusion(&inputs), "x != 0 || y != -3");
    }
}
