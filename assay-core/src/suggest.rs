#![forbid(unsafe_code)]

use assay_ir::{Program, Span};
use rayon::prelude::*;
use serde::Serialize;

use crate::classify::{Analysis, Classifier};
use crate::error::AnalysisError;
use crate::guard::exclusion;
use crate::interp::{FailureKind, Interp, Outcome, RunMode, Witness};
use crate::summary::SummaryCache;

/// A guard that would make a possibly-failing operation safe if asserted before it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct GuardSuggestion {
    /// `Owner::method` containing the operation.
    pub method: String,
    pub span: Span,
    pub kind: FailureKind,
    pub guard: String,
    /// Parameter values under which the operation fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness: Option<Witness>,
    /// A weaker assert that only rules out the witness, e.g. `b != 0 || a != 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluding: Option<String>,
}

impl Classifier {
    /// Failure sites that may fail in some method's baseline run, with a rendered guard.
    ///
    /// Only operations written directly in the analyzed method are reported; inlined
    /// callee sites surface when their own method is analyzed.
    pub fn suggest(&self, program: &Program) -> Result<Vec<GuardSuggestion>, AnalysisError> {
        let analysis = Analysis::prepare(program, self.config(), &mut SummaryCache::new())?;
        let cx = analysis.context(self.config());
        let run = |m: &assay_ir::Method| {
            let outcome = Interp::new(&cx, m, RunMode::baseline()).run();
            outcome
                .failures
                .into_values()
                .filter(|r| r.depth == 0 && r.outcome == Outcome::MayFail)
                .filter_map(|r| {
                    Some(GuardSuggestion {
                        method: m.qualified_name(),
                        span: r.span,
                        kind: r.kind,
                        guard: r.guard?,
                        excluding: r.witness.as_ref().map(exclusion),
                        witness: r.witness,
                    })
                })
                .collect::<Vec<_>>()
        };
        let mut out: Vec<GuardSuggestion> = if self.config().parallel {
            program.methods.par_iter().flat_map_iter(run).collect()
        } else {
            program.methods.iter().flat_map(run).collect()
        };
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assay_ir::build::*;
    use assay_ir::{Param, ValueType};

    #[test]
    fn test_unguarded_division_and_index() {
        let mut pb = ProgramBuilder::new();
        pb.method("Calc", "ratio")
            .param(Param::int("a"))
            .param(Param::int("b"))
            .param(Param::int_array("xs"))
            .returns(ValueType::Int)
            .body(vec![
                let_local("q", ValueType::Int, div(var("a"), var("b"))),
                ret(add(var("q"), load(var("xs"), var("a")))),
            ])
            .build();
        let suggestions = Classifier::default().suggest(&pb.finish()).expect("suggest");
        let guards: Vec<&str> = suggestions.iter().map(|s| s.guard.as_str()).collect();
        assert!(guards.contains(&"b != 0"), "{guards:?}");
        assert!(guards.contains(&"0 <= a && a < xs.length"), "{guards:?}");

        let division = suggestions
            .iter()
            .find(|s| s.kind == FailureKind::DivisionByZero)
            .expect("division");
        let witness = division.witness.as_ref().expect("witness");
        assert_eq!(witness.get("b"), Some(&0));
        assert!(division.excluding.as_deref().is_some_and(|e| e.contains("b != 0")));
    }

    #[test]
    fn test_guarded_division_needs_nothing() {
        let mut pb = ProgramBuilder::new();
        pb.method("Calc", "safe")
            .param(Param::int("b"))
            .returns(ValueType::Int)
            .body(vec![
                if_(ne(var("b"), int(0)), vec![ret(div(int(10), var("b")))]),
                ret(int(0)),
            ])
            .build();
        let suggestions = Classifier::default().suggest(&pb.finish()).expect("suggest");
        assert!(suggestions.is_empty(), "{suggestions:?}");
    }
}
