#![forbid(unsafe_code)]

use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use assay_ir::MalformedIr;

/// The only way an analysis fails outright; everything else degrades precision.
#[derive(Debug, Error, Diagnostic)]
pub enum AnalysisError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Malformed(#[from] MalformedIr),
}

/// A recorded loss of precision. Each one can only remove interesting labels
/// (or add `SideEffect`), never invent them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    UnresolvedCallTarget { caller: String, callee: String },
    UnsupportedExpressionForm { method: String, what: String },
    RecursionDepthExceeded { method: String },
    SolverBudgetExhausted { method: String },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::UnresolvedCallTarget { caller, callee } => {
                write!(f, "unresolved call to `{callee}` in `{caller}`")
            }
            Degradation::UnsupportedExpressionForm { method, what } => {
                write!(f, "unsupported expression in `{method}`: {what}")
            }
            Degradation::RecursionDepthExceeded { method } => {
                write!(f, "recursion through `{method}` exceeds the unrolling depth")
            }
            Degradation::SolverBudgetExhausted { method } => {
                write!(f, "feasibility search budget exhausted in `{method}`")
            }
        }
    }
}
