#![forbid(unsafe_code)]

pub mod callgraph;
pub mod classify;
pub mod config;
pub mod effects;
pub mod error;
pub mod fields;
pub mod fold;
mod guard;
mod interp;
pub mod interval;
pub mod linear;
pub mod solver;
pub mod suggest;
pub mod summary;

pub use classify::{
    AssertSite, ClassificationResult, Classifier, Label, SiteId, SiteReport, assert_sites,
    classify,
};
pub use config::AnalysisConfig;
pub use error::{AnalysisError, Degradation, MalformedIr};
pub use interp::{FailureKind, Witness};
pub use interval::{Bound, Interval};
pub use suggest::GuardSuggestion;
pub use summary::{MethodSummary, SummaryCache};
