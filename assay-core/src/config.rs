#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Levels a recursion unit is unrolled when deriving return ranges.
    pub unroll_depth: usize,
    /// Call depth up to which callee bodies are analyzed in place for failure sites.
    pub inline_depth: usize,
    /// Case splits allowed per feasibility query before it answers `Unknown`.
    pub branch_budget: usize,
    /// Disjunctive join facts kept per path before older branch detail is dropped.
    pub max_join_facts: usize,
    /// Summarize independent recursion units and analyze methods on the rayon pool.
    pub parallel: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            unroll_depth: 2,
            inline_depth: 2,
            branch_budget: 4096,
            max_join_facts: 16,
            parallel: true,
        }
    }
}
