#![forbid(unsafe_code)]

//! Method summaries and their cache.
//!
//! A summary captures what callers need from a method without re-analyzing it:
//! - whether it may mutate state outside its frame
//! - the range of integer values it can return
//! - whether a failure site in it, or in anything it calls, may be reached
//! - the structural hash of the body it was derived from

use std::collections::{BTreeMap, BTreeSet};

use assay_ir::MethodId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::interval::Interval;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSummary {
    pub method: MethodId,
    pub may_mutate_external_state: bool,
    /// `None` when nothing better than `[-inf, +inf]` is known, or the method returns no integer.
    pub return_range: Option<Interval>,
    /// Some failure site of the method or of a callee is reachable with failing values.
    #[serde(default)]
    pub may_fail: bool,
    pub structural_hash: String,
}

/// Summaries kept across classification runs, keyed by method identity and structural hash.
#[derive(Clone, Debug, Default)]
pub struct SummaryCache {
    summaries: BTreeMap<MethodId, MethodSummary>,
    /// Caller -> callees whose summaries the caller's summary was derived from.
    dependencies: BTreeMap<MethodId, BTreeSet<MethodId>>,
    config: Option<AnalysisConfig>,
    hits: usize,
}

impl SummaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    /// Lookups answered from the cache so far.
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn insert(&mut self, summary: MethodSummary) {
        self.summaries.insert(summary.method, summary);
    }

    /// Record that `caller`'s summary depends on `callee`'s.
    pub fn add_dependency(&mut self, caller: MethodId, callee: MethodId) {
        if caller != callee {
            self.dependencies.entry(caller).or_default().insert(callee);
        }
    }

    /// The cached summary of `method`, if it was derived from a body with this hash.
    pub fn get(&mut self, method: MethodId, hash: &str) -> Option<&MethodSummary> {
        let found = self
            .summaries
            .get(&method)
            .filter(|s| s.structural_hash == hash);
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    pub fn peek(&self, method: MethodId) -> Option<&MethodSummary> {
        self.summaries.get(&method)
    }

    /// Drop `method`'s summary and, transitively, every summary derived from it.
    pub fn invalidate_method(&mut self, method: MethodId) {
        let mut pending = vec![method];
        let mut seen = BTreeSet::new();
        while let Some(m) = pending.pop() {
            if !seen.insert(m) {
                continue;
            }
            self.summaries.remove(&m);
            pending.extend(
                self.dependencies
                    .iter()
                    .filter(|(_, deps)| deps.contains(&m))
                    .map(|(caller, _)| *caller),
            );
        }
        for m in &seen {
            self.dependencies.remove(m);
        }
    }

    /// Bring the cache in line with the program about to be analyzed: summaries derived
    /// under another configuration are discarded, and every method whose body changed is
    /// invalidated together with its dependents.
    pub fn reconcile(&mut self, config: &AnalysisConfig, hashes: &BTreeMap<MethodId, String>) {
        if self.config.as_ref() != Some(config) {
            self.summaries.clear();
            self.dependencies.clear();
            self.config = Some(config.clone());
        }
        let stale: Vec<MethodId> = self
            .summaries
            .iter()
            .filter(|(id, s)| hashes.get(*id) != Some(&s.structural_hash))
            .map(|(id, _)| *id)
            .collect();
        if !stale.is_empty() {
            debug!(stale = stale.len(), "invalidating cached summaries");
        }
        for id in stale {
            self.invalidate_method(id);
        }
    }
}
