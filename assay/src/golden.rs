#![forbid(unsafe_code)]

//! Expected labels for scoring runs (`assay score`). The analyzer never reads these.

use std::collections::{BTreeMap, BTreeSet};

use assay_core::{ClassificationResult, Label};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("golden table error: {message}")]
#[diagnostic(code(assay::golden))]
pub struct GoldenError {
    pub message: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GoldenEntry {
    method: String,
    ordinal: usize,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct GoldenFile {
    #[serde(default)]
    site: Vec<GoldenEntry>,
}

/// `(Owner::method, ordinal)` to expected labels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GoldenTable {
    pub sites: BTreeMap<(String, usize), BTreeSet<Label>>,
}

impl GoldenTable {
    pub fn parse(raw: &str) -> Result<Self, GoldenError> {
        let file: GoldenFile = toml::from_str(raw).map_err(|e| GoldenError {
            message: e.to_string(),
        })?;
        let mut sites = BTreeMap::new();
        for entry in file.site {
            let mut labels = BTreeSet::new();
            for name in &entry.labels {
                let label = Label::parse(name).ok_or_else(|| GoldenError {
                    message: format!(
                        "unknown label `{name}` for {}#{}",
                        entry.method, entry.ordinal
                    ),
                })?;
                labels.insert(label);
            }
            let key = (entry.method, entry.ordinal);
            if sites.contains_key(&key) {
                return Err(GoldenError {
                    message: format!("duplicate entry for {}#{}", key.0, key.1),
                });
            }
            sites.insert(key, labels);
        }
        Ok(Self { sites })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: Label,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Score {
    pub sites: usize,
    pub exact: usize,
    /// Golden entries with no matching assert in the program.
    pub missing: Vec<String>,
    pub by_label: Vec<LabelScore>,
}

/// Per-label precision/recall over the sites listed in `golden`.
///
/// Missing sites count as predicting no labels. An empty denominator scores 1.0.
pub fn score(result: &ClassificationResult, golden: &GoldenTable) -> Score {
    let mut out = Score {
        sites: golden.sites.len(),
        ..Score::default()
    };
    let mut counts: BTreeMap<Label, (usize, usize, usize)> =
        Label::ALL.into_iter().map(|l| (l, (0, 0, 0))).collect();

    for ((method, ordinal), expected) in &golden.sites {
        let found = result
            .sites
            .values()
            .any(|r| &r.site.method_name == method && r.site.id.ordinal == *ordinal);
        if !found {
            out.missing.push(format!("{method}#{ordinal}"));
        }
        let actual = result.labels(method, *ordinal);
        if &actual == expected {
            out.exact += 1;
        }
        for label in Label::ALL {
            let entry = counts.entry(label).or_default();
            match (actual.contains(&label), expected.contains(&label)) {
                (true, true) => entry.0 += 1,
                (true, false) => entry.1 += 1,
                (false, true) => entry.2 += 1,
                (false, false) => {}
            }
        }
    }

    out.by_label = counts
        .into_iter()
        .map(|(label, (tp, fp, fne))| LabelScore {
            label,
            true_positives: tp,
            false_positives: fp,
            false_negatives: fne,
            precision: ratio(tp, tp + fp),
            recall: ratio(tp, tp + fne),
        })
        .collect();
    out
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 1.0 } else { num as f64 / den as f64 }
}
