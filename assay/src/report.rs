#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Write as _;

use assay_core::{ClassificationResult, GuardSuggestion, Label};
use serde::Serialize;

use crate::golden::Score;

#[derive(Debug, Clone, Serialize)]
pub struct CountBy {
    pub key: String,
    pub count: usize,
}

/// Label counts for one declaring type.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerStats {
    pub owner: String,
    pub sites: usize,
    pub by_label: Vec<CountBy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyReport<'a> {
    pub schema: &'static str,
    pub input: String,
    #[serde(flatten)]
    pub result: &'a ClassificationResult,
    pub stats: Vec<OwnerStats>,
}

pub fn owner_stats(result: &ClassificationResult) -> Vec<OwnerStats> {
    let mut owners: BTreeMap<&str, (usize, BTreeMap<Label, usize>)> = BTreeMap::new();
    for report in result.sites.values() {
        let owner = report
            .site
            .method_name
            .split_once("::")
            .map_or(report.site.method_name.as_str(), |(o, _)| o);
        let entry = owners.entry(owner).or_default();
        entry.0 += 1;
        for label in &report.labels {
            *entry.1.entry(*label).or_default() += 1;
        }
    }
    owners
        .into_iter()
        .map(|(owner, (sites, labels))| OwnerStats {
            owner: owner.to_string(),
            sites,
            by_label: labels
                .into_iter()
                .map(|(l, count)| CountBy {
                    key: l.to_string(),
                    count,
                })
                .collect(),
        })
        .collect()
}

pub fn classify_json(input: &str, result: &ClassificationResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&ClassifyReport {
        schema: "assay.classify.v1",
        input: input.to_string(),
        result,
        stats: owner_stats(result),
    })
}

pub fn classify_text(result: &ClassificationResult) -> String {
    let mut out = String::new();
    for report in result.sites.values() {
        let labels = report
            .labels
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let line = match report.site.span.line {
            0 => String::new(),
            n => format!(" (line {n})"),
        };
        let _ = writeln!(
            out,
            "{}#{}{line}: assert {}  =>  {}",
            report.site.method_name,
            report.site.id.ordinal,
            report.site.text,
            if labels.is_empty() { "-" } else { labels.as_str() },
        );
        if !report.reachable {
            let _ = writeln!(out, "    note: unreachable");
        }
        if let Some(witness) = &report.witness {
            let inputs = witness
                .iter()
                .map(|(name, v)| format!("{name} = {v}"))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "    fails without it for: {inputs}");
        }
    }
    for degradation in &result.degradations {
        let _ = writeln!(out, "warning: {degradation}");
    }
    for stats in owner_stats(result) {
        let counts = stats
            .by_label
            .iter()
            .map(|c| format!("{}={}", c.key, c.count))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "{}: {} assert(s) {counts}", stats.owner, stats.sites);
    }
    out
}

pub fn suggestions_text(suggestions: &[GuardSuggestion]) -> String {
    let mut out = String::new();
    for s in suggestions {
        let line = match s.span.line {
            0 => String::new(),
            n => format!(" (line {n})"),
        };
        let _ = writeln!(out, "{}{line}: assert {};", s.method, s.guard);
        if let Some(excluding) = &s.excluding {
            let _ = writeln!(out, "    failing input ruled out by: assert {excluding};");
        }
    }
    out
}

pub fn score_text(score: &Score) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "sites: {}  exact: {}", score.sites, score.exact);
    for m in &score.missing {
        let _ = writeln!(out, "missing: {m}");
    }
    let _ = writeln!(
        out,
        "{:<14} {:>4} {:>4} {:>4} {:>9} {:>7}",
        "label", "tp", "fp", "fn", "precision", "recall"
    );
    for row in &score.by_label {
        let _ = writeln!(
            out,
            "{:<14} {:>4} {:>4} {:>4} {:>9.3} {:>7.3}",
            row.label.as_str(),
            row.true_positives,
            row.false_positives,
            row.false_negatives,
            row.precision,
            row.recall,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use assay_ir::build::*;
    use assay_ir::{Param, ValueType};

    fn result() -> ClassificationResult {
        let mut pb = ProgramBuilder::new();
        pb.method("A", "m")
            .param(Param::non_negative("n"))
            .body(vec![assert_(ge(var("n"), int(0)))])
            .build();
        pb.method("B", "m")
            .body(vec![assert_(boolean(true)), assert_(boolean(true))])
            .build();
        assay_core::classify(&pb.finish()).expect("classify")
    }

    #[test]
    fn test_stats_group_by_owner() {
        let stats = owner_stats(&result());
        let owners: Vec<(&str, usize)> =
            stats.iter().map(|s| (s.owner.as_str(), s.sites)).collect();
        assert_eq!(owners, vec![("A", 1), ("B", 2)]);
        let b_taut = stats[1].by_label.iter().find(|c| c.key == "Tautology").expect("count");
        assert_eq!(b_taut.count, 2);
    }

    #[test]
    fn test_text_lists_labels_per_site() {
        let text = classify_text(&result());
        let line = text.lines().find(|l| l.starts_with("A::m#0")).expect("site line");
        assert!(line.starts_with("A::m#0 (line "), "{text}");
        assert!(line.ends_with(": assert n >= 0  =>  Useless, Tautology"), "{text}");
    }

    #[test]
    fn test_useful_sites_show_failing_inputs() {
        let mut pb = ProgramBuilder::new();
        pb.method("Calc", "inverse")
            .param(Param::int("d"))
            .body(vec![
                assert_(ne(var("d"), int(0))),
                let_local("q", ValueType::Int, div(int(1), var("d"))),
            ])
            .build();
        let text = classify_text(&assay_core::classify(&pb.finish()).expect("classify"));
        assert!(text.contains("=>  Useful"), "{text}");
        assert!(text.contains("    fails without it for: d = 0"), "{text}");
    }

    #[test]
    fn test_json_flattens_result() {
        let json = classify_json("p.json", &result()).expect("json");
        let v: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(v["schema"], "assay.classify.v1");
        assert_eq!(v["sites"].as_array().map(Vec::len), Some(3));
        assert_eq!(v["stats"][0]["owner"], "A");
    }
}
