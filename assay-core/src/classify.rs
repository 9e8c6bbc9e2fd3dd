#![forbid(unsafe_code)]

//! The classification pipeline.
//!
//! validate -> call graph -> effects -> field ranges -> summaries (layer by layer)
//! -> per-method site analysis -> merge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use assay_ir::{
    Expr, Method, MethodId, Program, Span, StmtKind, format_expr, structural_hash, validate,
    walk_stmts,
};
use rayon::prelude::*;
use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::callgraph::{CallGraph, CallTarget};
use crate::config::AnalysisConfig;
use crate::effects::Effects;
use crate::error::{AnalysisError, Degradation};
use crate::fields::FieldRanges;
use crate::fold::{ConstVal, fold};
use crate::guard::impact;
use crate::interp::{Context, Interp, NodeRef, RunMode, RunOutcome, Witness, assert_ordinals};
use crate::summary::{MethodSummary, SummaryCache};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Label {
    Useless,
    Useful,
    Tautology,
    Contradiction,
    SideEffect,
}

impl Label {
    pub const ALL: [Label; 5] = [
        Label::Useless,
        Label::Useful,
        Label::Tautology,
        Label::Contradiction,
        Label::SideEffect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Useless => "Useless",
            Label::Useful => "Useful",
            Label::Tautology => "Tautology",
            Label::Contradiction => "Contradiction",
            Label::SideEffect => "SideEffect",
        }
    }

    pub fn parse(s: &str) -> Option<Label> {
        Label::ALL.into_iter().find(|l| l.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An assert is identified by its method and its pre-order position in that method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SiteId {
    pub method: MethodId,
    pub ordinal: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssertSite {
    pub id: SiteId,
    /// `Owner::method`
    pub method_name: String,
    pub span: Span,
    pub condition: Expr,
    /// The condition as source-like text.
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SiteReport {
    pub site: AssertSite,
    pub labels: BTreeSet<Label>,
    /// Some path reaches the assert with consistent facts.
    pub reachable: bool,
    /// For a `Useful` assert: parameter values that reach a failure once it is removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness: Option<Witness>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    #[serde(serialize_with = "sites_as_list")]
    pub sites: BTreeMap<SiteId, SiteReport>,
    pub summaries: BTreeMap<MethodId, MethodSummary>,
    pub degradations: BTreeSet<Degradation>,
}

fn sites_as_list<S: Serializer>(
    sites: &BTreeMap<SiteId, SiteReport>,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.collect_seq(sites.values())
}

impl ClassificationResult {
    pub fn site(&self, id: SiteId) -> Option<&SiteReport> {
        self.sites.get(&id)
    }

    /// Labels of the `ordinal`-th assert of `Owner::method`; empty when there is no such site.
    pub fn labels(&self, method: &str, ordinal: usize) -> BTreeSet<Label> {
        self.sites
            .values()
            .find(|r| r.site.method_name == method && r.site.id.ordinal == ordinal)
            .map(|r| r.labels.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, label: Label) -> usize {
        self.sites.values().filter(|r| r.labels.contains(&label)).count()
    }
}

/// Every assert of `method`, in pre-order.
pub fn assert_sites(program: &Program, method: &Method) -> Vec<AssertSite> {
    let mut out = Vec::new();
    walk_stmts(&method.body, &mut |s| {
        if let StmtKind::Assert { cond } = &s.kind {
            out.push(AssertSite {
                id: SiteId {
                    method: method.id,
                    ordinal: out.len(),
                },
                method_name: method.qualified_name(),
                span: if s.span.is_unknown() { cond.span } else { s.span },
                condition: cond.clone(),
                text: format_expr(program, cond),
            });
        }
    });
    out
}

#[derive(Clone, Debug, Default)]
pub struct Classifier {
    config: AnalysisConfig,
}

impl Classifier {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn classify(&self, program: &Program) -> Result<ClassificationResult, AnalysisError> {
        self.classify_with_cache(program, &mut SummaryCache::new())
    }

    /// Like [`Classifier::classify`], reusing summaries from earlier runs whose method
    /// bodies (and those of their callees) are unchanged.
    pub fn classify_with_cache(
        &self,
        program: &Program,
        cache: &mut SummaryCache,
    ) -> Result<ClassificationResult, AnalysisError> {
        info!(target: "pipeline", stage = "classify.start", methods = program.methods.len());
        let analysis = Analysis::prepare(program, &self.config, cache)?;
        let cx = analysis.context(&self.config);

        let analyze = |m: &Method| analyze_method(&cx, m);
        let per_method: Vec<MethodResult> = if self.config.parallel {
            program.methods.par_iter().map(analyze).collect()
        } else {
            program.methods.iter().map(analyze).collect()
        };

        let mut result = ClassificationResult {
            summaries: analysis.summaries.clone(),
            degradations: analysis.degradations.clone(),
            ..ClassificationResult::default()
        };
        for m in per_method {
            result.sites.extend(m.reports.into_iter().map(|r| (r.site.id, r)));
            result.degradations.extend(m.degradations);
        }
        for d in &result.degradations {
            debug!(degradation = %d, "precision degraded");
        }
        info!(
            target: "pipeline",
            stage = "classify.done",
            sites = result.sites.len(),
            degradations = result.degradations.len()
        );
        Ok(result)
    }
}

/// Classify with the default configuration.
pub fn classify(program: &Program) -> Result<ClassificationResult, AnalysisError> {
    Classifier::default().classify(program)
}

/// Whole-program facts shared by every per-method analysis.
pub(crate) struct Analysis<'p> {
    pub program: &'p Program,
    pub graph: CallGraph,
    pub effects: Effects,
    pub fields: FieldRanges,
    pub ordinals: BTreeMap<NodeRef, usize>,
    pub summaries: BTreeMap<MethodId, MethodSummary>,
    pub degradations: BTreeSet<Degradation>,
}

impl<'p> Analysis<'p> {
    pub(crate) fn prepare(
        program: &'p Program,
        config: &AnalysisConfig,
        cache: &mut SummaryCache,
    ) -> Result<Self, AnalysisError> {
        validate(program)?;
        let (graph, graph_degradations) = CallGraph::build(program);
        debug!(
            target: "pipeline",
            stage = "callgraph",
            units = graph.units.len(),
            layers = graph.layers.len()
        );
        let effects = Effects::compute(program, &graph);
        let fields = FieldRanges::compute(program);
        let mut analysis = Analysis {
            program,
            graph,
            effects,
            fields,
            ordinals: assert_ordinals(program),
            summaries: BTreeMap::new(),
            degradations: graph_degradations.into_iter().collect(),
        };
        analysis.summarize(config, cache);
        Ok(analysis)
    }

    pub(crate) fn context<'a>(&'a self, config: &'a AnalysisConfig) -> Context<'a> {
        Context {
            program: self.program,
            graph: &self.graph,
            effects: &self.effects,
            fields: &self.fields,
            summaries: &self.summaries,
            config,
            ordinals: &self.ordinals,
        }
    }

    /// Summaries of one layer only see summaries of earlier layers; a layer's results are
    /// published together once all of its units are done.
    fn summarize(&mut self, config: &AnalysisConfig, cache: &mut SummaryCache) {
        let hashes: BTreeMap<MethodId, String> = self
            .program
            .methods
            .iter()
            .map(|m| (m.id, structural_hash(self.program, m)))
            .collect();
        cache.reconcile(config, &hashes);

        for (depth, layer) in self.graph.layers.iter().enumerate() {
            let mut ready = Vec::new();
            let mut pending = Vec::new();
            for unit in layer {
                let Some(u) = self.graph.units.get(*unit) else {
                    continue;
                };
                let cached: Option<Vec<MethodSummary>> = u
                    .members
                    .iter()
                    .map(|m| cache.get(*m, hashes.get(m)?).cloned())
                    .collect();
                match cached {
                    Some(summaries) => ready.extend(summaries),
                    None => pending.push(u.members.clone()),
                }
            }

            let computed: Vec<(Vec<MethodSummary>, BTreeSet<Degradation>)> = {
                let cx = self.context(config);
                let run_unit = |members: &Vec<MethodId>| summarize_unit(&cx, members, &hashes);
                if config.parallel {
                    pending.par_iter().map(run_unit).collect()
                } else {
                    pending.iter().map(run_unit).collect()
                }
            };
            debug!(
                target: "pipeline",
                stage = "summaries.layer",
                layer = depth,
                cached = ready.len(),
                computed = pending.len()
            );

            for summary in ready {
                self.summaries.insert(summary.method, summary);
            }
            for (summaries, degradations) in computed {
                for summary in summaries {
                    for edge in self.graph.live_callees(summary.method) {
                        if let CallTarget::Method(callee) = edge.target {
                            cache.add_dependency(summary.method, callee);
                        }
                    }
                    cache.insert(summary.clone());
                    self.summaries.insert(summary.method, summary);
                }
                self.degradations.extend(degradations);
            }
        }
    }
}

fn summarize_unit(
    cx: &Context<'_>,
    members: &[MethodId],
    hashes: &BTreeMap<MethodId, String>,
) -> (Vec<MethodSummary>, BTreeSet<Degradation>) {
    let mut summaries = Vec::with_capacity(members.len());
    let mut degradations = BTreeSet::new();
    for id in members {
        let Some(method) = cx.program.method(*id) else {
            continue;
        };
        let run = Interp::new(cx, method, RunMode::summary()).run();
        degradations.extend(run.degradations);
        summaries.push(MethodSummary {
            method: *id,
            may_mutate_external_state: cx.effects.is_effectful(*id),
            return_range: run.return_range,
            may_fail: run.may_fail,
            structural_hash: hashes.get(id).cloned().unwrap_or_default(),
        });
    }
    (summaries, degradations)
}

struct MethodResult {
    reports: Vec<SiteReport>,
    degradations: BTreeSet<Degradation>,
}

fn analyze_method(cx: &Context<'_>, method: &Method) -> MethodResult {
    let sites = assert_sites(cx.program, method);
    if sites.is_empty() {
        return MethodResult {
            reports: Vec::new(),
            degradations: BTreeSet::new(),
        };
    }
    let baseline = Interp::new(cx, method, RunMode::baseline()).run();
    let mut degradations = baseline.degradations.clone();
    let reports = sites
        .into_iter()
        .map(|site| {
            let (report, removed) = classify_site(cx, method, site, &baseline);
            if let Some(run) = removed {
                degradations.extend(run.degradations);
            }
            report
        })
        .collect();
    MethodResult {
        reports,
        degradations,
    }
}

fn classify_site(
    cx: &Context<'_>,
    method: &Method,
    site: AssertSite,
    baseline: &RunOutcome,
) -> (SiteReport, Option<RunOutcome>) {
    let mut labels = BTreeSet::new();
    if cx
        .effects
        .condition_has_side_effect(cx.graph, method, &site.condition)
    {
        labels.insert(Label::SideEffect);
    }
    let verdict = baseline.sites.get(&site.id.ordinal);
    let reachable = verdict.is_some_and(|v| v.reachable > 0);

    match fold(&site.condition) {
        Some(ConstVal::Bool(true)) => {
            labels.insert(Label::Tautology);
        }
        Some(ConstVal::Bool(false)) if reachable => {
            labels.insert(Label::Contradiction);
        }
        _ => {
            if let Some(v) = verdict.filter(|v| v.reachable > 0) {
                if v.tautology == v.reachable {
                    labels.insert(Label::Tautology);
                } else if v.contradiction == v.reachable {
                    labels.insert(Label::Contradiction);
                }
            }
        }
    }

    let mut removed = None;
    let mut witness = None;
    if reachable {
        let run = Interp::new(cx, method, RunMode::without(site.id.ordinal)).run();
        let verdict = impact(baseline, &run);
        if verdict.useful {
            labels.insert(Label::Useful);
            witness = verdict.witness;
        } else if verdict.useless {
            labels.insert(Label::Useless);
        }
        removed = Some(run);
    }
    (
        SiteReport {
            site,
            labels,
            reachable,
            witness,
        },
        removed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assay_ir::build::*;
    use assay_ir::Param;

    #[test]
    fn test_label_names_round_trip() {
        for l in Label::ALL {
            assert_eq!(Label::parse(l.as_str()), Some(l));
        }
        assert_eq!(Label::parse("sideeffect"), Some(Label::SideEffect));
        assert_eq!(Label::parse("Maybe"), None);
    }

    #[test]
    fn test_sites_are_numbered_in_pre_order() {
        let mut pb = ProgramBuilder::new();
        let m = pb
            .method("T", "m")
            .param(Param::int("x"))
            .body(vec![
                assert_(gt(var("x"), int(0))),
                if_(
                    gt(var("x"), int(5)),
                    vec![assert_(gt(var("x"), int(4)))],
                ),
                assert_(boolean(true)),
            ])
            .build();
        let program = pb.finish();
        let method = program.method(m).expect("method");
        let sites = assert_sites(&program, method);
        let texts: Vec<&str> = sites.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, ["x > 0", "x > 4", "true"]);
        assert_eq!(sites[2].id.ordinal, 2);
    }

    #[test]
    fn test_result_serializes_sites_as_a_list() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "m").body(vec![assert_(boolean(true))]).build();
        let result = classify(&pb.finish()).expect("classify");
        let json = serde_json::to_value(&result).expect("json");
        assert_eq!(json["sites"][0]["site"]["method_name"], "T::m");
        assert_eq!(json["sites"][0]["labels"][0], "Useless");
    }
}
