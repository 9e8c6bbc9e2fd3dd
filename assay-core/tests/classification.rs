use std::collections::BTreeSet;

use assay_core::{AnalysisConfig, Classifier, Degradation, Label, SiteId, classify};
use assay_ir::build::*;
use assay_ir::{Domain, Expr, Param, Program, ValueType};
use miette::Diagnostic;

fn labels(ls: &[Label]) -> BTreeSet<Label> {
    ls.iter().copied().collect()
}

#[test]
fn assert_true_is_tautology_and_useless() {
    let mut pb = ProgramBuilder::new();
    pb.method("Simple", "trivial").body(vec![assert_(boolean(true))]).build();
    pb.method("Simple", "arith")
        .body(vec![assert_(eq(add(int(1), int(1)), int(2)))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(
        result.labels("Simple::trivial", 0),
        labels(&[Label::Tautology, Label::Useless])
    );
    assert_eq!(
        result.labels("Simple::arith", 0),
        labels(&[Label::Tautology, Label::Useless])
    );
}

#[test]
fn positive_integer_lower_bound_is_tautology() {
    let mut pb = ProgramBuilder::new();
    pb.method("Wrappers", "positive")
        .param(Param::non_negative("n"))
        .body(vec![assert_(ge(var("n"), int(0)))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(
        result.labels("Wrappers::positive", 0),
        labels(&[Label::Tautology, Label::Useless])
    );
}

#[test]
fn guard_before_division_is_useful() {
    let mut pb = ProgramBuilder::new();
    let id = pb
        .method("Bench", "complexMath")
        .param(Param::non_negative("a"))
        .param(Param::non_negative("b"))
        .body(vec![
            assert_(ne(add(var("a"), var("b")), int(0))),
            let_local("x", ValueType::Int, div(int(100), add(var("a"), var("b")))),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(result.labels("Bench::complexMath", 0), labels(&[Label::Useful]));

    let report = result.site(SiteId { method: id, ordinal: 0 }).expect("site");
    let witness = report.witness.as_ref().expect("witness");
    assert_eq!(witness.get("a"), Some(&0));
    assert_eq!(witness.get("b"), Some(&0));
}

#[test]
fn unrelated_guard_before_division_is_useless() {
    let mut pb = ProgramBuilder::new();
    pb.method("Bench", "divideByN")
        .param(Param::int("x"))
        .param(Param::int("n"))
        .body(vec![
            assert_(ne(var("n"), int(10))),
            let_local("result", ValueType::Int, div(var("x"), var("n"))),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(result.labels("Bench::divideByN", 0), labels(&[Label::Useless]));
    assert!(result.sites.values().all(|r| r.witness.is_none()));
}

#[test]
fn edge_weight_relations() {
    let (w, lo, hi) = (|| var("weight"), || var("lower"), || var("higher"));
    let mut pb = ProgramBuilder::new();
    pb.method("Bench", "normalizeEdgeWeight")
        .param(Param::non_negative("weight"))
        .param(Param::int("lower"))
        .param(Param::int("higher"))
        .body(vec![
            assert_(and(and(ge(w(), lo()), le(w(), hi())), lt(lo(), hi()))),
            assert_(or(lt(lo(), hi()), le(hi(), lo()))),
            assert_(and(lt(lo(), hi()), le(hi(), lo()))),
            let_local(
                "normalized",
                ValueType::Int,
                div(mul(sub(w(), lo()), int(100)), sub(hi(), lo())),
            ),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    let first = result.labels("Bench::normalizeEdgeWeight", 0);
    assert!(!first.contains(&Label::Tautology) && !first.contains(&Label::Contradiction));
    assert!(result.labels("Bench::normalizeEdgeWeight", 1).contains(&Label::Tautology));
    assert!(result.labels("Bench::normalizeEdgeWeight", 2).contains(&Label::Contradiction));
}

#[test]
fn withdraw_mixes_every_label() {
    let (b, a) = (|| var("balance"), || var("amount"));
    let mut pb = ProgramBuilder::new();
    pb.method("Bench", "withdraw")
        .param(Param::non_negative("balance"))
        .param(Param::non_negative("amount"))
        .param(Param::int("percentage"))
        .body(vec![
            assert_(ge(sub(b(), a()), int(0))),
            assert_(gt(b(), add(int(10), a()))),
            assert_(gt(add(a(), int(10)), a())),
            assert_(gt(mul(int(2), b()), add(add(int(10), b()), b()))),
            assert_(ge(post_inc(local("percentage")), int(0))),
            let_local(
                "withdrawn",
                ValueType::Int,
                div(mul(a(), var("percentage")), b()),
            ),
            set(local("balance"), sub(b(), a())),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    let site = |i| result.labels("Bench::withdraw", i);
    assert!(site(2).contains(&Label::Tautology));
    assert!(site(3).contains(&Label::Contradiction));
    assert!(site(4).contains(&Label::SideEffect));
    // Nothing after the contradiction is reachable.
    let report = result
        .sites
        .values()
        .find(|r| r.site.method_name == "Bench::withdraw" && r.site.id.ordinal == 4)
        .expect("site");
    assert!(!report.reachable);
}

#[test]
fn guard_of_explicit_throw_is_useful() {
    let mut pb = ProgramBuilder::new();
    pb.method("Bench", "redundantChecks")
        .param(Param::non_negative("p"))
        .body(vec![
            assert_(ge(var("p"), int(0))),
            assert_(ne(var("p"), int(1000))),
            if_(eq(var("p"), int(1000)), vec![throw("RuntimeException")]),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(
        result.labels("Bench::redundantChecks", 0),
        labels(&[Label::Tautology, Label::Useless])
    );
    assert_eq!(result.labels("Bench::redundantChecks", 1), labels(&[Label::Useful]));
}

#[test]
fn value_above_its_cap_is_contradiction() {
    let mut pb = ProgramBuilder::new();
    pb.method("Bench", "impossibleRange")
        .param(Param::capped("c", bound("c")))
        .body(vec![assert_(gt(var("c"), add(bound("c"), int(1))))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(
        result.labels("Bench::impossibleRange", 0),
        labels(&[Label::Contradiction, Label::Useless])
    );
}

#[test]
fn step_values_and_division() {
    let mut pb = ProgramBuilder::new();
    pb.method("Bench", "moduloCheck")
        .param(Param::step("s", int(5)))
        .body(vec![
            assert_(ne(var("s"), int(0))),
            let_local("x", ValueType::Int, div(int(100), var("s"))),
        ])
        .build();
    pb.method("Bench", "stepRemainder")
        .param(Param::step("s", int(6)))
        .body(vec![assert_(eq(rem(var("s"), int(3)), int(0)))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(result.labels("Bench::moduloCheck", 0), labels(&[Label::Useful]));
    assert!(result.labels("Bench::stepRemainder", 0).contains(&Label::Tautology));
}

#[test]
fn squares_are_non_negative() {
    let mut pb = ProgramBuilder::new();
    pb.method("Math", "square")
        .param(Param::int("a"))
        .body(vec![assert_(ge(mul(var("a"), var("a")), int(0)))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert!(result.labels("Math::square", 0).contains(&Label::Tautology));
}

#[test]
fn loop_bound_guards_array_writes() {
    let mut pb = ProgramBuilder::new();
    pb.method("Bench", "loopBound")
        .param(Param::non_negative("limit"))
        .body(vec![
            assert_(lt(var("limit"), int(100))),
            let_local("arr", ValueType::IntArray, new_array(int(100))),
            let_local("i", ValueType::Int, int(0)),
            while_(
                le(var("i"), var("limit")),
                vec![
                    store(var("arr"), var("i"), var("i")),
                    expr_stmt(post_inc(local("i"))),
                ],
            ),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(result.labels("Bench::loopBound", 0), labels(&[Label::Useful]));
}

#[test]
fn bounds_check_before_array_read_is_useful() {
    let mut pb = ProgramBuilder::new();
    pb.method("Arrays", "at")
        .param(Param::int_array("xs"))
        .param(Param::int("i"))
        .returns(ValueType::Int)
        .body(vec![
            assert_(and(le(int(0), var("i")), lt(var("i"), len(var("xs"))))),
            ret(load(var("xs"), var("i"))),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(result.labels("Arrays::at", 0), labels(&[Label::Useful]));
}

#[test]
fn guard_protects_division_inside_callee() {
    let mut pb = ProgramBuilder::new();
    pb.method("Calls", "scale")
        .param(Param::int("d"))
        .returns(ValueType::Int)
        .body(vec![ret(div(int(10), var("d")))])
        .build();
    pb.method("Calls", "caller")
        .param(Param::int("a"))
        .returns(ValueType::Int)
        .body(vec![
            assert_(ne(var("a"), int(0))),
            ret(call("scale", vec![var("a")])),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(result.labels("Calls::caller", 0), labels(&[Label::Useful]));
}

#[test]
fn guard_before_wrapper_set_is_useful() {
    let mut pb = ProgramBuilder::new();
    pb.method("Bank", "debit")
        .param(Param::non_negative("balance"))
        .param(Param::non_negative("amount"))
        .body(vec![
            assert_(ge(sub(var("balance"), var("amount")), int(0))),
            set(local("balance"), sub(var("balance"), var("amount"))),
        ])
        .build();
    pb.method("Bank", "cap")
        .param(Param::int("x"))
        .body(vec![
            assert_(le(var("x"), int(10))),
            let_wrapped("c", Domain::Capped(Box::new(int(10))), var("x")),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert_eq!(result.labels("Bank::debit", 0), labels(&[Label::Useful]));
    assert_eq!(result.labels("Bank::cap", 0), labels(&[Label::Useful]));
}

#[test]
fn state_changes_inside_conditions_are_side_effects() {
    let mut pb = ProgramBuilder::new();
    let counter = pb.static_field("Assertions", "i", 0);
    pb.method("Assertions", "increment")
        .body(vec![assert_(eq(post_inc(field_place(counter)), int(7)))])
        .build();
    pb.method("Assertions", "store")
        .param(Param::int_array("arr"))
        .body(vec![assert_(eq(
            assign(element(var("arr"), int(0)), int(9)),
            int(9),
        ))])
        .build();
    pb.method("Assertions", "local")
        .param(Param::int("x"))
        .body(vec![assert_(gt(assign(local("x"), int(3)), int(0)))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert!(result.labels("Assertions::increment", 0).contains(&Label::SideEffect));
    assert!(result.labels("Assertions::store", 0).contains(&Label::SideEffect));
    let local = result.labels("Assertions::local", 0);
    assert!(local.contains(&Label::SideEffect) && local.contains(&Label::Tautology));
}

#[test]
fn side_effects_propagate_through_call_chains() {
    let mut pb = ProgramBuilder::new();
    let count = pb.static_field("Chain", "count", 0);
    pb.method("Chain", "deep")
        .body(vec![expr_stmt(post_inc(field_place(count)))])
        .build();
    pb.method("Chain", "mid")
        .returns(ValueType::Bool)
        .body(vec![expr_stmt(call("deep", vec![])), ret(boolean(true))])
        .build();
    pb.method("Chain", "top")
        .returns(ValueType::Bool)
        .body(vec![ret(call("mid", vec![]))])
        .build();
    pb.method("Chain", "pure")
        .param(Param::int("x"))
        .returns(ValueType::Bool)
        .body(vec![ret(gt(var("x"), int(0)))])
        .build();
    pb.method("Chain", "check")
        .param(Param::int("x"))
        .body(vec![
            assert_(call("top", vec![])),
            assert_(call("pure", vec![var("x")])),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert!(result.labels("Chain::check", 0).contains(&Label::SideEffect));
    assert!(!result.labels("Chain::check", 1).contains(&Label::SideEffect));
}

#[test]
fn short_circuit_skipping_is_constant_folded() {
    let mut pb = ProgramBuilder::new();
    let n = pb.static_field("Short", "n", 0);
    pb.method("Short", "bump")
        .returns(ValueType::Bool)
        .body(vec![expr_stmt(post_inc(field_place(n))), ret(boolean(true))])
        .build();
    pb.method("Short", "forced")
        .body(vec![assert_(or(boolean(false), call("bump", vec![])))])
        .build();
    pb.method("Short", "skipped")
        .body(vec![assert_(and(boolean(false), call("bump", vec![])))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    let forced = result.labels("Short::forced", 0);
    assert!(forced.contains(&Label::SideEffect));
    assert!(forced.contains(&Label::Tautology));
    let skipped = result.labels("Short::skipped", 0);
    assert!(!skipped.contains(&Label::SideEffect));
    assert!(skipped.contains(&Label::Contradiction));
}

#[test]
fn recursion_terminates_and_degrades() {
    let mut pb = ProgramBuilder::new();
    pb.method("Rec", "fact")
        .param(Param::int("n"))
        .returns(ValueType::Int)
        .body(vec![
            if_(le(var("n"), int(1)), vec![ret(int(1))]),
            ret(mul(var("n"), call("fact", vec![sub(var("n"), int(1))]))),
        ])
        .build();
    pb.method("Rec", "even")
        .param(Param::int("n"))
        .returns(ValueType::Bool)
        .body(vec![
            if_(eq(var("n"), int(0)), vec![ret(boolean(true))]),
            ret(call("odd", vec![sub(var("n"), int(1))])),
        ])
        .build();
    pb.method("Rec", "odd")
        .param(Param::int("n"))
        .returns(ValueType::Bool)
        .body(vec![
            if_(eq(var("n"), int(0)), vec![ret(boolean(false))]),
            ret(call("even", vec![sub(var("n"), int(1))])),
        ])
        .build();
    pb.method("Rec", "use")
        .param(Param::non_negative("n"))
        .body(vec![
            assert_(ge(call("fact", vec![var("n")]), int(1))),
            assert_(call("even", vec![var("n")])),
        ])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    assert!(
        result
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::RecursionDepthExceeded { .. }))
    );
    for i in 0..2 {
        let l = result.labels("Rec::use", i);
        assert!(!l.contains(&Label::Contradiction), "{l:?}");
    }
}

#[test]
fn opaque_calls_are_side_effects_and_degrade() {
    let mut pb = ProgramBuilder::new();
    pb.method("Lib", "user")
        .body(vec![assert_(call_static("External", "check", vec![]))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    let l = result.labels("Lib::user", 0);
    assert!(l.contains(&Label::SideEffect));
    assert!(!l.contains(&Label::Tautology) && !l.contains(&Label::Contradiction));
    assert!(
        result
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::UnresolvedCallTarget { .. }))
    );
}

#[test]
fn unreachable_asserts_get_no_semantic_labels() {
    let mut pb = ProgramBuilder::new();
    pb.method("Dead", "m")
        .param(Param::int("x"))
        .body(vec![if_(
            gt(var("x"), int(0)),
            vec![if_(lt(var("x"), int(0)), vec![assert_(eq(var("x"), int(5)))])],
        )])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    let report = result.sites.values().next().expect("one site");
    assert!(!report.reachable);
    assert!(report.labels.is_empty());
}

#[test]
fn malformed_programs_are_rejected() {
    let mut pb = ProgramBuilder::new();
    pb.method("Bad", "m")
        .body(vec![assert_(gt(var("missing"), int(0)))])
        .build();
    let err = classify(&pb.finish()).expect_err("undeclared variable");
    let code = err.code().map(|c| c.to_string());
    assert_eq!(code.as_deref(), Some("assay::ir"));
}

#[test]
fn sequential_and_parallel_runs_agree() {
    let mut pb = ProgramBuilder::new();
    for i in 0..6 {
        pb.method("Many", &format!("m{i}"))
            .param(Param::non_negative("n"))
            .body(vec![
                assert_(gt(var("n"), int(i))),
                let_local("q", ValueType::Int, div(int(100), var("n"))),
            ])
            .build();
    }
    let program = pb.finish();
    let parallel = classify(&program).expect("classify");
    let sequential = Classifier::new(AnalysisConfig {
        parallel: false,
        ..AnalysisConfig::default()
    })
    .classify(&program)
    .expect("classify");
    assert_eq!(parallel, sequential);
    assert_eq!(parallel, classify(&program).expect("classify"));
    assert_eq!(parallel.count(Label::Useful), 6);
}

#[test]
fn cached_summaries_are_reused_until_a_body_changes() {
    let build = |limit: i64| {
        let mut pb = ProgramBuilder::new();
        pb.method("Cache", "scale")
            .param(Param::int("d"))
            .returns(ValueType::Int)
            .body(vec![ret(div(int(limit), var("d")))])
            .build();
        pb.method("Cache", "caller")
            .param(Param::int("a"))
            .returns(ValueType::Int)
            .body(vec![
                assert_(ne(var("a"), int(0))),
                ret(call("scale", vec![var("a")])),
            ])
            .build();
        pb.finish()
    };
    let classifier = Classifier::default();
    let mut cache = assay_core::SummaryCache::new();

    let first = classifier.classify_with_cache(&build(10), &mut cache).expect("classify");
    assert_eq!(cache.hits(), 0);
    let again = classifier.classify_with_cache(&build(10), &mut cache).expect("classify");
    assert_eq!(cache.hits(), 2);
    assert_eq!(first, again);

    let changed = classifier.classify_with_cache(&build(20), &mut cache).expect("classify");
    assert_eq!(cache.hits(), 2);
    assert_eq!(changed.labels("Cache::caller", 0), labels(&[Label::Useful]));
}

fn divide_chain(tail: Expr) -> Program {
    let mut pb = ProgramBuilder::new();
    pb.method("Chain", "c")
        .param(Param::int("d"))
        .returns(ValueType::Int)
        .body(vec![ret(tail)])
        .build();
    pb.method("Chain", "b")
        .param(Param::int("d"))
        .returns(ValueType::Int)
        .body(vec![ret(call("c", vec![var("d")]))])
        .build();
    pb.method("Chain", "a")
        .param(Param::int("d"))
        .returns(ValueType::Int)
        .body(vec![ret(call("b", vec![var("d")]))])
        .build();
    pb.method("Chain", "m")
        .param(Param::int("x"))
        .body(vec![
            assert_(ne(var("x"), int(0))),
            expr_stmt(call("a", vec![var("x")])),
        ])
        .build();
    pb.finish()
}

#[test]
fn failures_beyond_the_inline_depth_are_not_ignored() {
    let program = divide_chain(div(int(100), var("d")));
    let result = classify(&program).expect("classify");
    let l = result.labels("Chain::m", 0);
    assert!(!l.contains(&Label::Useless), "{l:?}");
    assert!(!l.contains(&Label::Useful), "{l:?}");
    assert!(result.summaries.values().filter(|s| s.may_fail).count() >= 3);

    let deeper = Classifier::new(AnalysisConfig {
        inline_depth: 3,
        ..AnalysisConfig::default()
    })
    .classify(&program)
    .expect("classify");
    assert_eq!(deeper.labels("Chain::m", 0), labels(&[Label::Useful]));

    let safe = classify(&divide_chain(add(var("d"), int(1)))).expect("classify");
    assert_eq!(safe.labels("Chain::m", 0), labels(&[Label::Useless]));
    assert!(safe.summaries.values().all(|s| !s.may_fail));
}

#[test]
fn repeated_getter_calls_see_field_writes() {
    let mut pb = ProgramBuilder::new();
    let c = pb.static_field("Getter", "c", 0);
    pb.method("Getter", "get")
        .returns(ValueType::Int)
        .body(vec![ret(field(c))])
        .build();
    pb.method("Getter", "b")
        .returns(ValueType::Int)
        .body(vec![
            let_local("x", ValueType::Int, call("get", vec![])),
            expr_stmt(post_inc(field_place(c))),
            ret(sub(var("x"), call("get", vec![]))),
        ])
        .build();
    pb.method("Getter", "a")
        .returns(ValueType::Int)
        .body(vec![ret(call("b", vec![]))])
        .build();
    pb.method("Getter", "m")
        .body(vec![assert_(eq(call("a", vec![]), int(0)))])
        .build();
    pb.method("Getter", "twice")
        .returns(ValueType::Int)
        .body(vec![ret(sub(call("get", vec![]), call("get", vec![])))])
        .build();
    pb.method("Getter", "outer")
        .returns(ValueType::Int)
        .body(vec![ret(call("twice", vec![]))])
        .build();
    pb.method("Getter", "n")
        .body(vec![assert_(eq(call("outer", vec![]), int(0)))])
        .build();
    let result = classify(&pb.finish()).expect("classify");
    let l = result.labels("Getter::m", 0);
    assert!(!l.contains(&Label::Tautology), "{l:?}");
    assert!(!l.contains(&Label::Contradiction), "{l:?}");
    assert!(l.contains(&Label::SideEffect), "{l:?}");
    assert!(result.labels("Getter::n", 0).contains(&Label::Tautology));
}
