#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::{
    Expr, ExprKind, FieldId, Method, Place, Program, Span, StmtKind, stmt_exprs, walk_expr,
    walk_stmts,
};

#[derive(Debug, Error, Diagnostic)]
#[error("malformed IR: {message}")]
#[diagnostic(code(assay::ir))]
pub struct MalformedIr {
    pub message: String,
    #[label]
    pub span: SourceSpan,
}

impl MalformedIr {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span: span.into(),
        }
    }
}

/// Structural checks a program must pass before it is analyzed.
pub fn validate(program: &Program) -> Result<(), MalformedIr> {
    for (i, f) in program.fields.iter().enumerate() {
        if f.id.0 as usize != i {
            return Err(MalformedIr::new(
                format!("field `{}.{}` has id {} at index {i}", f.owner, f.name, f.id.0),
                Span::default(),
            ));
        }
        if let Some(b) = f.domain.bound_expr() {
            check_field_bound(program, f.id, b)?;
        }
    }

    for (i, m) in program.methods.iter().enumerate() {
        if m.id.0 as usize != i {
            return Err(MalformedIr::new(
                format!("method `{}` has id {} at index {i}", m.qualified_name(), m.id.0),
                m.span,
            ));
        }
        validate_method(program, m)?;
    }
    Ok(())
}

fn check_field_bound(program: &Program, owner: FieldId, bound: &Expr) -> Result<(), MalformedIr> {
    let mut err = None;
    walk_expr(bound, &mut |e| {
        if err.is_some() {
            return;
        }
        match &e.kind {
            ExprKind::Var(name) | ExprKind::Bound(name) => {
                err = Some(MalformedIr::new(
                    format!(
                        "bound of field `{}` refers to local `{name}`",
                        program.field_name(owner)
                    ),
                    e.span,
                ));
            }
            ExprKind::Field(id) if program.field(*id).is_none() => {
                err = Some(MalformedIr::new(format!("unknown field id {}", id.0), e.span));
            }
            _ => {}
        }
    });
    err.map_or(Ok(()), Err)
}

fn validate_method(program: &Program, method: &Method) -> Result<(), MalformedIr> {
    let mut params = BTreeSet::new();
    for p in &method.params {
        if !params.insert(p.name.as_str()) {
            return Err(MalformedIr::new(
                format!(
                    "duplicate parameter `{}` in `{}`",
                    p.name,
                    method.qualified_name()
                ),
                method.span,
            ));
        }
    }

    // Locals are scoped to the whole method; the front end has already resolved shadowing.
    let mut declared: BTreeSet<&str> = params.clone();
    walk_stmts(&method.body, &mut |s| {
        if let StmtKind::Let { name, .. } = &s.kind {
            declared.insert(name.as_str());
        }
    });

    for p in &method.params {
        if let Some(b) = p.domain.bound_expr() {
            check_domain_bound(program, method, &p.name, b, &params)?;
        }
    }

    let mut err: Option<MalformedIr> = None;
    walk_stmts(&method.body, &mut |s| {
        if err.is_some() {
            return;
        }
        if let StmtKind::Let { name, domain, .. } = &s.kind {
            if let Some(b) = domain.bound_expr() {
                if let Err(e) = check_domain_bound(program, method, name, b, &declared) {
                    err = Some(e);
                    return;
                }
            }
        }
        if let StmtKind::Assign { target, .. } = &s.kind {
            if let Err(e) = check_place(program, method, target, &declared, s.span) {
                err = Some(e);
                return;
            }
        }
        for root in stmt_exprs(s) {
            if let Err(e) = check_expr(program, method, root, &declared) {
                err = Some(e);
                return;
            }
        }
    });
    err.map_or(Ok(()), Err)
}

fn check_domain_bound(
    program: &Program,
    method: &Method,
    owner: &str,
    bound: &Expr,
    allowed: &BTreeSet<&str>,
) -> Result<(), MalformedIr> {
    let mut err = None;
    walk_expr(bound, &mut |e| {
        if err.is_some() {
            return;
        }
        match &e.kind {
            ExprKind::Var(name) if !allowed.contains(name.as_str()) => {
                err = Some(MalformedIr::new(
                    format!(
                        "bound of `{owner}` in `{}` refers to `{name}`, which is not a parameter",
                        method.qualified_name()
                    ),
                    e.span,
                ));
            }
            ExprKind::Bound(name) if name != owner && !allowed.contains(name.as_str()) => {
                err = Some(MalformedIr::new(
                    format!("bound of `{owner}` refers to the bound of unknown `{name}`"),
                    e.span,
                ));
            }
            ExprKind::Field(id) if program.field(*id).is_none() => {
                err = Some(MalformedIr::new(format!("unknown field id {}", id.0), e.span));
            }
            _ => {}
        }
    });
    err.map_or(Ok(()), Err)
}

fn check_place(
    program: &Program,
    method: &Method,
    place: &Place,
    declared: &BTreeSet<&str>,
    span: Span,
) -> Result<(), MalformedIr> {
    match place {
        Place::Local(name) if !declared.contains(name.as_str()) => Err(MalformedIr::new(
            format!(
                "assignment to undeclared `{name}` in `{}`",
                method.qualified_name()
            ),
            span,
        )),
        Place::Field(id) if program.field(*id).is_none() => {
            Err(MalformedIr::new(format!("unknown field id {}", id.0), span))
        }
        _ => Ok(()),
    }
}

fn check_expr(
    program: &Program,
    method: &Method,
    root: &Expr,
    declared: &BTreeSet<&str>,
) -> Result<(), MalformedIr> {
    let mut err = None;
    walk_expr(root, &mut |e| {
        if err.is_some() {
            return;
        }
        let res = match &e.kind {
            ExprKind::Var(name) | ExprKind::Bound(name) if !declared.contains(name.as_str()) => {
                Err(MalformedIr::new(
                    format!(
                        "use of undeclared `{name}` in `{}`",
                        method.qualified_name()
                    ),
                    e.span,
                ))
            }
            ExprKind::Field(id) if program.field(*id).is_none() => {
                Err(MalformedIr::new(format!("unknown field id {}", id.0), e.span))
            }
            ExprKind::Update { target, .. } | ExprKind::Assign { target, .. } => {
                check_place(program, method, target, declared, e.span)
            }
            _ => Ok(()),
        };
        if let Err(e) = res {
            err = Some(e);
        }
    });
    err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::*;
    use crate::{MethodId, Param, ValueType};

    #[test]
    fn test_accepts_well_formed_program() {
        let mut pb = ProgramBuilder::new();
        let i = pb.static_field("T", "i", 0);
        pb.method("T", "m")
            .param(Param::int("x"))
            .param(Param::capped("c", bound("c")))
            .body(vec![
                let_local("y", ValueType::Int, add(var("x"), field(i))),
                assert_(le(var("c"), bound("c"))),
                set(local("y"), int(3)),
            ])
            .build();
        assert!(validate(&pb.finish()).is_ok());
    }

    #[test]
    fn test_rejects_undeclared_variable() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "m").body(vec![assert_(gt(var("ghost"), int(0)))]).build();
        let err = validate(&pb.finish()).unwrap_err();
        assert!(err.message.contains("ghost"), "{}", err.message);
    }

    #[test]
    fn test_rejects_duplicate_params() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "m")
            .param(Param::int("x"))
            .param(Param::int("x"))
            .build();
        let err = validate(&pb.finish()).unwrap_err();
        assert!(err.message.contains("duplicate parameter"));
    }

    #[test]
    fn test_rejects_dangling_field() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "m")
            .body(vec![expr_stmt(post_inc(field_place(FieldId(4))))])
            .build();
        let err = validate(&pb.finish()).unwrap_err();
        assert!(err.message.contains("unknown field id 4"));
    }

    #[test]
    fn test_rejects_bound_over_non_parameter() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "m")
            .param(Param::capped("c", var("limit")))
            .build();
        let err = validate(&pb.finish()).unwrap_err();
        assert!(err.message.contains("not a parameter"));
    }

    #[test]
    fn test_rejects_misnumbered_method() {
        let mut pb = ProgramBuilder::new();
        pb.method("T", "m").build();
        let mut program = pb.finish();
        program.methods[0].id = MethodId(7);
        assert!(validate(&program).is_err());
    }
}
