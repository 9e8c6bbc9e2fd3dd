#![forbid(unsafe_code)]

use std::fmt::{self, Write as _};

use crate::{
    Domain, Expr, ExprKind, LogicalOp, Method, Place, Program, Stmt, StmtKind, UnaryOp, UpdateOp,
    ValueType,
};

/// Java-like rendering of an expression, used by reports and guard suggestions.
pub fn format_expr(program: &Program, expr: &Expr) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_expr(&mut out, program, expr);
    out
}

pub fn format_place(program: &Program, place: &Place) -> String {
    let mut out = String::new();
    let _ = write_place(&mut out, program, place);
    out
}

/// Canonical text of a method's signature and body, without source positions.
pub fn format_method(program: &Program, method: &Method) -> String {
    let mut out = String::new();
    let _ = write!(out, "{} {}::{}(", type_name(&method.ret), method.owner, method.name);
    for (i, p) in method.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} {}", type_name(&p.ty), p.name);
        let _ = write_domain(&mut out, program, &p.domain);
    }
    out.push_str(") {\n");
    for stmt in &method.body {
        let _ = write_stmt(&mut out, program, stmt, 1);
    }
    out.push_str("}\n");
    out
}

fn type_name(ty: &ValueType) -> String {
    match ty {
        ValueType::Int => "int".to_string(),
        ValueType::Bool => "boolean".to_string(),
        ValueType::IntArray => "int[]".to_string(),
        ValueType::Void => "void".to_string(),
        ValueType::Object(name) => name.clone(),
        ValueType::Opaque => "?".to_string(),
    }
}

fn write_domain(out: &mut String, program: &Program, domain: &Domain) -> fmt::Result {
    match domain {
        Domain::Unbounded => Ok(()),
        Domain::NonNegative => out.write_str(" /* >= 0 */"),
        Domain::Capped(b) => {
            out.write_str(" /* <= ")?;
            write_expr(out, program, b)?;
            out.write_str(" */")
        }
        Domain::Step(b) => {
            out.write_str(" /* % ")?;
            write_expr(out, program, b)?;
            out.write_str(" == 0 */")
        }
    }
}

fn write_stmt(out: &mut String, program: &Program, stmt: &Stmt, depth: usize) -> fmt::Result {
    let pad = "    ".repeat(depth);
    out.write_str(&pad)?;
    match &stmt.kind {
        StmtKind::Let {
            name,
            ty,
            domain,
            init,
        } => {
            write!(out, "{} {}", type_name(ty), name)?;
            write_domain(out, program, domain)?;
            if let Some(init) = init {
                out.write_str(" = ")?;
                write_expr(out, program, init)?;
            }
            out.write_str(";\n")
        }
        StmtKind::Assign { target, value } => {
            write_place(out, program, target)?;
            out.write_str(" = ")?;
            write_expr(out, program, value)?;
            out.write_str(";\n")
        }
        StmtKind::ArrayStore {
            array,
            index,
            value,
        } => {
            write_expr(out, program, array)?;
            out.write_char('[')?;
            write_expr(out, program, index)?;
            out.write_str("] = ")?;
            write_expr(out, program, value)?;
            out.write_str(";\n")
        }
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            out.write_str("if (")?;
            write_expr(out, program, cond)?;
            out.write_str(") {\n")?;
            for s in then_body {
                write_stmt(out, program, s, depth + 1)?;
            }
            if else_body.is_empty() {
                writeln!(out, "{pad}}}")
            } else {
                writeln!(out, "{pad}}} else {{")?;
                for s in else_body {
                    write_stmt(out, program, s, depth + 1)?;
                }
                writeln!(out, "{pad}}}")
            }
        }
        StmtKind::While { cond, body } => {
            out.write_str("while (")?;
            write_expr(out, program, cond)?;
            out.write_str(") {\n")?;
            for s in body {
                write_stmt(out, program, s, depth + 1)?;
            }
            writeln!(out, "{pad}}}")
        }
        StmtKind::Assert { cond } => {
            out.write_str("assert ")?;
            write_expr(out, program, cond)?;
            out.write_str(";\n")
        }
        StmtKind::Return { value } => match value {
            Some(v) => {
                out.write_str("return ")?;
                write_expr(out, program, v)?;
                out.write_str(";\n")
            }
            None => out.write_str("return;\n"),
        },
        StmtKind::Expr(e) => {
            write_expr(out, program, e)?;
            out.write_str(";\n")
        }
        StmtKind::Throw { exception } => writeln!(out, "throw new {exception}();"),
    }
}

fn write_place(out: &mut String, program: &Program, place: &Place) -> fmt::Result {
    match place {
        Place::Local(name) => out.write_str(name),
        Place::Field(id) => out.write_str(&program.field_name(*id)),
        Place::Element { array, index } => {
            write_expr(out, program, array)?;
            out.write_char('[')?;
            write_expr(out, program, index)?;
            out.write_char(']')
        }
    }
}

fn write_operand(out: &mut String, program: &Program, expr: &Expr) -> fmt::Result {
    let compound = matches!(
        expr.kind,
        ExprKind::Binary { .. } | ExprKind::Logical { .. } | ExprKind::Assign { .. }
    );
    if compound {
        out.write_char('(')?;
        write_expr(out, program, expr)?;
        out.write_char(')')
    } else {
        write_expr(out, program, expr)
    }
}

fn write_expr(out: &mut String, program: &Program, expr: &Expr) -> fmt::Result {
    match &expr.kind {
        ExprKind::Int(v) => write!(out, "{v}"),
        ExprKind::Bool(b) => write!(out, "{b}"),
        ExprKind::Var(name) => out.write_str(name),
        ExprKind::Field(id) => out.write_str(&program.field_name(*id)),
        ExprKind::ArrayLoad { array, index } => {
            write_operand(out, program, array)?;
            out.write_char('[')?;
            write_expr(out, program, index)?;
            out.write_char(']')
        }
        ExprKind::ArrayLen(array) => {
            write_operand(out, program, array)?;
            out.write_str(".length")
        }
        ExprKind::NewArray { len } => {
            out.write_str("new int[")?;
            write_expr(out, program, len)?;
            out.write_char(']')
        }
        ExprKind::ArrayLit(items) => {
            out.write_char('{')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                write_expr(out, program, item)?;
            }
            out.write_char('}')
        }
        ExprKind::Unary { op, operand } => {
            out.write_char(match op {
                UnaryOp::Neg => '-',
                UnaryOp::Not => '!',
            })?;
            write_operand(out, program, operand)
        }
        ExprKind::Update { op, target } => match op {
            UpdateOp::PreInc => {
                out.write_str("++")?;
                write_place(out, program, target)
            }
            UpdateOp::PreDec => {
                out.write_str("--")?;
                write_place(out, program, target)
            }
            UpdateOp::PostInc => {
                write_place(out, program, target)?;
                out.write_str("++")
            }
            UpdateOp::PostDec => {
                write_place(out, program, target)?;
                out.write_str("--")
            }
        },
        ExprKind::Binary { op, lhs, rhs } => {
            write_operand(out, program, lhs)?;
            write!(out, " {} ", op.symbol())?;
            write_operand(out, program, rhs)
        }
        ExprKind::Logical { op, lhs, rhs } => {
            write_operand(out, program, lhs)?;
            out.write_str(match op {
                LogicalOp::And => " && ",
                LogicalOp::Or => " || ",
            })?;
            write_operand(out, program, rhs)
        }
        ExprKind::Call {
            callee,
            receiver,
            args,
        } => {
            if let Some(r) = receiver {
                write_operand(out, program, r)?;
                out.write_char('.')?;
            } else if let Some(owner) = &callee.owner {
                write!(out, "{owner}.")?;
            }
            out.write_str(&callee.name)?;
            out.write_char('(')?;
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                write_expr(out, program, a)?;
            }
            out.write_char(')')
        }
        ExprKind::Assign { target, value } => {
            write_place(out, program, target)?;
            out.write_str(" = ")?;
            write_expr(out, program, value)
        }
        ExprKind::Bound(name) => write!(out, "{name}.bound()"),
        ExprKind::Opaque(text) => write!(out, "<{text}>"),
    }
}
