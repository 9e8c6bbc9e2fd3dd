#![forbid(unsafe_code)]

//! Small constructors for assembling programs by hand.
//!
//! Front ends normally produce a [`Program`] directly (or its JSON form); these helpers
//! exist for tests, fixtures and embedding. Statements built without a span receive a
//! synthetic line number when their method is finished, so assert sites stay distinct.

use crate::{
    BinOp, Callee, Domain, Expr, ExprKind, FieldDecl, FieldId, LogicalOp, Method, MethodId, Param,
    Place, Program, Span, Stmt, StmtKind, UnaryOp, UpdateOp, ValueType,
};

fn e(kind: ExprKind) -> Expr {
    Expr::new(Span::default(), kind)
}

fn s(kind: StmtKind) -> Stmt {
    Stmt::new(Span::default(), kind)
}

pub fn int(v: i64) -> Expr {
    e(ExprKind::Int(v))
}

pub fn boolean(b: bool) -> Expr {
    e(ExprKind::Bool(b))
}

pub fn var(name: &str) -> Expr {
    e(ExprKind::Var(name.to_string()))
}

pub fn field(id: FieldId) -> Expr {
    e(ExprKind::Field(id))
}

/// `w.getCap()` / the step of `w`.
pub fn bound(name: &str) -> Expr {
    e(ExprKind::Bound(name.to_string()))
}

pub fn opaque(text: &str) -> Expr {
    e(ExprKind::Opaque(text.to_string()))
}

pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    e(ExprKind::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn add(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Add, lhs, rhs)
}

pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Sub, lhs, rhs)
}

pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Mul, lhs, rhs)
}

pub fn div(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Div, lhs, rhs)
}

pub fn rem(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Rem, lhs, rhs)
}

pub fn eq(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Eq, lhs, rhs)
}

pub fn ne(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Ne, lhs, rhs)
}

pub fn lt(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Lt, lhs, rhs)
}

pub fn le(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Le, lhs, rhs)
}

pub fn gt(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Gt, lhs, rhs)
}

pub fn ge(lhs: Expr, rhs: Expr) -> Expr {
    bin(BinOp::Ge, lhs, rhs)
}

pub fn and(lhs: Expr, rhs: Expr) -> Expr {
    e(ExprKind::Logical {
        op: LogicalOp::And,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn or(lhs: Expr, rhs: Expr) -> Expr {
    e(ExprKind::Logical {
        op: LogicalOp::Or,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

pub fn not(operand: Expr) -> Expr {
    e(ExprKind::Unary {
        op: UnaryOp::Not,
        operand: Box::new(operand),
    })
}

pub fn neg(operand: Expr) -> Expr {
    e(ExprKind::Unary {
        op: UnaryOp::Neg,
        operand: Box::new(operand),
    })
}

pub fn load(array: Expr, index: Expr) -> Expr {
    e(ExprKind::ArrayLoad {
        array: Box::new(array),
        index: Box::new(index),
    })
}

pub fn len(array: Expr) -> Expr {
    e(ExprKind::ArrayLen(Box::new(array)))
}

pub fn new_array(len: Expr) -> Expr {
    e(ExprKind::NewArray { len: Box::new(len) })
}

pub fn array_lit(items: Vec<Expr>) -> Expr {
    e(ExprKind::ArrayLit(items))
}

/// Call on the caller's own type.
pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    e(ExprKind::Call {
        callee: Callee {
            owner: None,
            name: name.to_string(),
        },
        receiver: None,
        args,
    })
}

/// Static call `Owner.name(args)`.
pub fn call_static(owner: &str, name: &str, args: Vec<Expr>) -> Expr {
    e(ExprKind::Call {
        callee: Callee {
            owner: Some(owner.to_string()),
            name: name.to_string(),
        },
        receiver: None,
        args,
    })
}

/// Instance call `receiver.name(args)` where `receiver` has static type `owner`.
pub fn call_on(receiver: Expr, owner: &str, name: &str, args: Vec<Expr>) -> Expr {
    e(ExprKind::Call {
        callee: Callee {
            owner: Some(owner.to_string()),
            name: name.to_string(),
        },
        receiver: Some(Box::new(receiver)),
        args,
    })
}

pub fn assign(target: Place, value: Expr) -> Expr {
    e(ExprKind::Assign {
        target,
        value: Box::new(value),
    })
}

pub fn update(op: UpdateOp, target: Place) -> Expr {
    e(ExprKind::Update { op, target })
}

pub fn post_inc(target: Place) -> Expr {
    update(UpdateOp::PostInc, target)
}

pub fn pre_inc(target: Place) -> Expr {
    update(UpdateOp::PreInc, target)
}

pub fn post_dec(target: Place) -> Expr {
    update(UpdateOp::PostDec, target)
}

pub fn local(name: &str) -> Place {
    Place::Local(name.to_string())
}

pub fn field_place(id: FieldId) -> Place {
    Place::Field(id)
}

pub fn element(array: Expr, index: Expr) -> Place {
    Place::Element {
        array: Box::new(array),
        index: Box::new(index),
    }
}

pub fn let_local(name: &str, ty: ValueType, init: Expr) -> Stmt {
    s(StmtKind::Let {
        name: name.to_string(),
        ty,
        domain: Domain::Unbounded,
        init: Some(init),
    })
}

/// `Wrapper w = new Wrapper(init, ...)`.
pub fn let_wrapped(name: &str, domain: Domain, init: Expr) -> Stmt {
    s(StmtKind::Let {
        name: name.to_string(),
        ty: ValueType::Int,
        domain,
        init: Some(init),
    })
}

pub fn set(target: Place, value: Expr) -> Stmt {
    s(StmtKind::Assign { target, value })
}

pub fn store(array: Expr, index: Expr, value: Expr) -> Stmt {
    s(StmtKind::ArrayStore {
        array,
        index,
        value,
    })
}

pub fn if_(cond: Expr, then_body: Vec<Stmt>) -> Stmt {
    if_else(cond, then_body, Vec::new())
}

pub fn if_else(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Stmt {
    s(StmtKind::If {
        cond,
        then_body,
        else_body,
    })
}

pub fn while_(cond: Expr, body: Vec<Stmt>) -> Stmt {
    s(StmtKind::While { cond, body })
}

pub fn assert_(cond: Expr) -> Stmt {
    s(StmtKind::Assert { cond })
}

pub fn ret(value: Expr) -> Stmt {
    s(StmtKind::Return { value: Some(value) })
}

pub fn ret_void() -> Stmt {
    s(StmtKind::Return { value: None })
}

pub fn expr_stmt(expr: Expr) -> Stmt {
    s(StmtKind::Expr(expr))
}

pub fn throw(exception: &str) -> Stmt {
    s(StmtKind::Throw {
        exception: exception.to_string(),
    })
}

impl Param {
    pub fn new(name: &str, ty: ValueType, domain: Domain) -> Self {
        Self {
            name: name.to_string(),
            ty,
            domain,
        }
    }

    pub fn int(name: &str) -> Self {
        Self::new(name, ValueType::Int, Domain::Unbounded)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ValueType::Bool, Domain::Unbounded)
    }

    pub fn int_array(name: &str) -> Self {
        Self::new(name, ValueType::IntArray, Domain::Unbounded)
    }

    /// `PositiveInteger`
    pub fn non_negative(name: &str) -> Self {
        Self::new(name, ValueType::Int, Domain::NonNegative)
    }

    /// `CappedInteger`; pass `bound(name)` when the cap is only known at runtime.
    pub fn capped(name: &str, cap: Expr) -> Self {
        Self::new(name, ValueType::Int, Domain::Capped(Box::new(cap)))
    }

    /// `StepInteger`; pass `bound(name)` when the step is only known at runtime.
    pub fn step(name: &str, step: Expr) -> Self {
        Self::new(name, ValueType::Int, Domain::Step(Box::new(step)))
    }

    pub fn object(name: &str, ty: &str) -> Self {
        Self::new(name, ValueType::Object(ty.to_string()), Domain::Unbounded)
    }
}

#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    next_line: u32,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            program: Program::new(),
            next_line: 1,
        }
    }

    /// A static `int` field with a constant initializer.
    pub fn static_field(&mut self, owner: &str, name: &str, init: i64) -> FieldId {
        self.field(owner, name, true, ValueType::Int, Domain::Unbounded, Some(init))
    }

    pub fn field(
        &mut self,
        owner: &str,
        name: &str,
        is_static: bool,
        ty: ValueType,
        domain: Domain,
        init: Option<i64>,
    ) -> FieldId {
        let id = FieldId(self.program.fields.len() as u32);
        self.program.fields.push(FieldDecl {
            id,
            owner: owner.to_string(),
            name: name.to_string(),
            is_static,
            ty,
            domain,
            init,
        });
        id
    }

    pub fn method(&mut self, owner: &str, name: &str) -> MethodBuilder<'_> {
        let id = MethodId(self.program.methods.len() as u32);
        MethodBuilder {
            method: Method {
                id,
                owner: owner.to_string(),
                name: name.to_string(),
                is_static: true,
                params: Vec::new(),
                ret: ValueType::Void,
                body: Vec::new(),
                span: Span::default(),
            },
            pb: self,
        }
    }

    pub fn finish(self) -> Program {
        self.program
    }
}

pub struct MethodBuilder<'b> {
    pb: &'b mut ProgramBuilder,
    method: Method,
}

impl MethodBuilder<'_> {
    pub fn param(mut self, param: Param) -> Self {
        self.method.params.push(param);
        self
    }

    pub fn returns(mut self, ty: ValueType) -> Self {
        self.method.ret = ty;
        self
    }

    pub fn instance(mut self) -> Self {
        self.method.is_static = false;
        self
    }

    pub fn body(mut self, body: Vec<Stmt>) -> Self {
        self.method.body = body;
        self
    }

    pub fn build(self) -> MethodId {
        let MethodBuilder { pb, mut method } = self;
        method.span = Span::line(pb.next_line);
        pb.next_line += 1;
        number_lines(&mut method.body, &mut pb.next_line);
        let id = method.id;
        pb.program.methods.push(method);
        id
    }
}

fn number_lines(body: &mut [Stmt], next: &mut u32) {
    for stmt in body {
        if stmt.span.is_unknown() {
            stmt.span = Span::line(*next);
        }
        *next += 1;
        match &mut stmt.kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                number_lines(then_body, next);
                number_lines(else_body, next);
            }
            StmtKind::While { body, .. } => number_lines(body, next),
            _ => {}
        }
    }
}
