#![forbid(unsafe_code)]

use miette::SourceSpan;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u32);

/// Source position of a node, as reported by the front end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
    /// 1-based line; 0 when the front end did not provide one.
    #[serde(default)]
    pub line: u32,
}

impl Span {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len, line: 0 }
    }

    pub fn line(line: u32) -> Self {
        Self {
            offset: 0,
            len: 0,
            line,
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Span::default()
    }
}

impl From<Span> for SourceSpan {
    fn from(s: Span) -> Self {
        SourceSpan::new(s.offset.into(), s.len)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Bool,
    IntArray,
    Void,
    Object(String),
    Opaque,
}

/// Declared value domain of a wrapper-typed parameter, local or field.
///
/// The analyzer recognizes exactly three wrapper kinds; anything else is `Unbounded`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    #[default]
    Unbounded,
    /// `value >= 0`
    NonNegative,
    /// `value <= bound`
    Capped(Box<Expr>),
    /// `value mod step == 0`
    Step(Box<Expr>),
}

impl Domain {
    pub fn is_wrapper(&self) -> bool {
        !matches!(self, Domain::Unbounded)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Domain::Unbounded => "unbounded",
            Domain::NonNegative => "non-negative",
            Domain::Capped(_) => "capped",
            Domain::Step(_) => "step",
        }
    }

    pub fn bound_expr(&self) -> Option<&Expr> {
        match self {
            Domain::Capped(e) | Domain::Step(e) => Some(&**e),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: ValueType,
    #[serde(default)]
    pub domain: Domain,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub id: FieldId,
    pub owner: String,
    pub name: String,
    pub is_static: bool,
    pub ty: ValueType,
    #[serde(default)]
    pub domain: Domain,
    /// Constant initializer, if the front end could fold one.
    #[serde(default)]
    pub init: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub id: MethodId,
    pub owner: String,
    pub name: String,
    pub is_static: bool,
    pub params: Vec<Param>,
    pub ret: ValueType,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub span: Span,
}

impl Method {
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.owner, self.name)
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<Method>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.0 as usize)
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDecl> {
        self.fields.get(id.0 as usize)
    }

    pub fn method_by_name(&self, qualified: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.qualified_name() == qualified)
    }

    pub fn field_name(&self, id: FieldId) -> String {
        match self.field(id) {
            Some(f) => format!("{}.{}", f.owner, f.name),
            None => format!("<field#{}>", id.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(default)]
    pub span: Span,
    pub kind: StmtKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StmtKind {
    /// Local declaration. A wrapper domain makes later writes checked `set`s.
    Let {
        name: String,
        ty: ValueType,
        #[serde(default)]
        domain: Domain,
        #[serde(default)]
        init: Option<Expr>,
    },
    Assign {
        target: Place,
        value: Expr,
    },
    ArrayStore {
        array: Expr,
        index: Expr,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        #[serde(default)]
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Assert {
        cond: Expr,
    },
    Return {
        #[serde(default)]
        value: Option<Expr>,
    },
    /// Expression evaluated for its effects (calls, `i++`, ...).
    Expr(Expr),
    Throw {
        exception: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expr {
    #[serde(default)]
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprKind {
    Int(i64),
    Bool(bool),
    /// Local or parameter. Reading a wrapper-typed variable yields its `get()`.
    Var(String),
    Field(FieldId),
    ArrayLoad {
        array: Box<Expr>,
        index: Box<Expr>,
    },
    ArrayLen(Box<Expr>),
    NewArray {
        len: Box<Expr>,
    },
    ArrayLit(Vec<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Update {
        op: UpdateOp,
        target: Place,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: Callee,
        #[serde(default)]
        receiver: Option<Box<Expr>>,
        args: Vec<Expr>,
    },
    Assign {
        target: Place,
        value: Box<Expr>,
    },
    /// The runtime bound (`cap` or `step`) carried by a wrapper variable.
    Bound(String),
    /// Something the front end could not lower (floating point, unknown operator, ...).
    Opaque(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callee {
    /// Static owner type; `None` means the caller's own type.
    #[serde(default)]
    pub owner: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Place {
    Local(String),
    Field(FieldId),
    Element { array: Box<Expr>, index: Box<Expr> },
}

impl Place {
    /// Writes to fields and array elements are visible outside the local frame.
    pub fn is_external(&self) -> bool {
        !matches!(self, Place::Local(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOp {
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

impl UpdateOp {
    pub fn delta(self) -> i64 {
        match self {
            UpdateOp::PreInc | UpdateOp::PostInc => 1,
            UpdateOp::PreDec | UpdateOp::PostDec => -1,
        }
    }

    pub fn is_post(self) -> bool {
        matches!(self, UpdateOp::PostInc | UpdateOp::PostDec)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

impl Expr {
    pub fn new(span: Span, kind: ExprKind) -> Self {
        Self { span, kind }
    }

    /// Direct sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Int(_)
            | ExprKind::Bool(_)
            | ExprKind::Var(_)
            | ExprKind::Field(_)
            | ExprKind::Bound(_)
            | ExprKind::Opaque(_) => Vec::new(),
            ExprKind::ArrayLoad { array, index } => vec![&**array, &**index],
            ExprKind::ArrayLen(e) | ExprKind::NewArray { len: e } => vec![&**e],
            ExprKind::ArrayLit(items) => items.iter().collect(),
            ExprKind::Unary { operand, .. } => vec![&**operand],
            ExprKind::Update { target, .. } => place_children(target),
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => {
                vec![&**lhs, &**rhs]
            }
            ExprKind::Call { receiver, args, .. } => {
                let mut out: Vec<&Expr> = Vec::new();
                if let Some(r) = receiver {
                    out.push(&**r);
                }
                out.extend(args.iter());
                out
            }
            ExprKind::Assign { target, value } => {
                let mut out = place_children(target);
                out.push(&**value);
                out
            }
        }
    }
}

fn place_children(p: &Place) -> Vec<&Expr> {
    match p {
        Place::Local(_) | Place::Field(_) => Vec::new(),
        Place::Element { array, index } => vec![&**array, &**index],
    }
}

impl Stmt {
    pub fn new(span: Span, kind: StmtKind) -> Self {
        Self { span, kind }
    }
}

/// Pre-order walk over every statement of a body, nested blocks included.
pub fn walk_stmts<'a>(body: &'a [Stmt], f: &mut impl FnMut(&'a Stmt)) {
    for stmt in body {
        f(stmt);
        match &stmt.kind {
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                walk_stmts(then_body, f);
                walk_stmts(else_body, f);
            }
            StmtKind::While { body, .. } => walk_stmts(body, f),
            _ => {}
        }
    }
}

/// Expressions owned directly by a statement (not those of nested blocks).
pub fn stmt_exprs(stmt: &Stmt) -> Vec<&Expr> {
    match &stmt.kind {
        StmtKind::Let { init, .. } => init.iter().collect(),
        StmtKind::Assign { target, value } => {
            let mut out = place_children(target);
            out.push(value);
            out
        }
        StmtKind::ArrayStore {
            array,
            index,
            value,
        } => vec![array, index, value],
        StmtKind::If { cond, .. } | StmtKind::While { cond, .. } => vec![cond],
        StmtKind::Assert { cond } => vec![cond],
        StmtKind::Return { value } => value.iter().collect(),
        StmtKind::Expr(e) => vec![e],
        StmtKind::Throw { .. } => Vec::new(),
    }
}

/// Pre-order walk over an expression tree.
pub fn walk_expr<'a>(expr: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    f(expr);
    for child in expr.children() {
        walk_expr(child, f);
    }
}
