//! AST node types for VBScript source.

use serde::Serialize;

pub use crate::runtime::ops::{BinaryOp, UnaryOp};

/// A position in a source buffer. `line` and `column` are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub index: usize,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub const START: Location = Location { index: 0, line: 1, column: 1 };

    pub fn new(index: usize, line: u32, column: u32) -> Self {
        Self { index, line, column }
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::START
    }
}

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize)]
pub struct Span {
    pub start: Location,
    pub end: Location,
}

impl Span {
    pub fn new(start: Location, end: Location) -> Self {
        Self { start, end }
    }

    /// Zero-width span at `loc`.
    pub fn at(loc: Location) -> Self {
        Self { start: loc, end: loc }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: if other.start.index < self.start.index { other.start } else { self.start },
            end: if other.end.index > self.end.index { other.end } else { self.end },
        }
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start.index <= other.start.index && other.end.index <= self.end.index
    }
}

/// An identifier as written, plus its case-insensitive lookup key.
///
/// The spelling is never rewritten; all lookups go through `key`.
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub key: String,
    pub span: Span,
}

impl Ident {
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        Self { name, key, span }
    }

    pub fn is(&self, key: &str) -> bool {
        self.key == key
    }
}

impl PartialEq for Ident {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Ident {}

/// A complete parsed compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub option_explicit: bool,
    pub body: Vec<Stmt>,
    /// Number of statement ids handed out; ids are dense in `0..stmt_count`.
    pub stmt_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtId(pub u32);

#[derive(Debug, Clone)]
pub struct Stmt {
    pub id: StmtId,
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Dim,
    Private,
    Public,
}

/// `Dim a`, `Dim a(3, 4)`, `Dim a()`
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Ident,
    /// `None` for a scalar, `Some(vec![])` for a dynamic array.
    pub bounds: Option<Vec<Expr>>,
}

#[derive(Debug, Clone)]
pub struct ConstDecl {
    pub name: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct ReDimItem {
    pub target: Ident,
    pub bounds: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    While,
    Until,
}

/// `While cond` / `Until cond` attached to a `Do` or `Loop` line.
#[derive(Debug, Clone)]
pub struct LoopCondition {
    pub kind: LoopKind,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Do,
    For,
    Function,
    Sub,
    Property,
}

#[derive(Debug, Clone)]
pub struct CaseClause {
    pub values: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct IfBranch {
    pub condition: Expr,
    pub body: Vec<Stmt>,
}

/// Statements.
#[derive(Debug, Clone)]
pub enum StmtKind {
    OptionExplicit,
    Dim {
        visibility: Visibility,
        vars: Vec<VarDecl>,
    },
    Const {
        visibility: Visibility,
        items: Vec<ConstDecl>,
    },
    ReDim {
        preserve: bool,
        items: Vec<ReDimItem>,
    },
    Erase(Vec<Ident>),
    /// `x = 1`, `Set o = New Foo`
    Assign {
        target: Expr,
        value: Expr,
        set: bool,
    },
    /// `Call foo(1)`, `foo 1, 2`, `obj.Method`
    Call {
        target: Expr,
        args: Vec<Expr>,
    },
    If {
        branches: Vec<IfBranch>,
        else_body: Option<Vec<Stmt>>,
    },
    For {
        var: Ident,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    ForEach {
        var: Ident,
        collection: Expr,
        body: Vec<Stmt>,
    },
    /// `Do [While|Until c] ... Loop [While|Until c]` and `While ... Wend`.
    Do {
        pre: Option<LoopCondition>,
        post: Option<LoopCondition>,
        body: Vec<Stmt>,
    },
    Select {
        selector: Expr,
        cases: Vec<CaseClause>,
        else_body: Option<Vec<Stmt>>,
    },
    With {
        object: Expr,
        body: Vec<Stmt>,
    },
    Exit(ExitKind),
    OnErrorResumeNext,
    OnErrorGoto0,
    Procedure(Box<ProcDecl>),
    Class(Box<ClassDecl>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Sub,
    Function,
    PropertyGet,
    PropertyLet,
    PropertySet,
}

impl ProcKind {
    pub fn returns_value(self) -> bool {
        matches!(self, ProcKind::Function | ProcKind::PropertyGet)
    }

    pub fn exit_kind(self) -> ExitKind {
        match self {
            ProcKind::Sub => ExitKind::Sub,
            ProcKind::Function => ExitKind::Function,
            ProcKind::PropertyGet | ProcKind::PropertyLet | ProcKind::PropertySet => ExitKind::Property,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Ident,
    pub by_ref: bool,
}

/// `Function foo(a, ByVal b) ... End Function`
#[derive(Debug, Clone)]
pub struct ProcDecl {
    pub kind: ProcKind,
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub visibility: Visibility,
    pub is_default: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ClassMember {
    Field {
        visibility: Visibility,
        vars: Vec<VarDecl>,
        span: Span,
    },
    Procedure(ProcDecl),
}

/// `Class Foo ... End Class`
#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: Ident,
    pub members: Vec<ClassMember>,
    pub span: Span,
}

/// Expressions.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Empty,
    Null,
    Nothing,
    Bool(bool),
    Integer(i16),
    Long(i32),
    Double(f64),
    String(String),
    Date(f64),
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Ident(Ident),
    Me,
    /// The implicit object of the innermost `With` block (`.Name`).
    WithTarget,
    /// `obj.name`
    Member {
        object: Box<Expr>,
        name: Ident,
    },
    /// `target(args)`. VBScript syntax does not distinguish a call from an
    /// array index; resolution happens in the compiler or at run time.
    Call {
        target: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `New ClassName`
    New(Ident),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `(expr)`. Kept so a parenthesized argument is passed by value.
    Paren(Box<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Strip redundant parentheses.
    pub fn unparen(&self) -> &Expr {
        match &self.kind {
            ExprKind::Paren(inner) => inner.unparen(),
            _ => self,
        }
    }
}
