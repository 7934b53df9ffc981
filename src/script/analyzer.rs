//! Scope resolution and semantic checks.
//!
//! Two passes over the tree. The first registers every module-level
//! variable, constant, procedure and class (so later code may call a
//! procedure declared further down), along with class members and
//! procedure parameters. The second walks statement bodies: it declares
//! procedure locals, allocates implicit locals for undeclared names used
//! inside procedures, flags bodies that contain `On Error Resume Next`, and
//! reports misuse (assigning to a constant, `Me` outside a class, `Exit`
//! without an enclosing construct).

use std::collections::HashMap;

use indexmap::IndexMap;

use super::ast::*;
use super::error::{CompileError, ErrorCode};
use crate::runtime::builtins;

pub type ScopeId = usize;

pub const MODULE_SCOPE: ScopeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Class(usize),
    Procedure(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    /// Module variable, by index into [`Analysis::globals`].
    Global(usize),
    Local(usize),
    /// Return slot of the enclosing Function or Property Get, bound to the
    /// procedure's own name.
    Result(usize),
    /// An undeclared name used inside a procedure: the module variable of
    /// that name when one exists at run time, otherwise this local slot.
    Implicit(usize),
    Constant(Literal),
    Procedure(usize),
    Class(usize),
    Field(usize),
    /// A Sub, Function or Property of the enclosing class.
    Member,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub symbol: Symbol,
    pub span: Span,
}

#[derive(Debug)]
pub struct AnalysisScope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub entries: IndexMap<String, Entry>,
    /// The body contains `On Error Resume Next`.
    pub resume_next: bool,
    /// Local slots handed out (procedures only).
    pub slots: usize,
}

#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: String,
    pub by_ref: bool,
}

#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub name: String,
    pub kind: ProcKind,
    pub class: Option<usize>,
    pub scope: ScopeId,
    pub params: Vec<ParamInfo>,
    pub result: Option<usize>,
    pub public: bool,
}

/// The procedures behind one class member name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberSlots {
    pub public: bool,
    pub method: Option<usize>,
    pub get: Option<usize>,
    pub let_: Option<usize>,
    pub set: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub public: bool,
    pub bounds: Option<Vec<Expr>>,
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub scope: ScopeId,
    pub fields: Vec<FieldInfo>,
    pub members: IndexMap<String, MemberSlots>,
    /// Lookup key of the `Default` member.
    pub default_member: Option<String>,
    pub initialize: Option<usize>,
}

#[derive(Debug)]
pub struct Analysis {
    pub scopes: Vec<AnalysisScope>,
    pub procs: Vec<ProcInfo>,
    pub classes: Vec<ClassInfo>,
    /// Declared module variables, as first spelled.
    pub globals: Vec<String>,
    proc_ids: HashMap<usize, usize>,
    class_ids: HashMap<usize, usize>,
}

impl Analysis {
    fn new() -> Self {
        Self {
            scopes: vec![AnalysisScope {
                kind: ScopeKind::Module,
                parent: None,
                entries: IndexMap::new(),
                resume_next: false,
                slots: 0,
            }],
            procs: Vec::new(),
            classes: Vec::new(),
            globals: Vec::new(),
            proc_ids: HashMap::new(),
            class_ids: HashMap::new(),
        }
    }

    pub fn scope(&self, id: ScopeId) -> &AnalysisScope {
        &self.scopes[id]
    }

    /// Resolve `key` from `scope` outwards.
    pub fn resolve(&self, scope: ScopeId, key: &str) -> Option<&Symbol> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id];
            if let Some(entry) = s.entries.get(key) {
                return Some(&entry.symbol);
            }
            current = s.parent;
        }
        None
    }

    pub fn proc_id(&self, decl: &ProcDecl) -> Option<usize> {
        self.proc_ids.get(&decl.span.start.index).copied()
    }

    pub fn class_id(&self, decl: &ClassDecl) -> Option<usize> {
        self.class_ids.get(&decl.span.start.index).copied()
    }

    /// The value of a constant expression: a literal, a negated number or
    /// a named constant.
    pub fn const_value(&self, scope: ScopeId, expr: &Expr) -> Option<Literal> {
        match &expr.kind {
            ExprKind::Literal(lit) => Some(lit.clone()),
            ExprKind::Paren(inner) => self.const_value(scope, inner),
            ExprKind::Ident(id) => match self.resolve(scope, &id.key) {
                Some(Symbol::Constant(lit)) => Some(lit.clone()),
                _ => builtins::constant(&id.key),
            },
            ExprKind::Unary {
                op: UnaryOp::Negate,
                operand,
            } => match self.const_value(scope, operand)? {
                Literal::Integer(n) => Some(n.checked_neg().map_or(Literal::Long(-i32::from(n)), Literal::Integer)),
                Literal::Long(n) => Some(n.checked_neg().map_or(Literal::Double(-f64::from(n)), Literal::Long)),
                Literal::Double(n) => Some(Literal::Double(-n)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Array bounds in a declaration must be integer constants.
    pub fn const_bounds(&self, scope: ScopeId, bounds: &[Expr]) -> Result<Vec<i64>, CompileError> {
        bounds
            .iter()
            .map(|b| match self.const_value(scope, b) {
                Some(Literal::Integer(n)) => Ok(i64::from(n)),
                Some(Literal::Long(n)) => Ok(i64::from(n)),
                Some(Literal::Double(n)) if n.fract() == 0.0 => Ok(n as i64),
                _ => Err(CompileError::semantic(
                    ErrorCode::ExpectedInteger,
                    "Expected integer constant",
                    b.span,
                )),
            })
            .collect()
    }
}

/// Analyze a parsed program. Errors do not stop analysis.
pub fn analyze(program: &Program) -> (Analysis, Vec<CompileError>) {
    let mut analyzer = Analyzer {
        analysis: Analysis::new(),
        errors: Vec::new(),
    };
    analyzer.declare_variables(MODULE_SCOPE, &program.body);
    for stmt in &program.body {
        match &stmt.kind {
            StmtKind::Procedure(decl) => {
                analyzer.declare_proc(decl, None, MODULE_SCOPE);
            }
            StmtKind::Class(decl) => analyzer.declare_class(decl),
            _ => {}
        }
    }
    let ctx = Ctx::module();
    analyzer.check_body(&ctx, &program.body, true);
    (analyzer.analysis, analyzer.errors)
}

#[derive(Debug, Clone, Copy)]
struct Ctx {
    scope: ScopeId,
    proc: Option<usize>,
    class: Option<usize>,
    do_depth: usize,
    for_depth: usize,
    with_depth: usize,
}

impl Ctx {
    fn module() -> Self {
        Self {
            scope: MODULE_SCOPE,
            proc: None,
            class: None,
            do_depth: 0,
            for_depth: 0,
            with_depth: 0,
        }
    }
}

/// Visit `body` and every statement nested in its blocks, without entering
/// procedures or classes.
pub(crate) fn for_each_nested<'a>(body: &'a [Stmt], f: &mut impl FnMut(&'a Stmt)) {
    for stmt in body {
        f(stmt);
        match &stmt.kind {
            StmtKind::If { branches, else_body } => {
                for b in branches {
                    for_each_nested(&b.body, f);
                }
                if let Some(body) = else_body {
                    for_each_nested(body, f);
                }
            }
            StmtKind::For { body, .. }
            | StmtKind::ForEach { body, .. }
            | StmtKind::Do { body, .. }
            | StmtKind::With { body, .. } => for_each_nested(body, f),
            StmtKind::Select { cases, else_body, .. } => {
                for c in cases {
                    for_each_nested(&c.body, f);
                }
                if let Some(body) = else_body {
                    for_each_nested(body, f);
                }
            }
            _ => {}
        }
    }
}

struct Analyzer {
    analysis: Analysis,
    errors: Vec<CompileError>,
}

impl Analyzer {
    fn new_scope(&mut self, kind: ScopeKind, parent: ScopeId) -> ScopeId {
        self.analysis.scopes.push(AnalysisScope {
            kind,
            parent: Some(parent),
            entries: IndexMap::new(),
            resume_next: false,
            slots: 0,
        });
        self.analysis.scopes.len() - 1
    }

    fn define(&mut self, scope: ScopeId, name: &Ident, symbol: Symbol) -> bool {
        let entries = &mut self.analysis.scopes[scope].entries;
        if entries.contains_key(&name.key) {
            self.errors.push(CompileError::semantic(
                ErrorCode::NameRedefined,
                format!("Name redefined: '{}'", name.name),
                name.span,
            ));
            return false;
        }
        entries.insert(
            name.key.clone(),
            Entry {
                name: name.name.clone(),
                symbol,
                span: name.span,
            },
        );
        true
    }

    fn next_slot(&mut self, scope: ScopeId) -> usize {
        let s = &mut self.analysis.scopes[scope];
        s.slots += 1;
        s.slots - 1
    }

    fn declare_variable(&mut self, scope: ScopeId, name: &Ident) {
        let symbol = match self.analysis.scopes[scope].kind {
            ScopeKind::Module => Symbol::Global(self.analysis.globals.len()),
            _ => Symbol::Local(self.analysis.scopes[scope].slots),
        };
        if self.define(scope, name, symbol.clone()) {
            match symbol {
                Symbol::Global(_) => self.analysis.globals.push(name.name.clone()),
                _ => {
                    self.next_slot(scope);
                }
            }
        }
    }

    // ── Pass 1: declarations ─────────────────────────────────────

    /// `Dim` and `Const` anywhere in the body's blocks, then `ReDim` of
    /// names not declared yet.
    fn declare_variables(&mut self, scope: ScopeId, body: &[Stmt]) {
        let mut decls: Vec<&Stmt> = Vec::new();
        for_each_nested(body, &mut |s| decls.push(s));
        for stmt in &decls {
            match &stmt.kind {
                StmtKind::Dim { vars, .. } => {
                    for v in vars {
                        self.declare_variable(scope, &v.name);
                    }
                }
                StmtKind::Const { items, .. } => {
                    for item in items {
                        match self.analysis.const_value(scope, &item.value) {
                            Some(lit) => {
                                self.define(scope, &item.name, Symbol::Constant(lit));
                            }
                            None => self.errors.push(CompileError::semantic(
                                ErrorCode::ExpectedLiteral,
                                "Expected literal constant",
                                item.value.span,
                            )),
                        }
                    }
                }
                _ => {}
            }
        }
        for stmt in &decls {
            if let StmtKind::ReDim { items, .. } = &stmt.kind {
                for item in items {
                    if self.analysis.resolve(scope, &item.target.key).is_none() {
                        self.declare_variable(scope, &item.target);
                    }
                }
            }
        }
    }

    fn declare_proc(&mut self, decl: &ProcDecl, class: Option<usize>, parent: ScopeId) -> usize {
        let id = self.analysis.procs.len();
        let scope = self.new_scope(ScopeKind::Procedure(id), parent);
        let mut params = Vec::with_capacity(decl.params.len());
        for p in &decl.params {
            let slot = self.analysis.scopes[scope].slots;
            if self.define(scope, &p.name, Symbol::Local(slot)) {
                self.next_slot(scope);
            }
            params.push(ParamInfo {
                name: p.name.name.clone(),
                by_ref: p.by_ref,
            });
        }
        let result = if decl.kind.returns_value() {
            let slot = self.next_slot(scope);
            self.analysis.scopes[scope].entries.insert(
                decl.name.key.clone(),
                Entry {
                    name: decl.name.name.clone(),
                    symbol: Symbol::Result(slot),
                    span: decl.name.span,
                },
            );
            Some(slot)
        } else {
            None
        };
        self.analysis.procs.push(ProcInfo {
            name: decl.name.name.clone(),
            kind: decl.kind,
            class,
            scope,
            params,
            result,
            public: decl.visibility != Visibility::Private,
        });
        self.analysis.proc_ids.insert(decl.span.start.index, id);
        match class {
            None => {
                self.define(MODULE_SCOPE, &decl.name, Symbol::Procedure(id));
            }
            Some(c) => self.declare_member(c, decl, id),
        }
        id
    }

    fn declare_member(&mut self, class: usize, decl: &ProcDecl, id: usize) {
        let class_scope = self.analysis.classes[class].scope;
        let key = decl.name.key.clone();
        let existing = self.analysis.scopes[class_scope].entries.get(&key).map(|e| e.symbol.clone());
        if matches!(existing, Some(Symbol::Field(_))) {
            self.define(class_scope, &decl.name, Symbol::Member);
            return;
        }
        let info = &mut self.analysis.classes[class];
        let slots = info.members.entry(key.clone()).or_default();
        let clash = match decl.kind {
            ProcKind::Sub | ProcKind::Function => {
                slots.method.is_some() || slots.get.is_some() || slots.let_.is_some() || slots.set.is_some()
            }
            ProcKind::PropertyGet => slots.get.is_some() || slots.method.is_some(),
            ProcKind::PropertyLet => slots.let_.is_some() || slots.method.is_some(),
            ProcKind::PropertySet => slots.set.is_some() || slots.method.is_some(),
        };
        if clash {
            self.errors.push(CompileError::semantic(
                ErrorCode::NameRedefined,
                format!("Name redefined: '{}'", decl.name.name),
                decl.name.span,
            ));
            return;
        }
        let slot = match decl.kind {
            ProcKind::Sub | ProcKind::Function => &mut slots.method,
            ProcKind::PropertyGet => &mut slots.get,
            ProcKind::PropertyLet => &mut slots.let_,
            ProcKind::PropertySet => &mut slots.set,
        };
        *slot = Some(id);
        slots.public |= decl.visibility != Visibility::Private;
        if decl.is_default {
            match &info.default_member {
                Some(d) if *d != key => self.errors.push(CompileError::semantic(
                    ErrorCode::MultipleDefaults,
                    "Cannot have multiple default property/method in a Class",
                    decl.span,
                )),
                _ => info.default_member = Some(key.clone()),
            }
        }
        if key == "class_initialize" && decl.kind == ProcKind::Sub {
            info.initialize = Some(id);
        }
        if existing.is_none() {
            self.analysis.scopes[class_scope].entries.insert(
                key,
                Entry {
                    name: decl.name.name.clone(),
                    symbol: Symbol::Member,
                    span: decl.name.span,
                },
            );
        }
    }

    fn declare_class(&mut self, decl: &ClassDecl) {
        let id = self.analysis.classes.len();
        let scope = self.new_scope(ScopeKind::Class(id), MODULE_SCOPE);
        self.define(MODULE_SCOPE, &decl.name, Symbol::Class(id));
        self.analysis.classes.push(ClassInfo {
            name: decl.name.name.clone(),
            scope,
            fields: Vec::new(),
            members: IndexMap::new(),
            default_member: None,
            initialize: None,
        });
        self.analysis.class_ids.insert(decl.span.start.index, id);
        for member in &decl.members {
            match member {
                ClassMember::Field { visibility, vars, .. } => {
                    for v in vars {
                        let index = self.analysis.classes[id].fields.len();
                        if self.define(scope, &v.name, Symbol::Field(index)) {
                            self.analysis.classes[id].fields.push(FieldInfo {
                                name: v.name.name.clone(),
                                public: *visibility != Visibility::Private,
                                bounds: v.bounds.clone(),
                            });
                        }
                    }
                }
                ClassMember::Procedure(p) => {
                    self.declare_proc(p, Some(id), scope);
                }
            }
        }
    }

    // ── Pass 2: bodies ───────────────────────────────────────────

    fn error(&mut self, code: ErrorCode, message: impl Into<String>, span: Span) {
        self.errors.push(CompileError::semantic(code, message, span));
    }

    fn check_body(&mut self, ctx: &Ctx, body: &[Stmt], top: bool) {
        for stmt in body {
            self.check_stmt(ctx, stmt, top);
        }
    }

    fn check_proc(&mut self, decl: &ProcDecl) {
        let Some(id) = self.analysis.proc_id(decl) else { return };
        let info = &self.analysis.procs[id];
        let ctx = Ctx {
            scope: info.scope,
            proc: Some(id),
            class: info.class,
            ..Ctx::module()
        };
        self.declare_variables(ctx.scope, &decl.body);
        self.check_body(&ctx, &decl.body, false);
    }

    fn check_class(&mut self, decl: &ClassDecl) {
        for member in &decl.members {
            if let ClassMember::Procedure(p) = member {
                self.check_proc(p);
            }
        }
    }

    fn check_stmt(&mut self, ctx: &Ctx, stmt: &Stmt, top: bool) {
        match &stmt.kind {
            StmtKind::OptionExplicit | StmtKind::OnErrorGoto0 | StmtKind::Const { .. } => {}
            StmtKind::Dim { vars, .. } => {
                for v in vars {
                    for b in v.bounds.iter().flatten() {
                        self.check_expr(ctx, b);
                    }
                }
            }
            StmtKind::ReDim { items, .. } => {
                for item in items {
                    self.check_name_target(ctx, &item.target);
                    for b in &item.bounds {
                        self.check_expr(ctx, b);
                    }
                }
            }
            StmtKind::Erase(names) => {
                for n in names {
                    self.check_name_target(ctx, n);
                }
            }
            StmtKind::Assign { target, value, .. } => {
                self.check_target(ctx, target);
                self.check_expr(ctx, value);
            }
            StmtKind::Call { target, args } => {
                self.check_expr(ctx, target);
                for a in args {
                    self.check_expr(ctx, a);
                }
            }
            StmtKind::If { branches, else_body } => {
                for b in branches {
                    self.check_expr(ctx, &b.condition);
                    self.check_body(ctx, &b.body, false);
                }
                if let Some(body) = else_body {
                    self.check_body(ctx, body, false);
                }
            }
            StmtKind::For {
                var,
                from,
                to,
                step,
                body,
            } => {
                self.check_name_target(ctx, var);
                self.check_expr(ctx, from);
                self.check_expr(ctx, to);
                if let Some(step) = step {
                    self.check_expr(ctx, step);
                }
                let inner = Ctx {
                    for_depth: ctx.for_depth + 1,
                    ..*ctx
                };
                self.check_body(&inner, body, false);
            }
            StmtKind::ForEach { var, collection, body } => {
                self.check_name_target(ctx, var);
                self.check_expr(ctx, collection);
                let inner = Ctx {
                    for_depth: ctx.for_depth + 1,
                    ..*ctx
                };
                self.check_body(&inner, body, false);
            }
            StmtKind::Do { pre, post, body } => {
                for cond in [pre, post].into_iter().flatten() {
                    self.check_expr(ctx, &cond.expr);
                }
                let inner = Ctx {
                    do_depth: ctx.do_depth + 1,
                    ..*ctx
                };
                self.check_body(&inner, body, false);
            }
            StmtKind::Select {
                selector,
                cases,
                else_body,
            } => {
                self.check_expr(ctx, selector);
                for c in cases {
                    for v in &c.values {
                        self.check_expr(ctx, v);
                    }
                    self.check_body(ctx, &c.body, false);
                }
                if let Some(body) = else_body {
                    self.check_body(ctx, body, false);
                }
            }
            StmtKind::With { object, body } => {
                self.check_expr(ctx, object);
                let inner = Ctx {
                    with_depth: ctx.with_depth + 1,
                    ..*ctx
                };
                self.check_body(&inner, body, false);
            }
            StmtKind::Exit(kind) => self.check_exit(ctx, *kind, stmt.span),
            StmtKind::OnErrorResumeNext => self.analysis.scopes[ctx.scope].resume_next = true,
            StmtKind::Procedure(decl) => {
                if top && ctx.proc.is_none() {
                    self.check_proc(decl);
                } else {
                    self.error(ErrorCode::SyntaxError, "Procedure declared inside a block", decl.span);
                }
            }
            StmtKind::Class(decl) => {
                if top && ctx.proc.is_none() {
                    self.check_class(decl);
                } else {
                    self.error(ErrorCode::SyntaxError, "Class declared inside a block", decl.span);
                }
            }
        }
    }

    fn check_exit(&mut self, ctx: &Ctx, kind: ExitKind, span: Span) {
        let valid = match kind {
            ExitKind::Do => ctx.do_depth > 0,
            ExitKind::For => ctx.for_depth > 0,
            ExitKind::Function | ExitKind::Sub | ExitKind::Property => ctx
                .proc
                .is_some_and(|p| self.analysis.procs[p].kind.exit_kind() == kind),
        };
        if !valid {
            self.error(ErrorCode::InvalidExit, "Invalid 'exit' statement", span);
        }
    }

    /// Resolve an identifier, allocating an implicit local when an
    /// undeclared name is used inside a procedure.
    fn resolve_ident(&mut self, ctx: &Ctx, id: &Ident) -> Option<Symbol> {
        if let Some(symbol) = self.analysis.resolve(ctx.scope, &id.key) {
            return Some(symbol.clone());
        }
        if ctx.proc.is_none() || builtins::is_known(&id.key) {
            return None;
        }
        let slot = self.next_slot(ctx.scope);
        self.analysis.scopes[ctx.scope].entries.insert(
            id.key.clone(),
            Entry {
                name: id.name.clone(),
                symbol: Symbol::Implicit(slot),
                span: id.span,
            },
        );
        Some(Symbol::Implicit(slot))
    }

    fn check_expr(&mut self, ctx: &Ctx, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(_) | ExprKind::New(_) => {}
            ExprKind::Ident(id) => {
                self.resolve_ident(ctx, id);
            }
            ExprKind::Me => {
                if ctx.class.is_none() {
                    self.error(ErrorCode::InvalidMe, "Invalid use of 'Me' keyword", expr.span);
                }
            }
            ExprKind::WithTarget => {
                if ctx.with_depth == 0 {
                    self.error(ErrorCode::SyntaxError, "Invalid or unqualified reference", expr.span);
                }
            }
            ExprKind::Member { object, .. } => self.check_expr(ctx, object),
            ExprKind::Call { target, args } => {
                self.check_expr(ctx, target);
                for a in args {
                    self.check_expr(ctx, a);
                }
            }
            ExprKind::Binary { left, right, .. } => {
                self.check_expr(ctx, left);
                self.check_expr(ctx, right);
            }
            ExprKind::Unary { operand, .. } => self.check_expr(ctx, operand),
            ExprKind::Paren(inner) => self.check_expr(ctx, inner),
        }
    }

    fn illegal_assignment(&mut self, name: &str, span: Span) {
        self.error(
            ErrorCode::IllegalAssignment,
            format!("Illegal assignment: '{name}'"),
            span,
        );
    }

    /// A bare name on the left of `=`, or a `For`/`ReDim`/`Erase` variable.
    fn check_name_target(&mut self, ctx: &Ctx, id: &Ident) {
        match self.resolve_ident(ctx, id) {
            Some(Symbol::Constant(_) | Symbol::Procedure(_) | Symbol::Class(_)) => {
                self.illegal_assignment(&id.name, id.span);
            }
            Some(Symbol::Member) => {
                let writable = ctx
                    .class
                    .and_then(|c| self.analysis.classes[c].members.get(&id.key))
                    .is_some_and(|m| m.let_.is_some() || m.set.is_some());
                if !writable {
                    self.illegal_assignment(&id.name, id.span);
                }
            }
            _ => {}
        }
    }

    fn check_target(&mut self, ctx: &Ctx, target: &Expr) {
        match &target.kind {
            ExprKind::Ident(id) => self.check_name_target(ctx, id),
            ExprKind::Member { object, .. } => self.check_expr(ctx, object),
            ExprKind::Call { target: callee, args } => {
                match &callee.kind {
                    ExprKind::Ident(id) => match self.resolve_ident(ctx, id) {
                        Some(Symbol::Constant(_) | Symbol::Procedure(_) | Symbol::Class(_)) => {
                            self.illegal_assignment(&id.name, id.span);
                        }
                        _ => {}
                    },
                    _ => self.check_expr(ctx, callee),
                }
                for a in args {
                    self.check_expr(ctx, a);
                }
            }
            ExprKind::Paren(inner) => self.check_target(ctx, inner),
            _ => self.illegal_assignment("expression", target.span),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::script::{lexer, parser};

    fn analyze_str(source: &str) -> (Analysis, Vec<CompileError>) {
        let (tokens, lex_errors) = lexer::lex(source);
        assert!(lex_errors.is_empty(), "{lex_errors:?}");
        let (program, parse_errors) = parser::parse(tokens);
        assert!(parse_errors.is_empty(), "{parse_errors:?}");
        analyze(&program)
    }

    fn codes(errors: &[CompileError]) -> Vec<ErrorCode> {
        errors.iter().map(|e| e.code).collect()
    }

    #[test]
    fn forward_references_resolve() {
        let (a, errors) = analyze_str("x = Twice(2)\nFunction Twice(n)\n  Twice = n * 2\nEnd Function\nDim x\n");
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(a.resolve(MODULE_SCOPE, "twice"), Some(&Symbol::Procedure(0)));
        assert_eq!(a.resolve(MODULE_SCOPE, "x"), Some(&Symbol::Global(0)));
        let proc_scope = a.procs[0].scope;
        assert_eq!(a.resolve(proc_scope, "n"), Some(&Symbol::Local(0)));
        assert_eq!(a.resolve(proc_scope, "twice"), Some(&Symbol::Result(1)));
    }

    #[test]
    fn names_are_case_insensitive_and_keep_spelling() {
        let (a, errors) = analyze_str("Dim MyVar\nmyvar = 1\nMYVAR = 2\n");
        assert!(errors.is_empty());
        assert_eq!(a.globals, vec!["MyVar".to_string()]);
        assert_eq!(a.resolve(MODULE_SCOPE, "myvar"), Some(&Symbol::Global(0)));
    }

    #[test]
    fn redefinition_is_reported() {
        let (_, errors) = analyze_str("Dim a\nDim A\nSub a\nEnd Sub\n");
        assert_eq!(codes(&errors), vec![ErrorCode::NameRedefined, ErrorCode::NameRedefined]);
    }

    #[test]
    fn undeclared_names_in_procedures_become_implicit() {
        let (a, errors) = analyze_str("Sub Work()\n  total = 1\n  Dim local\n  local = Len(\"x\")\nEnd Sub\n");
        assert!(errors.is_empty());
        let scope = a.procs[0].scope;
        assert_eq!(a.resolve(scope, "local"), Some(&Symbol::Local(0)));
        assert_eq!(a.resolve(scope, "total"), Some(&Symbol::Implicit(1)));
        assert!(a.resolve(scope, "len").is_none());
        assert_eq!(a.scope(scope).slots, 2);
    }

    #[test]
    fn constants_fold_and_reject_assignment() {
        let (a, errors) = analyze_str("Const Limit = -5, Name = \"n\"\nLimit = 3\n");
        assert_eq!(a.resolve(MODULE_SCOPE, "limit"), Some(&Symbol::Constant(Literal::Integer(-5))));
        assert_eq!(
            a.resolve(MODULE_SCOPE, "name"),
            Some(&Symbol::Constant(Literal::String("n".to_string())))
        );
        assert_eq!(codes(&errors), vec![ErrorCode::IllegalAssignment]);
    }

    #[test]
    fn class_members_and_defaults() {
        let source = "Class Point\n  Public X\n  Private y_\n  Public Default Property Get Y\n    Y = y_\n  End Property\n  Property Let Y(v)\n    y_ = v\n  End Property\n  Sub Class_Initialize\n    X = 0\n  End Sub\nEnd Class\n";
        let (a, errors) = analyze_str(source);
        assert!(errors.is_empty(), "{errors:?}");
        let class = &a.classes[0];
        assert_eq!(class.fields.len(), 2);
        assert!(class.fields[0].public && !class.fields[1].public);
        let y = class.members["y"];
        assert!(y.get.is_some() && y.let_.is_some() && y.public);
        assert_eq!(class.default_member.as_deref(), Some("y"));
        assert!(class.initialize.is_some());
        assert_eq!(a.resolve(class.scope, "x"), Some(&Symbol::Field(0)));
    }

    #[test]
    fn multiple_defaults_are_rejected() {
        let source = "Class C\n  Public Default Function A\n  End Function\n  Public Default Function B\n  End Function\nEnd Class\n";
        let (_, errors) = analyze_str(source);
        assert_eq!(codes(&errors), vec![ErrorCode::MultipleDefaults]);
    }

    #[test]
    fn misplaced_me_and_exit() {
        let (_, errors) = analyze_str("x = Me\nExit For\nSub S\n  Exit Function\nEnd Sub\nDo\n  Exit Do\nLoop\n");
        assert_eq!(
            codes(&errors),
            vec![ErrorCode::InvalidMe, ErrorCode::InvalidExit, ErrorCode::InvalidExit]
        );
    }

    #[test]
    fn resume_next_marks_its_body() {
        let (a, errors) = analyze_str("Sub S\n  On Error Resume Next\n  x = 1 / 0\nEnd Sub\nS\n");
        assert!(errors.is_empty());
        assert!(a.scope(a.procs[0].scope).resume_next);
        assert!(!a.scope(MODULE_SCOPE).resume_next);
    }

    #[test]
    fn array_bounds_must_be_constant() {
        let (a, _) = analyze_str("Const N = 4\nDim x\n");
        let program = parser::parse(lexer::lex("Dim a(N, 2)\nDim b(x)\n").0).0;
        let StmtKind::Dim { vars, .. } = &program.body[0].kind else { panic!() };
        assert_eq!(a.const_bounds(MODULE_SCOPE, vars[0].bounds.as_ref().unwrap()).unwrap(), vec![4, 2]);
        let StmtKind::Dim { vars, .. } = &program.body[1].kind else { panic!() };
        assert!(a.const_bounds(MODULE_SCOPE, vars[0].bounds.as_ref().unwrap()).is_err());
    }
}
