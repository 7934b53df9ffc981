//! Lowering of an analyzed program into the tree IR the VM executes.
//!
//! Names are resolved once, here: variables become [`Place`]s, calls to
//! script procedures become direct [`Node::CallProc`]s, and everything that
//! can only be decided at run time (member access, indexing, operators,
//! construction of host classes) gets its own [`CallSite`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::analyzer::{self, Analysis, ParamInfo, ScopeId, Symbol, MODULE_SCOPE};
use super::ast::*;
use super::error::{CompileError, ErrorCode};
use super::source_map::SourceMapper;
use super::trace::TracePoint;
use crate::runtime::binder::{BinderFactory, BinderKey, CallSite};
use crate::runtime::builtins;
use crate::runtime::error::RuntimeError;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    /// Frame slot: parameter, local, implicit local or function result.
    Local(usize),
    /// Module variable, by index into [`CompiledUnit::globals`].
    Global(usize),
    /// Field of `Me`.
    Field(usize),
    /// The module variable `global` if it exists when accessed, else the
    /// frame slot `local`.
    Implicit { global: usize, local: usize },
}

/// A call argument. Variables and array elements are passed so a ByRef
/// parameter can write back; everything else is a plain value.
#[derive(Debug)]
pub enum Arg {
    Value(Node),
    Ref(Place),
    Element { array: Place, indices: Vec<Node>, site: usize },
}

#[derive(Debug)]
pub enum Node {
    Const(Literal),
    Load(Place),
    Me,
    WithTarget,
    GetMember { object: Box<Node>, site: usize },
    InvokeMember { object: Box<Node>, args: Vec<Arg>, site: usize },
    /// `target(args)` on a value: array indexing or a default-member call.
    Invoke { target: Box<Node>, args: Vec<Arg>, site: usize },
    /// Direct call of a procedure in this unit. `me` passes the current
    /// instance through (class members calling each other).
    CallProc { proc: usize, args: Vec<Arg>, me: bool },
    Builtin { index: usize, args: Vec<Node> },
    CreateObject { args: Vec<Node>, site: usize },
    NewClass(usize),
    NewHost { name: String, site: usize },
    Binary { op: BinaryOp, left: Box<Node>, right: Box<Node>, site: usize },
    Unary { op: UnaryOp, operand: Box<Node>, site: usize },
    /// Raises when evaluated.
    Fault(RuntimeError),
}

/// Left-hand side of an assignment.
#[derive(Debug)]
pub enum Target {
    Place(Place),
    /// `a(i) = v`: array element in place, or the default member of an
    /// object held in `place`.
    Index { place: Place, indices: Vec<Node>, site: usize },
    /// `obj.name = v`, `obj.name(i) = v`
    Member { object: Node, args: Vec<Node>, site: usize },
    /// `expr(i) = v` on any other expression.
    Dynamic { target: Node, args: Vec<Node>, site: usize },
    /// Property Let/Set of the enclosing class, called on `Me`.
    Property { proc: usize, args: Vec<Node> },
}

#[derive(Debug)]
pub struct LoopTest {
    pub until: bool,
    pub expr: Node,
}

#[derive(Debug)]
pub struct Op {
    pub kind: OpKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum OpKind {
    Eval(Node),
    Assign { target: Target, value: Node, set: bool },
    If { branches: Vec<(Node, Vec<Op>)>, else_body: Vec<Op> },
    For { var: Place, from: Node, to: Node, step: Option<Node>, body: Vec<Op> },
    ForEach { var: Place, collection: Node, body: Vec<Op> },
    Loop { pre: Option<LoopTest>, post: Option<LoopTest>, body: Vec<Op> },
    Select { selector: Node, cases: Vec<(Vec<Node>, Vec<Op>)>, else_body: Vec<Op> },
    With { object: Node, body: Vec<Op> },
    Exit(ExitKind),
    OnErrorResumeNext,
    OnErrorGoto0,
    ReDim { preserve: bool, place: Place, bounds: Vec<Node> },
    Erase(Place),
    /// Bring a declared variable into existence. `array` is `Some(vec![])`
    /// for `Dim a()`, `Some(bounds)` for a fixed array.
    Declare { place: Place, array: Option<Vec<i64>> },
    /// Faults are caught and recorded into `Err` while the frame has
    /// `On Error Resume Next` in effect.
    Guarded(Box<Op>),
    Traced { point: TracePoint, op: Box<Op> },
}

#[derive(Debug)]
pub struct CompiledProc {
    pub name: String,
    pub kind: ProcKind,
    pub class: Option<usize>,
    pub params: Vec<ParamInfo>,
    pub locals: usize,
    pub result: Option<usize>,
    pub prologue: Vec<Op>,
    pub body: Vec<Op>,
}

/// What one public or private name of a class maps to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassMemberSlots {
    pub public: bool,
    pub field: Option<usize>,
    pub method: Option<usize>,
    pub get: Option<usize>,
    pub let_: Option<usize>,
    pub set: Option<usize>,
}

#[derive(Debug)]
pub struct CompiledField {
    pub name: String,
    pub array: Option<Vec<i64>>,
}

#[derive(Debug)]
pub struct CompiledClass {
    pub name: String,
    pub fields: Vec<CompiledField>,
    /// Keyed by lowercase name.
    pub members: HashMap<String, ClassMemberSlots>,
    pub default_member: Option<String>,
    pub initialize: Option<usize>,
}

/// An executable unit. Immutable apart from call-site caches, so it can be
/// cached and shared between executions.
#[derive(Debug)]
pub struct CompiledUnit {
    pub id: u64,
    pub name: Arc<str>,
    pub option_explicit: bool,
    pub globals: Vec<String>,
    pub prologue: Vec<Op>,
    pub body: Vec<Op>,
    pub procs: Vec<CompiledProc>,
    pub classes: Vec<CompiledClass>,
    pub sites: Vec<CallSite>,
    pub literal_blocks: Vec<String>,
    pub mapper: SourceMapper,
}

/// Everything about the source the unit carries along.
#[derive(Debug, Clone)]
pub struct UnitSource {
    pub name: Arc<str>,
    pub mapper: SourceMapper,
    pub literal_blocks: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub trace: bool,
    pub option_explicit: bool,
}

pub fn compile(
    program: &Program,
    analysis: &Analysis,
    source: UnitSource,
    options: CompileOptions,
    factory: &BinderFactory,
) -> Result<CompiledUnit, Vec<CompileError>> {
    let mut c = Compiler {
        analysis,
        factory,
        sites: Vec::new(),
        globals: analysis.globals.clone(),
        global_index: analysis
            .globals
            .iter()
            .enumerate()
            .map(|(i, g)| (g.to_ascii_lowercase(), i))
            .collect(),
        errors: Vec::new(),
        trace: options.trace,
        source: &source,
    };

    let module = Cx {
        scope: MODULE_SCOPE,
        proc: None,
        class: None,
        top: true,
    };
    let mut prologue: Vec<Op> = (0..analysis.globals.len())
        .map(|i| Op {
            kind: OpKind::Declare {
                place: Place::Global(i),
                array: None,
            },
            span: Span::default(),
        })
        .collect();
    c.array_declarations(&module, &program.body, &mut prologue);
    let body = c.block(&module, &program.body);

    let mut decls: Vec<Option<&ProcDecl>> = vec![None; analysis.procs.len()];
    for stmt in &program.body {
        match &stmt.kind {
            StmtKind::Procedure(decl) => {
                if let Some(id) = analysis.proc_id(decl) {
                    decls[id] = Some(decl);
                }
            }
            StmtKind::Class(class) => {
                for member in &class.members {
                    if let ClassMember::Procedure(decl) = member {
                        if let Some(id) = analysis.proc_id(decl) {
                            decls[id] = Some(decl);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    let mut procs = Vec::with_capacity(decls.len());
    for (id, decl) in decls.into_iter().enumerate() {
        let info = &analysis.procs[id];
        let cx = Cx {
            scope: info.scope,
            proc: Some(id),
            class: info.class,
            top: false,
        };
        let (prologue, body) = match decl {
            Some(decl) => {
                let mut prologue = Vec::new();
                c.array_declarations(&cx, &decl.body, &mut prologue);
                (prologue, c.block(&cx, &decl.body))
            }
            None => (Vec::new(), Vec::new()),
        };
        procs.push(CompiledProc {
            name: info.name.clone(),
            kind: info.kind,
            class: info.class,
            params: info.params.clone(),
            locals: analysis.scope(info.scope).slots,
            result: info.result,
            prologue,
            body,
        });
    }
    let classes = c.classes();

    if !c.errors.is_empty() {
        return Err(c.errors);
    }
    let unit = CompiledUnit {
        id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
        name: Arc::clone(&source.name),
        option_explicit: program.option_explicit || options.option_explicit,
        globals: c.globals,
        prologue,
        body,
        procs,
        classes,
        sites: c.sites,
        literal_blocks: source.literal_blocks.clone(),
        mapper: source.mapper.clone(),
    };
    debug!(
        unit = %unit.name,
        procs = unit.procs.len(),
        classes = unit.classes.len(),
        sites = unit.sites.len(),
        "compiled unit"
    );
    Ok(unit)
}

#[derive(Debug, Clone, Copy)]
struct Cx {
    scope: ScopeId,
    proc: Option<usize>,
    class: Option<usize>,
    /// Statements directly in the module body (traced).
    top: bool,
}

/// A resolved name.
enum Name {
    Place(Place),
    Constant(Literal),
    Proc(usize),
    /// The enclosing Function's own name: its result slot, or a recursive
    /// call when given arguments.
    Result { slot: usize, proc: usize },
    Member(usize, String),
    Class,
    Builtin(usize),
    CreateObject,
}

struct Compiler<'a> {
    analysis: &'a Analysis,
    factory: &'a BinderFactory,
    sites: Vec<CallSite>,
    globals: Vec<String>,
    global_index: HashMap<String, usize>,
    errors: Vec<CompileError>,
    trace: bool,
    source: &'a UnitSource,
}

impl Compiler<'_> {
    fn site(&mut self, key: BinderKey) -> usize {
        self.sites.push(self.factory.site(key));
        self.sites.len() - 1
    }

    fn global(&mut self, id: &Ident) -> usize {
        if let Some(&i) = self.global_index.get(&id.key) {
            return i;
        }
        self.globals.push(id.name.clone());
        self.global_index.insert(id.key.clone(), self.globals.len() - 1);
        self.globals.len() - 1
    }

    fn resolve(&mut self, cx: &Cx, id: &Ident) -> Name {
        match self.analysis.resolve(cx.scope, &id.key) {
            Some(Symbol::Global(i)) => Name::Place(Place::Global(*i)),
            Some(Symbol::Local(slot)) => Name::Place(Place::Local(*slot)),
            Some(Symbol::Result(slot)) => match cx.proc {
                Some(proc) => Name::Result { slot: *slot, proc },
                None => Name::Place(Place::Local(*slot)),
            },
            Some(Symbol::Implicit(slot)) => {
                let local = *slot;
                Name::Place(Place::Implicit {
                    global: self.global(id),
                    local,
                })
            }
            Some(Symbol::Constant(lit)) => Name::Constant(lit.clone()),
            Some(Symbol::Procedure(p)) => Name::Proc(*p),
            Some(Symbol::Class(_)) => Name::Class,
            Some(Symbol::Field(f)) => Name::Place(Place::Field(*f)),
            Some(Symbol::Member) => match cx.class {
                Some(class) => Name::Member(class, id.key.clone()),
                None => Name::Class,
            },
            None => {
                if let Some(index) = builtins::lookup(&id.key) {
                    Name::Builtin(index)
                } else if let Some(lit) = builtins::constant(&id.key) {
                    Name::Constant(lit)
                } else if id.is("createobject") {
                    Name::CreateObject
                } else {
                    Name::Place(Place::Global(self.global(id)))
                }
            }
        }
    }

    fn illegal(&mut self, name: &str, span: Span) {
        self.errors.push(CompileError::compiler(
            ErrorCode::IllegalAssignment,
            format!("Illegal assignment: '{name}'"),
            span,
        ));
    }

    // ── Declarations ─────────────────────────────────────────────

    fn array_declarations(&mut self, cx: &Cx, body: &[Stmt], out: &mut Vec<Op>) {
        let mut arrays: Vec<(Ident, Vec<Expr>, Span)> = Vec::new();
        analyzer::for_each_nested(body, &mut |stmt| {
            if let StmtKind::Dim { vars, .. } = &stmt.kind {
                for v in vars {
                    if let Some(bounds) = &v.bounds {
                        arrays.push((v.name.clone(), bounds.clone(), stmt.span));
                    }
                }
            }
        });
        for (name, bounds, span) in arrays {
            let Name::Place(place) = self.resolve(cx, &name) else { continue };
            match self.analysis.const_bounds(cx.scope, &bounds) {
                Ok(bounds) => out.push(Op {
                    kind: OpKind::Declare {
                        place,
                        array: Some(bounds),
                    },
                    span,
                }),
                Err(e) => self.errors.push(e),
            }
        }
    }

    fn classes(&mut self) -> Vec<CompiledClass> {
        let mut out = Vec::with_capacity(self.analysis.classes.len());
        for info in &self.analysis.classes {
            let mut members: HashMap<String, ClassMemberSlots> = info
                .members
                .iter()
                .map(|(key, m)| {
                    (
                        key.clone(),
                        ClassMemberSlots {
                            public: m.public,
                            field: None,
                            method: m.method,
                            get: m.get,
                            let_: m.let_,
                            set: m.set,
                        },
                    )
                })
                .collect();
            let mut fields = Vec::with_capacity(info.fields.len());
            for (index, field) in info.fields.iter().enumerate() {
                members.insert(
                    field.name.to_ascii_lowercase(),
                    ClassMemberSlots {
                        public: field.public,
                        field: Some(index),
                        ..ClassMemberSlots::default()
                    },
                );
                let array = match &field.bounds {
                    Some(bounds) => match self.analysis.const_bounds(info.scope, bounds) {
                        Ok(b) => Some(b),
                        Err(e) => {
                            self.errors.push(e);
                            None
                        }
                    },
                    None => None,
                };
                fields.push(CompiledField {
                    name: field.name.clone(),
                    array,
                });
            }
            out.push(CompiledClass {
                name: info.name.clone(),
                fields,
                members,
                default_member: info.default_member.clone(),
                initialize: info.initialize,
            });
        }
        out
    }

    // ── Statements ───────────────────────────────────────────────

    fn block(&mut self, cx: &Cx, body: &[Stmt]) -> Vec<Op> {
        let guarded = self.analysis.scope(cx.scope).resume_next;
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            let Some(kind) = self.stmt(cx, stmt) else { continue };
            let mut op = Op { kind, span: stmt.span };
            if guarded && !matches!(op.kind, OpKind::OnErrorResumeNext | OpKind::OnErrorGoto0) {
                op = Op {
                    span: op.span,
                    kind: OpKind::Guarded(Box::new(op)),
                };
            }
            if self.trace && cx.top {
                op = Op {
                    span: op.span,
                    kind: OpKind::Traced {
                        point: self.trace_point(stmt.span),
                        op: Box::new(op),
                    },
                };
            }
            out.push(op);
        }
        out
    }

    fn nested(&mut self, cx: &Cx, body: &[Stmt]) -> Vec<Op> {
        let inner = Cx { top: false, ..*cx };
        self.block(&inner, body)
    }

    fn trace_point(&self, span: Span) -> TracePoint {
        let (unit, span) = match self.source.mapper.map(span) {
            Some(doc) => (doc.file, doc.span),
            None => (Arc::clone(&self.source.name), span),
        };
        TracePoint {
            unit,
            start_line: span.start.line,
            start_column: span.start.column,
            end_line: span.end.line,
            end_column: span.end.column,
        }
    }

    fn stmt(&mut self, cx: &Cx, stmt: &Stmt) -> Option<OpKind> {
        Some(match &stmt.kind {
            StmtKind::OptionExplicit
            | StmtKind::Dim { .. }
            | StmtKind::Const { .. }
            | StmtKind::Procedure(_)
            | StmtKind::Class(_) => return None,
            StmtKind::ReDim { preserve, items } => {
                // Several items lower to consecutive ops under one statement.
                let mut ops = Vec::new();
                for item in items {
                    let Name::Place(place) = self.resolve(cx, &item.target) else {
                        self.illegal(&item.target.name, item.target.span);
                        continue;
                    };
                    let bounds = item.bounds.iter().map(|b| self.expr(cx, b)).collect();
                    ops.push(Op {
                        kind: OpKind::ReDim {
                            preserve: *preserve,
                            place,
                            bounds,
                        },
                        span: item.span,
                    });
                }
                return Some(sequence(ops));
            }
            StmtKind::Erase(names) => {
                let mut ops = Vec::new();
                for name in names {
                    match self.resolve(cx, name) {
                        Name::Place(place) => ops.push(Op {
                            kind: OpKind::Erase(place),
                            span: name.span,
                        }),
                        _ => self.illegal(&name.name, name.span),
                    }
                }
                return Some(sequence(ops));
            }
            StmtKind::Assign { target, value, set } => {
                let target = self.target(cx, target, *set)?;
                OpKind::Assign {
                    target,
                    value: self.expr(cx, value),
                    set: *set,
                }
            }
            StmtKind::Call { target, args } => OpKind::Eval(self.call(cx, target, args, true)),
            StmtKind::If { branches, else_body } => OpKind::If {
                branches: branches
                    .iter()
                    .map(|b| (self.expr(cx, &b.condition), self.nested(cx, &b.body)))
                    .collect(),
                else_body: else_body.as_ref().map_or_else(Vec::new, |b| self.nested(cx, b)),
            },
            StmtKind::For {
                var,
                from,
                to,
                step,
                body,
            } => OpKind::For {
                var: self.loop_var(cx, var)?,
                from: self.expr(cx, from),
                to: self.expr(cx, to),
                step: step.as_ref().map(|s| self.expr(cx, s)),
                body: self.nested(cx, body),
            },
            StmtKind::ForEach { var, collection, body } => OpKind::ForEach {
                var: self.loop_var(cx, var)?,
                collection: self.expr(cx, collection),
                body: self.nested(cx, body),
            },
            StmtKind::Do { pre, post, body } => {
                let mut test = |c: &Option<LoopCondition>| {
                    c.as_ref().map(|c| LoopTest {
                        until: c.kind == LoopKind::Until,
                        expr: self.expr(cx, &c.expr),
                    })
                };
                let pre = test(pre);
                let post = test(post);
                OpKind::Loop {
                    pre,
                    post,
                    body: self.nested(cx, body),
                }
            }
            StmtKind::Select {
                selector,
                cases,
                else_body,
            } => OpKind::Select {
                selector: self.expr(cx, selector),
                cases: cases
                    .iter()
                    .map(|c| {
                        let values = c.values.iter().map(|v| self.expr(cx, v)).collect();
                        (values, self.nested(cx, &c.body))
                    })
                    .collect(),
                else_body: else_body.as_ref().map_or_else(Vec::new, |b| self.nested(cx, b)),
            },
            StmtKind::With { object, body } => OpKind::With {
                object: self.expr(cx, object),
                body: self.nested(cx, body),
            },
            StmtKind::Exit(kind) => OpKind::Exit(*kind),
            StmtKind::OnErrorResumeNext => OpKind::OnErrorResumeNext,
            StmtKind::OnErrorGoto0 => OpKind::OnErrorGoto0,
        })
    }

    fn loop_var(&mut self, cx: &Cx, var: &Ident) -> Option<Place> {
        match self.resolve(cx, var) {
            Name::Place(place) => Some(place),
            Name::Result { slot, .. } => Some(Place::Local(slot)),
            _ => {
                self.illegal(&var.name, var.span);
                None
            }
        }
    }

    fn target(&mut self, cx: &Cx, target: &Expr, set: bool) -> Option<Target> {
        match &target.kind {
            ExprKind::Paren(inner) => self.target(cx, inner, set),
            ExprKind::Ident(id) => match self.resolve(cx, id) {
                Name::Place(place) => Some(Target::Place(place)),
                Name::Result { slot, .. } => Some(Target::Place(Place::Local(slot))),
                Name::Member(class, key) => self.property_target(class, &key, set, Vec::new(), id),
                _ => {
                    self.illegal(&id.name, id.span);
                    None
                }
            },
            ExprKind::Member { object, name } => {
                let object = self.expr(cx, object);
                let site = self.site(BinderKey::set_member(&name.name, set));
                Some(Target::Member {
                    object,
                    args: Vec::new(),
                    site,
                })
            }
            ExprKind::Call { target: callee, args } => {
                let values: Vec<Node> = args.iter().map(|a| self.expr(cx, a)).collect();
                match &callee.kind {
                    ExprKind::Ident(id) => match self.resolve(cx, id) {
                        Name::Place(place) => {
                            let site = self.site(BinderKey::SetIndex {
                                argc: values.len(),
                                by_ref: set,
                            });
                            Some(Target::Index {
                                place,
                                indices: values,
                                site,
                            })
                        }
                        Name::Member(class, key) => self.property_target(class, &key, set, values, id),
                        _ => {
                            self.illegal(&id.name, id.span);
                            None
                        }
                    },
                    ExprKind::Member { object, name } => {
                        let object = self.expr(cx, object);
                        let site = self.site(BinderKey::set_member(&name.name, set));
                        Some(Target::Member {
                            object,
                            args: values,
                            site,
                        })
                    }
                    _ => {
                        let target = self.expr(cx, callee);
                        let site = self.site(BinderKey::SetIndex {
                            argc: values.len(),
                            by_ref: set,
                        });
                        Some(Target::Dynamic {
                            target,
                            args: values,
                            site,
                        })
                    }
                }
            }
            _ => {
                self.illegal("expression", target.span);
                None
            }
        }
    }

    fn property_target(&mut self, class: usize, key: &str, set: bool, args: Vec<Node>, id: &Ident) -> Option<Target> {
        let slots = self.analysis.classes[class].members.get(key).copied().unwrap_or_default();
        let proc = if set { slots.set.or(slots.let_) } else { slots.let_.or(slots.set) };
        match proc {
            Some(proc) => Some(Target::Property { proc, args }),
            None => {
                self.illegal(&id.name, id.span);
                None
            }
        }
    }

    // ── Expressions ──────────────────────────────────────────────

    fn expr(&mut self, cx: &Cx, expr: &Expr) -> Node {
        match &expr.kind {
            ExprKind::Literal(lit) => Node::Const(lit.clone()),
            ExprKind::Ident(id) => self.name_value(cx, id, &[]),
            ExprKind::Me => Node::Me,
            ExprKind::WithTarget => Node::WithTarget,
            ExprKind::Member { object, name } => {
                let object = Box::new(self.expr(cx, object));
                let site = self.site(BinderKey::get_member(&name.name));
                Node::GetMember { object, site }
            }
            ExprKind::Call { target, args } => self.call(cx, target, args, false),
            ExprKind::New(class) => match self.analysis.resolve(MODULE_SCOPE, &class.key) {
                Some(Symbol::Class(c)) => Node::NewClass(*c),
                _ => Node::NewHost {
                    name: class.name.clone(),
                    site: self.site(BinderKey::CreateInstance { argc: 0 }),
                },
            },
            ExprKind::Binary { op, left, right } => {
                let left = Box::new(self.expr(cx, left));
                let right = Box::new(self.expr(cx, right));
                let site = self.site(BinderKey::Binary(*op));
                Node::Binary {
                    op: *op,
                    left,
                    right,
                    site,
                }
            }
            ExprKind::Unary { op, operand } => {
                let operand = Box::new(self.expr(cx, operand));
                let site = self.site(BinderKey::Unary(*op));
                Node::Unary { op: *op, operand, site }
            }
            ExprKind::Paren(inner) => self.expr(cx, inner),
        }
    }

    /// A name used as a value, possibly with arguments.
    fn name_value(&mut self, cx: &Cx, id: &Ident, args: &[Expr]) -> Node {
        match self.resolve(cx, id) {
            Name::Place(place) if args.is_empty() => Node::Load(place),
            Name::Place(place) => {
                let args = self.args(cx, args);
                let site = self.site(BinderKey::Invoke { argc: args.len() });
                Node::Invoke {
                    target: Box::new(Node::Load(place)),
                    args,
                    site,
                }
            }
            Name::Result { slot, .. } if args.is_empty() => Node::Load(Place::Local(slot)),
            Name::Result { proc, .. } => Node::CallProc {
                proc,
                args: self.args(cx, args),
                me: cx.class.is_some(),
            },
            Name::Constant(lit) => Node::Const(lit),
            Name::Proc(proc) => Node::CallProc {
                proc,
                args: self.args(cx, args),
                me: false,
            },
            Name::Member(class, key) => {
                let slots = self.analysis.classes[class].members.get(&key).copied().unwrap_or_default();
                match slots.method.or(slots.get) {
                    Some(proc) => Node::CallProc {
                        proc,
                        args: self.args(cx, args),
                        me: true,
                    },
                    None => Node::Fault(RuntimeError::member_not_found(&id.name)),
                }
            }
            Name::Class => Node::Fault(RuntimeError::type_mismatch(&id.name)),
            Name::Builtin(index) => Node::Builtin {
                index,
                args: args.iter().map(|a| self.expr(cx, a)).collect(),
            },
            Name::CreateObject => {
                let args: Vec<Node> = args.iter().map(|a| self.expr(cx, a)).collect();
                let site = self.site(BinderKey::CreateInstance { argc: 0 });
                Node::CreateObject { args, site }
            }
        }
    }

    /// `target(args)` as an expression, or a call statement when
    /// `statement` is set (a bare member name then calls the method).
    fn call(&mut self, cx: &Cx, target: &Expr, args: &[Expr], statement: bool) -> Node {
        match &target.kind {
            ExprKind::Ident(id) => self.name_value(cx, id, args),
            ExprKind::Member { object, name } if statement || !args.is_empty() => {
                let object = Box::new(self.expr(cx, object));
                let args = self.args(cx, args);
                let site = self.site(BinderKey::invoke_member(&name.name, args.len()));
                Node::InvokeMember { object, args, site }
            }
            ExprKind::Paren(inner) if args.is_empty() => self.expr(cx, inner),
            _ if args.is_empty() => self.expr(cx, target),
            _ => {
                let target = Box::new(self.expr(cx, target));
                let args = self.args(cx, args);
                let site = self.site(BinderKey::Invoke { argc: args.len() });
                Node::Invoke { target, args, site }
            }
        }
    }

    fn args(&mut self, cx: &Cx, args: &[Expr]) -> Vec<Arg> {
        args.iter().map(|a| self.arg(cx, a)).collect()
    }

    fn arg(&mut self, cx: &Cx, arg: &Expr) -> Arg {
        match &arg.kind {
            ExprKind::Ident(id) => match self.resolve(cx, id) {
                Name::Place(place) => Arg::Ref(place),
                Name::Result { slot, .. } => Arg::Ref(Place::Local(slot)),
                _ => Arg::Value(self.expr(cx, arg)),
            },
            ExprKind::Call { target, args } => match &target.kind {
                ExprKind::Ident(id) if !args.is_empty() => match self.resolve(cx, id) {
                    Name::Place(array) => {
                        let indices: Vec<Node> = args.iter().map(|a| self.expr(cx, a)).collect();
                        let site = self.site(BinderKey::Invoke { argc: indices.len() });
                        Arg::Element { array, indices, site }
                    }
                    _ => Arg::Value(self.expr(cx, arg)),
                },
                _ => Arg::Value(self.expr(cx, arg)),
            },
            _ => Arg::Value(self.expr(cx, arg)),
        }
    }
}

/// One op standing for several: a single op as is, more as an `If True`
/// with one branch.
fn sequence(mut ops: Vec<Op>) -> OpKind {
    if ops.len() == 1 {
        if let Some(op) = ops.pop() {
            return op.kind;
        }
    }
    OpKind::If {
        branches: vec![(Node::Const(Literal::Bool(true)), ops)],
        else_body: Vec::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::script::{analyzer, lexer, parser};

    fn compile_str(source: &str, options: CompileOptions) -> CompiledUnit {
        let (tokens, _) = lexer::lex(source);
        let (program, errors) = parser::parse(tokens);
        assert!(errors.is_empty(), "{errors:?}");
        let (analysis, errors) = analyzer::analyze(&program);
        assert!(errors.is_empty(), "{errors:?}");
        let name: Arc<str> = Arc::from("test.vbs");
        let source = UnitSource {
            mapper: SourceMapper::identity(Arc::clone(&name), source),
            name,
            literal_blocks: Vec::new(),
        };
        compile(&program, &analysis, source, options, &BinderFactory::new()).unwrap()
    }

    #[test]
    fn globals_are_declared_in_the_prologue() {
        let unit = compile_str("Dim a, b(3)\nc = 1\n", CompileOptions::default());
        assert_eq!(unit.globals, vec!["a", "b", "c"]);
        let declared: Vec<_> = unit
            .prologue
            .iter()
            .map(|op| match &op.kind {
                OpKind::Declare { place, array } => (*place, array.clone()),
                other => panic!("{other:?}"),
            })
            .collect();
        assert_eq!(
            declared,
            vec![
                (Place::Global(0), None),
                (Place::Global(1), None),
                (Place::Global(1), Some(vec![3])),
            ]
        );
        assert_eq!(unit.body.len(), 1);
    }

    #[test]
    fn procedure_calls_bind_directly() {
        let unit = compile_str("Sub Show(x)\nEnd Sub\nShow 1\nShow(2)\n", CompileOptions::default());
        assert_eq!(unit.procs.len(), 1);
        assert_eq!(unit.procs[0].locals, 1);
        for op in &unit.body {
            assert!(matches!(&op.kind, OpKind::Eval(Node::CallProc { proc: 0, args, me: false }) if args.len() == 1));
        }
    }

    #[test]
    fn variables_pass_by_reference() {
        let unit = compile_str("Dim a(2), v\nSub S(x, y, z)\nEnd Sub\nS v, a(1), (v)\n", CompileOptions::default());
        let OpKind::Eval(Node::CallProc { args, .. }) = &unit.body[0].kind else { panic!() };
        assert!(matches!(args[0], Arg::Ref(Place::Global(1))));
        assert!(matches!(args[1], Arg::Element { array: Place::Global(0), .. }));
        assert!(matches!(args[2], Arg::Value(Node::Load(Place::Global(1)))));
    }

    #[test]
    fn resume_next_guards_statements() {
        let unit = compile_str("On Error Resume Next\nx = 1\nOn Error GoTo 0\n", CompileOptions::default());
        assert!(matches!(unit.body[0].kind, OpKind::OnErrorResumeNext));
        assert!(matches!(unit.body[1].kind, OpKind::Guarded(_)));
        assert!(matches!(unit.body[2].kind, OpKind::OnErrorGoto0));
    }

    #[test]
    fn tracing_wraps_top_level_statements_only() {
        let unit = compile_str(
            "If True Then\n  x = 1\nEnd If\n",
            CompileOptions {
                trace: true,
                option_explicit: false,
            },
        );
        let OpKind::Traced { point, op } = &unit.body[0].kind else { panic!() };
        assert_eq!((point.start_line, point.start_column), (1, 1));
        assert_eq!(&*point.unit, "test.vbs");
        let OpKind::If { branches, .. } = &op.kind else { panic!() };
        assert!(matches!(branches[0].1[0].kind, OpKind::Assign { .. }));
    }

    #[test]
    fn identical_operations_share_binders() {
        let factory = BinderFactory::new();
        let (tokens, _) = lexer::lex("x = a + b\ny = c + d\nz = o.Name\n");
        let (program, _) = parser::parse(tokens);
        let (analysis, _) = analyzer::analyze(&program);
        let name: Arc<str> = Arc::from("t");
        let source = UnitSource {
            mapper: SourceMapper::new(),
            name,
            literal_blocks: Vec::new(),
        };
        let unit = compile(&program, &analysis, source, CompileOptions::default(), &factory).unwrap();
        assert_eq!(unit.sites.len(), 3);
        assert!(Arc::ptr_eq(unit.sites[0].binder(), unit.sites[1].binder()));
        assert_eq!(factory.len(), 2);
    }

    #[test]
    fn class_members_resolve_inside_the_class() {
        let source = "Class Counter\n  Private n\n  Public Property Get Value\n    Value = n\n  End Property\n  Public Sub Bump\n    n = n + 1\n    Value\n  End Sub\nEnd Class\n";
        let unit = compile_str(source, CompileOptions::default());
        let class = &unit.classes[0];
        assert_eq!(class.members["n"].field, Some(0));
        assert!(!class.members["n"].public);
        let bump = &unit.procs[class.members["bump"].method.unwrap()];
        assert!(matches!(bump.body[0].kind, OpKind::Assign { target: Target::Place(Place::Field(0)), .. }));
        assert!(matches!(bump.body[1].kind, OpKind::Eval(Node::CallProc { me: true, .. })));
    }
}
