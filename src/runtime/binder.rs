//! Late-bound dispatch.
//!
//! Every dynamic operation in compiled code goes through a [`CallSite`]. A
//! site resolves its operands to an [`Action`] through its [`Binder`], which
//! is shared by all structurally identical sites (same operation, member
//! name, arity). Resolution results are cached twice: the site keeps the
//! last rule it used (L1), the binder keeps every rule it has produced (L2).
//! A rule carries a [`Guard`] over the operand shapes it was bound for; a
//! guard miss re-binds.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::error::RuntimeError;
use super::object::{assignable, HostClass, InvokeKind, MemberInfo, ObjectRef};
use super::ops::{BinaryOp, UnaryOp};
use super::value::{Value, VbType};

/// Rules kept per binder before the oldest is evicted.
const MAX_RULES_PER_BINDER: usize = 32;

/// What distinguishes one binder from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BinderKey {
    GetMember { name: String },
    SetMember { name: String, by_ref: bool },
    InvokeMember { name: String, argc: usize },
    /// Call or index a value: `x(1)`. VBScript syntax does not tell the two
    /// apart.
    Invoke { argc: usize },
    SetIndex { argc: usize, by_ref: bool },
    CreateInstance { argc: usize },
    Binary(BinaryOp),
    Unary(UnaryOp),
}

impl BinderKey {
    fn table(&self) -> usize {
        match self {
            BinderKey::GetMember { .. } => 0,
            BinderKey::SetMember { .. } => 1,
            BinderKey::InvokeMember { .. } => 2,
            BinderKey::Invoke { .. } => 3,
            BinderKey::SetIndex { .. } => 4,
            BinderKey::CreateInstance { .. } => 5,
            BinderKey::Binary(_) => 6,
            BinderKey::Unary(_) => 7,
        }
    }

    pub fn get_member(name: &str) -> Self {
        BinderKey::GetMember {
            name: name.to_ascii_lowercase(),
        }
    }

    pub fn set_member(name: &str, by_ref: bool) -> Self {
        BinderKey::SetMember {
            name: name.to_ascii_lowercase(),
            by_ref,
        }
    }

    pub fn invoke_member(name: &str, argc: usize) -> Self {
        BinderKey::InvokeMember {
            name: name.to_ascii_lowercase(),
            argc,
        }
    }
}

const TABLE_COUNT: usize = 8;

/// The runtime shape of one operand, as far as a guard cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// Position not restricted.
    Any,
    Type(VbType),
    HostType(TypeId),
    ScriptClass { unit: u64, class: usize },
    /// By-value restriction (a class name for construction).
    Named(String),
}

impl Shape {
    pub fn of(value: &Value) -> Shape {
        match value {
            Value::Object(ObjectRef::Host(h)) => Shape::HostType(h.type_key()),
            Value::Object(ObjectRef::Instance(i)) => Shape::ScriptClass {
                unit: i.unit.id,
                class: i.class,
            },
            other => Shape::Type(other.vb_type()),
        }
    }

    fn admits(&self, actual: &Shape) -> bool {
        matches!(self, Shape::Any) || self == actual
    }
}

/// Restriction under which a rule stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    shapes: Vec<Shape>,
}

impl Guard {
    pub fn new(shapes: Vec<Shape>) -> Self {
        Self { shapes }
    }

    pub fn matches(&self, actual: &[Shape]) -> bool {
        self.shapes.len() == actual.len() && self.shapes.iter().zip(actual).all(|(g, a)| g.admits(a))
    }
}

/// What the VM does once a site is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Invoke host member `member`. With `then_index`, the member is read
    /// without arguments and the arguments index its result.
    Host {
        member: usize,
        kind: InvokeKind,
        then_index: bool,
    },
    /// Call procedure `proc` of the instance's unit with `Me` bound.
    ScriptProc { proc: usize, then_index: bool },
    ScriptFieldGet { field: usize, then_index: bool },
    ScriptFieldSet { field: usize },
    ArrayGet,
    ArraySet,
    HostConstruct { constructor: usize },
    Binary(BinaryOp),
    Unary(UnaryOp),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub guard: Guard,
    pub action: Action,
}

/// Result of resolving a site against concrete operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// These operand positions must be reduced to their default values and
    /// the site dispatched again.
    Defer(Vec<usize>),
    Bound(Action),
}

enum Bind {
    Defer(Vec<usize>),
    Rule(Rule),
}

pub struct Binder {
    key: BinderKey,
    rules: Mutex<Vec<Rule>>,
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binder").field("key", &self.key).finish_non_exhaustive()
    }
}

impl Binder {
    fn new(key: BinderKey) -> Self {
        Self {
            key,
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &BinderKey {
        &self.key
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    fn cached(&self, shapes: &[Shape]) -> Option<Rule> {
        self.rules.lock().iter().find(|r| r.guard.matches(shapes)).cloned()
    }

    fn remember(&self, rule: &Rule) {
        let mut rules = self.rules.lock();
        if rules.len() >= MAX_RULES_PER_BINDER {
            rules.remove(0);
        }
        rules.push(rule.clone());
    }

    fn bind(&self, operands: &[Value], shapes: &[Shape]) -> Result<Bind, RuntimeError> {
        match &self.key {
            BinderKey::Binary(op) => Ok(bind_operator(operands, shapes, Action::Binary(*op))),
            BinderKey::Unary(op) => Ok(bind_operator(operands, shapes, Action::Unary(*op))),
            BinderKey::GetMember { name } => bind_member(name, InvokeKind::PropertyGet, operands, shapes),
            BinderKey::InvokeMember { name, .. } => bind_member(name, InvokeKind::Method, operands, shapes),
            BinderKey::SetMember { name, by_ref } => {
                let kind = if *by_ref {
                    InvokeKind::PropertyPutRef
                } else {
                    InvokeKind::PropertyPut
                };
                bind_member(name, kind, operands, shapes)
            }
            BinderKey::Invoke { .. } => bind_index(operands, shapes, None),
            BinderKey::SetIndex { by_ref, .. } => bind_index(operands, shapes, Some(*by_ref)),
            BinderKey::CreateInstance { .. } => Err(RuntimeError::invalid_argument("construction requires a class")),
        }
    }
}

// ── Binding rules ────────────────────────────────────────────────

/// Script instances reach an operator through their default member, which
/// only the VM can call; `Is` compares the references themselves.
fn bind_operator(operands: &[Value], shapes: &[Shape], action: Action) -> Bind {
    let pending: Vec<usize> = operands
        .iter()
        .enumerate()
        .filter(|(_, v)| matches!(v, Value::Object(ObjectRef::Instance(_))))
        .filter(|_| action != Action::Binary(BinaryOp::Is))
        .map(|(i, _)| i)
        .collect();
    if !pending.is_empty() {
        return Bind::Defer(pending);
    }
    Bind::Rule(Rule {
        guard: Guard::new(shapes.to_vec()),
        action,
    })
}

fn require_object<'a>(target: Option<&'a Value>, what: &str) -> Result<&'a ObjectRef, RuntimeError> {
    match target {
        Some(Value::Object(o)) => Ok(o),
        Some(Value::Nothing) => Err(RuntimeError::new(super::error::FaultKind::ObjectNotSet)),
        _ => Err(RuntimeError::object_required(what)),
    }
}

/// Guard on the target shape always; on argument shapes only when the
/// chosen member has overloads that argument types could flip.
fn member_guard(shapes: &[Shape], overloaded: bool) -> Guard {
    let mut restricted = Vec::with_capacity(shapes.len());
    for (i, s) in shapes.iter().enumerate() {
        restricted.push(if i == 0 || overloaded { s.clone() } else { Shape::Any });
    }
    Guard::new(restricted)
}

fn bind_member(name: &str, kind: InvokeKind, operands: &[Value], shapes: &[Shape]) -> Result<Bind, RuntimeError> {
    let target = require_object(operands.first(), name)?;
    let args = operands.get(1..).unwrap_or(&[]);
    match target {
        ObjectRef::Host(host) => {
            let members = host.members();
            let (member, then_index) = match resolve_overload(members, name, kind, args) {
                Ok(m) => (m, false),
                // `obj.list(2)`: read the parameterless member, index the result.
                Err(e) if kind == InvokeKind::Method && !args.is_empty() => {
                    match resolve_overload(members, name, InvokeKind::PropertyGet, &[]) {
                        Ok(m) => (m, true),
                        Err(_) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };
            let overloaded = members.iter().filter(|m| m.name.eq_ignore_ascii_case(name)).count() > 1;
            let kind = if then_index { InvokeKind::PropertyGet } else { kind };
            Ok(Bind::Rule(Rule {
                guard: member_guard(shapes, overloaded),
                action: Action::Host {
                    member,
                    kind,
                    then_index,
                },
            }))
        }
        ObjectRef::Instance(instance) => {
            let class = instance
                .unit
                .classes
                .get(instance.class)
                .ok_or_else(|| RuntimeError::member_not_found(name))?;
            let slots = class
                .members
                .get(name)
                .filter(|s| s.public)
                .ok_or_else(|| RuntimeError::member_not_found(name))?;
            let unit = &instance.unit;
            let arity = |proc: usize| unit.procs.get(proc).map_or(0, |p| p.params.len());
            let argc = args.len();
            let action = match kind {
                InvokeKind::PropertyPut | InvokeKind::PropertyPutRef => {
                    let setter = if kind == InvokeKind::PropertyPutRef {
                        slots.set.or(slots.let_)
                    } else {
                        slots.let_.or(slots.set)
                    };
                    match (setter, slots.field) {
                        (Some(proc), _) if arity(proc) == argc => Action::ScriptProc { proc, then_index: false },
                        (_, Some(field)) if argc == 1 => Action::ScriptFieldSet { field },
                        _ => return Err(RuntimeError::wrong_argument_count(name)),
                    }
                }
                InvokeKind::Method | InvokeKind::PropertyGet => {
                    let callable = slots.method.or(slots.get);
                    match (callable, slots.field) {
                        (Some(proc), _) if arity(proc) == argc => Action::ScriptProc { proc, then_index: false },
                        (Some(proc), _) if arity(proc) == 0 => Action::ScriptProc { proc, then_index: true },
                        (None, Some(field)) => Action::ScriptFieldGet {
                            field,
                            then_index: argc > 0,
                        },
                        _ => return Err(RuntimeError::wrong_argument_count(name)),
                    }
                }
            };
            Ok(Bind::Rule(Rule {
                guard: member_guard(shapes, false),
                action,
            }))
        }
    }
}

/// `put` is `Some(by_ref)` for an index assignment, whose final operand is
/// the assigned value.
fn bind_index(operands: &[Value], shapes: &[Shape], put: Option<bool>) -> Result<Bind, RuntimeError> {
    let target = operands.first().ok_or_else(|| RuntimeError::wrong_argument_count("index"))?;
    let kind = match put {
        None => InvokeKind::PropertyGet,
        Some(false) => InvokeKind::PropertyPut,
        Some(true) => InvokeKind::PropertyPutRef,
    };
    match target {
        Value::Array(_) => Ok(Bind::Rule(Rule {
            guard: member_guard(shapes, false),
            action: if put.is_some() { Action::ArraySet } else { Action::ArrayGet },
        })),
        Value::Object(ObjectRef::Host(host)) => {
            let default = host
                .default_member()
                .ok_or_else(|| RuntimeError::member_not_found(host.type_name()))?
                .to_string();
            let args = operands.get(1..).unwrap_or(&[]);
            let member = resolve_overload(host.members(), &default, kind, args)
                .or_else(|_| resolve_overload(host.members(), &default, InvokeKind::Method, args))?;
            Ok(Bind::Rule(Rule {
                guard: member_guard(shapes, true),
                action: Action::Host {
                    member,
                    kind,
                    then_index: false,
                },
            }))
        }
        Value::Object(ObjectRef::Instance(instance)) => {
            let class = instance
                .unit
                .classes
                .get(instance.class)
                .ok_or_else(|| RuntimeError::member_not_found("default"))?;
            let default = class
                .default_member
                .as_deref()
                .ok_or_else(|| RuntimeError::member_not_found(class.name.as_str()))?;
            let key = default.to_string();
            let kind = if put.is_some() { kind } else { InvokeKind::Method };
            bind_member(&key, kind, operands, shapes)
        }
        Value::Nothing => Err(RuntimeError::new(super::error::FaultKind::ObjectNotSet)),
        _ => Err(RuntimeError::type_mismatch("index")),
    }
}

/// Pick one overload of `name` for `args`.
///
/// Candidates are filtered by access kind and arity, then by per-parameter
/// assignability. Each survivor is ranked by how many arguments need a
/// conversion; the lowest rank wins, ties going to the earlier declaration.
pub fn resolve_overload(
    members: &[MemberInfo],
    name: &str,
    kind: InvokeKind,
    args: &[Value],
) -> Result<usize, RuntimeError> {
    let named: Vec<(usize, &MemberInfo)> = members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.name.eq_ignore_ascii_case(name) && m.supports(kind))
        .collect();
    if named.is_empty() {
        return Err(RuntimeError::member_not_found(name));
    }
    let sized: Vec<(usize, &MemberInfo)> = named.into_iter().filter(|(_, m)| m.arity(kind) == args.len()).collect();
    if sized.is_empty() {
        return Err(RuntimeError::wrong_argument_count(name));
    }
    let mut best: Option<(usize, usize)> = None;
    for (index, member) in sized {
        let mut rank = 0;
        let mut compatible = true;
        // Property puts carry the value last; it is not a declared parameter.
        for (param, arg) in member.params.iter().zip(args) {
            match assignable(*param, arg) {
                Some(true) => {}
                Some(false) => rank += 1,
                None => {
                    compatible = false;
                    break;
                }
            }
        }
        if compatible && best.map_or(true, |(_, r)| rank < r) {
            best = Some((index, rank));
        }
    }
    best.map(|(index, _)| index)
        .ok_or_else(|| RuntimeError::type_mismatch(name))
}

// ── Call sites ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum SiteState {
    Unresolved,
    Resolved(Rule),
}

/// One dynamic operation in compiled code, with its inline cache.
#[derive(Debug)]
pub struct CallSite {
    binder: Arc<Binder>,
    state: Mutex<SiteState>,
}

impl CallSite {
    pub fn new(binder: Arc<Binder>) -> Self {
        Self {
            binder,
            state: Mutex::new(SiteState::Unresolved),
        }
    }

    pub fn binder(&self) -> &Arc<Binder> {
        &self.binder
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), SiteState::Resolved(_))
    }

    /// Resolve against concrete operands: the target (if any) first, then
    /// arguments, then the assigned value for set operations.
    pub fn resolve(&self, operands: &[Value]) -> Result<Resolution, RuntimeError> {
        let shapes: Vec<Shape> = operands.iter().map(Shape::of).collect();
        self.resolve_shapes(&shapes, |b| b.bind(operands, &shapes))
    }

    /// Resolve `New`/`CreateObject` for a host class. The class name is a
    /// by-value restriction.
    pub fn resolve_create(&self, class: &dyn HostClass, args: &[Value]) -> Result<Resolution, RuntimeError> {
        let mut shapes = Vec::with_capacity(args.len() + 1);
        shapes.push(Shape::Named(class.name().to_ascii_lowercase()));
        shapes.extend(args.iter().map(Shape::of));
        self.resolve_shapes(&shapes, |_| {
            let constructor = resolve_overload(class.constructors(), "new", InvokeKind::Method, args)?;
            Ok(Bind::Rule(Rule {
                guard: Guard::new(shapes.clone()),
                action: Action::HostConstruct { constructor },
            }))
        })
    }

    fn resolve_shapes(
        &self,
        shapes: &[Shape],
        bind: impl FnOnce(&Binder) -> Result<Bind, RuntimeError>,
    ) -> Result<Resolution, RuntimeError> {
        if let SiteState::Resolved(rule) = &*self.state.lock() {
            if rule.guard.matches(shapes) {
                return Ok(Resolution::Bound(rule.action));
            }
        }
        let rule = match self.binder.cached(shapes) {
            Some(rule) => rule,
            None => match bind(&self.binder)? {
                Bind::Defer(pending) => return Ok(Resolution::Defer(pending)),
                Bind::Rule(rule) => {
                    trace!(key = ?self.binder.key, action = ?rule.action, "bound call site");
                    self.binder.remember(&rule);
                    rule
                }
            },
        };
        let action = rule.action;
        *self.state.lock() = SiteState::Resolved(rule);
        Ok(Resolution::Bound(action))
    }
}

// ── Factory ──────────────────────────────────────────────────────

/// Canonicalizes binders by key so identical sites share one rule cache.
/// One lock per binder kind.
#[derive(Debug, Default)]
pub struct BinderFactory {
    tables: [Mutex<HashMap<BinderKey, Arc<Binder>>>; TABLE_COUNT],
}

impl BinderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binder(&self, key: BinderKey) -> Arc<Binder> {
        let mut table = self.tables[key.table()].lock();
        Arc::clone(
            table
                .entry(key)
                .or_insert_with_key(|k| Arc::new(Binder::new(k.clone()))),
        )
    }

    pub fn site(&self, key: BinderKey) -> CallSite {
        CallSite::new(self.binder(key))
    }

    /// Number of distinct binders created.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runtime::object::{HostObject, ParamKind, TypeModel};

    struct Widget;

    const WIDGET_MEMBERS: [MemberInfo; 4] = [
        MemberInfo::method("Describe", &[ParamKind::Typed(VbType::String)]),
        MemberInfo::method("Describe", &[ParamKind::Typed(VbType::Long)]),
        MemberInfo::method("Describe", &[ParamKind::TypeValue]),
        MemberInfo::read_only("Size", &[]),
    ];

    impl HostObject for Widget {
        fn type_name(&self) -> &str {
            "Widget"
        }

        fn members(&self) -> &[MemberInfo] {
            &WIDGET_MEMBERS
        }

        fn invoke(&self, member: usize, _kind: InvokeKind, _args: &[Value]) -> Result<Value, RuntimeError> {
            Ok(Value::Long(member as i32))
        }
    }

    fn widget() -> Value {
        Value::Object(ObjectRef::host(Widget))
    }

    #[test]
    fn identical_sites_share_a_binder() {
        let factory = BinderFactory::new();
        let a = factory.binder(BinderKey::get_member("Count"));
        let b = factory.binder(BinderKey::get_member("count"));
        let c = factory.binder(BinderKey::invoke_member("count", 0));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(
            &factory.binder(BinderKey::Binary(BinaryOp::Add)),
            &factory.binder(BinderKey::Binary(BinaryOp::Add)),
        ));
        assert_eq!(factory.len(), 3);
    }

    #[test]
    fn canonicalization_is_thread_safe() {
        let factory = BinderFactory::new();
        let binders: Vec<Arc<Binder>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| factory.binder(BinderKey::invoke_member("write", 1))))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(binders.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn overloads_prefer_exact_matches() {
        let string = resolve_overload(&WIDGET_MEMBERS, "describe", InvokeKind::Method, &[Value::from("x")]).unwrap();
        assert_eq!(string, 0);
        let long = resolve_overload(&WIDGET_MEMBERS, "describe", InvokeKind::Method, &[Value::Long(1)]).unwrap();
        assert_eq!(long, 1);
        // Integer converts to both String and Long; the first declaration wins.
        let int = resolve_overload(&WIDGET_MEMBERS, "describe", InvokeKind::Method, &[Value::Integer(1)]).unwrap();
        assert_eq!(int, 0);
        let model = Value::Object(ObjectRef::host(TypeModel::new("Widget")));
        assert_eq!(resolve_overload(&WIDGET_MEMBERS, "describe", InvokeKind::Method, &[model]).unwrap(), 2);
    }

    #[test]
    fn overload_failures_are_classified() {
        let none = resolve_overload(&WIDGET_MEMBERS, "missing", InvokeKind::Method, &[]).unwrap_err();
        assert_eq!(none.number, 438);
        let arity = resolve_overload(&WIDGET_MEMBERS, "describe", InvokeKind::Method, &[]).unwrap_err();
        assert_eq!(arity.number, 450);
        let put = resolve_overload(&WIDGET_MEMBERS, "size", InvokeKind::PropertyPut, &[Value::Long(1)]).unwrap_err();
        assert_eq!(put.number, 438);
    }

    #[test]
    fn site_caches_and_rebinds_on_guard_miss() {
        let factory = BinderFactory::new();
        let site = factory.site(BinderKey::invoke_member("describe", 1));
        assert!(!site.is_resolved());
        let first = site.resolve(&[widget(), Value::from("a")]).unwrap();
        assert!(site.is_resolved());
        assert_eq!(
            first,
            Resolution::Bound(Action::Host {
                member: 0,
                kind: InvokeKind::Method,
                then_index: false
            })
        );
        let second = site.resolve(&[widget(), Value::Long(2)]).unwrap();
        assert!(matches!(second, Resolution::Bound(Action::Host { member: 1, .. })));
        assert_eq!(site.binder().rule_count(), 2);

        // A second site with the same key starts from the shared rules.
        let other = factory.site(BinderKey::invoke_member("Describe", 1));
        other.resolve(&[widget(), Value::from("b")]).unwrap();
        assert_eq!(other.binder().rule_count(), 2);
    }

    #[test]
    fn operators_bind_by_operand_types() {
        let factory = BinderFactory::new();
        let site = factory.site(BinderKey::Binary(BinaryOp::Add));
        let r = site.resolve(&[Value::Long(1), Value::from("2")]).unwrap();
        assert_eq!(r, Resolution::Bound(Action::Binary(BinaryOp::Add)));
        site.resolve(&[Value::Long(1), Value::Long(2)]).unwrap();
        assert_eq!(site.binder().rule_count(), 2);
    }

    #[test]
    fn indexing_arrays_and_non_objects() {
        let factory = BinderFactory::new();
        let site = factory.site(BinderKey::Invoke { argc: 1 });
        let arr = Value::array(crate::runtime::array::VbArray::from_vec(vec![Value::Long(1)]));
        assert_eq!(site.resolve(&[arr, Value::Long(0)]).unwrap(), Resolution::Bound(Action::ArrayGet));
        assert_eq!(site.resolve(&[Value::Long(3), Value::Long(0)]).unwrap_err().number, 13);
        let member = factory.site(BinderKey::get_member("x"));
        assert_eq!(member.resolve(&[Value::Nothing]).unwrap_err().number, 91);
        assert_eq!(member.resolve(&[Value::Long(1)]).unwrap_err().number, 424);
    }
}
