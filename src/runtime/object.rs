//! Objects visible to script code: host objects supplied by the embedding
//! application and instances of script-defined classes.

use std::any::TypeId;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use super::error::RuntimeError;
use super::value::{Value, VbType};
use crate::script::compiler::CompiledUnit;

/// How a member is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Method,
    PropertyGet,
    /// Plain assignment; the value is the last argument.
    PropertyPut,
    /// `Set` assignment; the value is the last argument.
    PropertyPutRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Property,
    ReadOnlyProperty,
}

/// What a parameter accepts. Drives overload resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A Variant: accepts anything as an exact match.
    Any,
    /// A primitive of the given type; convertible primitives match inexactly.
    Typed(VbType),
    Object,
    Array,
    /// A type value: a type-model object matches exactly, a type name string
    /// inexactly.
    TypeValue,
}

/// One overload of a host member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: &'static str,
    pub kind: MemberKind,
    pub params: &'static [ParamKind],
}

impl MemberInfo {
    pub const fn method(name: &'static str, params: &'static [ParamKind]) -> Self {
        Self {
            name,
            kind: MemberKind::Method,
            params,
        }
    }

    pub const fn property(name: &'static str, params: &'static [ParamKind]) -> Self {
        Self {
            name,
            kind: MemberKind::Property,
            params,
        }
    }

    pub const fn read_only(name: &'static str, params: &'static [ParamKind]) -> Self {
        Self {
            name,
            kind: MemberKind::ReadOnlyProperty,
            params,
        }
    }

    /// Number of arguments this overload takes for the given access kind.
    pub fn arity(&self, kind: InvokeKind) -> usize {
        match kind {
            InvokeKind::PropertyPut | InvokeKind::PropertyPutRef => self.params.len() + 1,
            InvokeKind::Method | InvokeKind::PropertyGet => self.params.len(),
        }
    }

    pub fn supports(&self, kind: InvokeKind) -> bool {
        match (self.kind, kind) {
            (MemberKind::Method, InvokeKind::Method | InvokeKind::PropertyGet) => true,
            (MemberKind::Method, _) => false,
            (MemberKind::ReadOnlyProperty, InvokeKind::PropertyPut | InvokeKind::PropertyPutRef) => false,
            (MemberKind::Property | MemberKind::ReadOnlyProperty, _) => true,
        }
    }
}

/// An IDispatch-like object supplied by the host.
///
/// Members are addressed by their index in `members()`. Overloads are
/// separate entries sharing a name; the binder picks one per call.
pub trait HostObject: 'static {
    fn type_name(&self) -> &str;

    /// Identity of the concrete type; cached dispatch rules are guarded on it.
    fn type_key(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    fn members(&self) -> &[MemberInfo];

    fn invoke(&self, member: usize, kind: InvokeKind, args: &[Value]) -> Result<Value, RuntimeError>;

    /// Name of the default member (`obj(1)`, `x = obj`), if any.
    fn default_member(&self) -> Option<&str> {
        None
    }

    /// Items for `For Each`. `None` when the object is not a collection.
    fn enumerate(&self) -> Option<Result<Vec<Value>, RuntimeError>> {
        None
    }

    /// `Some(type name)` when this object stands for a type rather than an
    /// instance.
    fn as_type_model(&self) -> Option<&str> {
        None
    }
}

/// Resolve the parameterless default member of a host object.
pub fn host_default_value(obj: &dyn HostObject) -> Option<Result<Value, RuntimeError>> {
    let name = obj.default_member()?;
    let index = obj
        .members()
        .iter()
        .position(|m| m.name.eq_ignore_ascii_case(name) && m.params.is_empty())?;
    Some(obj.invoke(index, InvokeKind::PropertyGet, &[]))
}

/// A factory for `New` / `CreateObject`.
pub trait HostClass {
    /// Registered name, e.g. `Scripting.Dictionary`.
    fn name(&self) -> &str;

    fn constructors(&self) -> &[MemberInfo] {
        const DEFAULT: [MemberInfo; 1] = [MemberInfo::method("new", &[])];
        &DEFAULT
    }

    fn create(&self, constructor: usize, args: &[Value]) -> Result<Value, RuntimeError>;
}

/// An instance of a script-defined `Class`.
pub struct Instance {
    pub unit: Arc<CompiledUnit>,
    pub class: usize,
    pub fields: RefCell<Vec<Value>>,
}

impl Instance {
    pub fn class_name(&self) -> &str {
        self.unit
            .classes
            .get(self.class)
            .map_or("Object", |c| c.name.as_str())
    }
}

#[derive(Clone)]
pub enum ObjectRef {
    Instance(Rc<Instance>),
    Host(Rc<dyn HostObject>),
}

impl ObjectRef {
    pub fn host(obj: impl HostObject) -> Self {
        ObjectRef::Host(Rc::new(obj))
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        match (self, other) {
            (ObjectRef::Instance(a), ObjectRef::Instance(b)) => Rc::ptr_eq(a, b),
            (ObjectRef::Host(a), ObjectRef::Host(b)) => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
            _ => false,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            ObjectRef::Instance(i) => i.class_name().to_string(),
            ObjectRef::Host(h) => h.type_name().to_string(),
        }
    }
}

/// A value standing for a host type, passed where a member expects a type.
pub struct TypeModel {
    name: String,
}

impl TypeModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl HostObject for TypeModel {
    fn type_name(&self) -> &str {
        "TypeModel"
    }

    fn members(&self) -> &[MemberInfo] {
        const MEMBERS: [MemberInfo; 1] = [MemberInfo::read_only("Name", &[])];
        &MEMBERS
    }

    fn invoke(&self, _member: usize, _kind: InvokeKind, _args: &[Value]) -> Result<Value, RuntimeError> {
        Ok(Value::from(self.name.as_str()))
    }

    fn default_member(&self) -> Option<&str> {
        Some("Name")
    }

    fn as_type_model(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Whether `arg` can be passed to a parameter of kind `param`.
/// `Some(true)` for an exact match, `Some(false)` for a converting match.
pub fn assignable(param: ParamKind, arg: &Value) -> Option<bool> {
    match param {
        ParamKind::Any => Some(true),
        ParamKind::Object => arg.is_object().then_some(true),
        ParamKind::Array => matches!(arg, Value::Array(_)).then_some(true),
        ParamKind::TypeValue => match arg {
            Value::Object(ObjectRef::Host(h)) if h.as_type_model().is_some() => Some(true),
            Value::String(_) => Some(false),
            _ => None,
        },
        ParamKind::Typed(t) => {
            let actual = arg.vb_type();
            if actual == t {
                Some(true)
            } else if actual.is_primitive() || actual == VbType::Empty {
                Some(false)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Wrapper(Value);

    impl HostObject for Wrapper {
        fn type_name(&self) -> &str {
            "Wrapper"
        }

        fn members(&self) -> &[MemberInfo] {
            const MEMBERS: [MemberInfo; 1] = [MemberInfo::read_only("Value", &[])];
            &MEMBERS
        }

        fn invoke(&self, _member: usize, _kind: InvokeKind, _args: &[Value]) -> Result<Value, RuntimeError> {
            Ok(self.0.clone())
        }

        fn default_member(&self) -> Option<&str> {
            Some("value")
        }
    }

    #[test]
    fn default_value_unwraps_recursively() {
        let inner = Value::Object(ObjectRef::host(Wrapper(Value::Long(7))));
        let outer = Value::Object(ObjectRef::host(Wrapper(inner)));
        assert_eq!(super::super::value::unwrap_default(&outer).unwrap(), Value::Long(7));
    }

    #[test]
    fn identity_is_by_pointer() {
        let a = ObjectRef::host(Wrapper(Value::Empty));
        let b = a.clone();
        let c = ObjectRef::host(Wrapper(Value::Empty));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn assignability() {
        let model = Value::Object(ObjectRef::host(TypeModel::new("Widget")));
        assert_eq!(assignable(ParamKind::TypeValue, &model), Some(true));
        assert_eq!(assignable(ParamKind::TypeValue, &Value::from("Widget")), Some(false));
        assert_eq!(assignable(ParamKind::TypeValue, &Value::Long(1)), None);
        assert_eq!(assignable(ParamKind::Typed(VbType::Long), &Value::Long(1)), Some(true));
        assert_eq!(assignable(ParamKind::Typed(VbType::Long), &Value::from("1")), Some(false));
        assert_eq!(assignable(ParamKind::Typed(VbType::Long), &model), None);
        assert_eq!(assignable(ParamKind::Object, &Value::Nothing), Some(true));
    }

    #[test]
    fn put_arity_counts_value() {
        let item = MemberInfo::property("Item", &[ParamKind::Any]);
        assert_eq!(item.arity(InvokeKind::PropertyGet), 1);
        assert_eq!(item.arity(InvokeKind::PropertyPut), 2);
        assert!(!MemberInfo::read_only("Count", &[]).supports(InvokeKind::PropertyPut));
        assert!(!MemberInfo::method("Add", &[]).supports(InvokeKind::PropertyPut));
    }
}
