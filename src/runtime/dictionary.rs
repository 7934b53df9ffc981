//! `Scripting.Dictionary`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use super::array::VbArray;
use super::error::RuntimeError;
use super::object::{HostClass, HostObject, InvokeKind, MemberInfo, ObjectRef, ParamKind};
use super::value::{self, Value};

const KEY_EXISTS: i32 = 457;
const ELEMENT_NOT_FOUND: i32 = 32_811;

const ANY: &[ParamKind] = &[ParamKind::Any];
const ANY2: &[ParamKind] = &[ParamKind::Any, ParamKind::Any];

const MEMBERS: [MemberInfo; 9] = [
    MemberInfo::method("Add", ANY2),
    MemberInfo::property("Item", ANY),
    MemberInfo::method("Exists", ANY),
    MemberInfo::method("Remove", ANY),
    MemberInfo::method("RemoveAll", &[]),
    MemberInfo::method("Keys", &[]),
    MemberInfo::method("Items", &[]),
    MemberInfo::read_only("Count", &[]),
    MemberInfo::property("CompareMode", &[]),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DictKey {
    Empty,
    Null,
    Bool(bool),
    Number(u64),
    Text(String),
    Object(usize),
}

#[derive(Default)]
pub struct Dictionary {
    entries: RefCell<IndexMap<DictKey, (Value, Value)>>,
    /// 0 = binary (case-sensitive), 1 = text.
    compare_mode: Cell<i32>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, key: &Value) -> Result<DictKey, RuntimeError> {
        Ok(match key {
            Value::Empty => DictKey::Empty,
            Value::Null => DictKey::Null,
            Value::Boolean(b) => DictKey::Bool(*b),
            Value::String(s) if self.compare_mode.get() == 0 => DictKey::Text(s.to_string()),
            Value::String(s) => DictKey::Text(s.to_lowercase()),
            Value::Object(o) => DictKey::Object(match o {
                ObjectRef::Instance(i) => Rc::as_ptr(i) as *const () as usize,
                ObjectRef::Host(h) => Rc::as_ptr(h) as *const () as usize,
            }),
            Value::Nothing => DictKey::Object(0),
            Value::Array(_) => return Err(RuntimeError::type_mismatch("Dictionary key")),
            other => {
                let n = value::to_f64(other)?;
                // 0.0 and -0.0 are the same key
                DictKey::Number(if n == 0.0 { 0 } else { n.to_bits() })
            }
        })
    }

    fn arg<'a>(args: &'a [Value], i: usize) -> Result<&'a Value, RuntimeError> {
        args.get(i).ok_or_else(|| RuntimeError::wrong_argument_count("Dictionary"))
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl HostObject for Dictionary {
    fn type_name(&self) -> &str {
        "Dictionary"
    }

    fn members(&self) -> &[MemberInfo] {
        &MEMBERS
    }

    fn invoke(&self, member: usize, kind: InvokeKind, args: &[Value]) -> Result<Value, RuntimeError> {
        let put = matches!(kind, InvokeKind::PropertyPut | InvokeKind::PropertyPutRef);
        match (MEMBERS.get(member).map(|m| m.name), put) {
            (Some("Add"), _) => {
                let key = Self::arg(args, 0)?;
                let k = self.key(key)?;
                let mut entries = self.entries.borrow_mut();
                if entries.contains_key(&k) {
                    return Err(RuntimeError::raised(
                        KEY_EXISTS,
                        None,
                        Some("This key is already associated with an element of this collection".into()),
                    ));
                }
                entries.insert(k, (key.clone(), Self::arg(args, 1)?.clone()));
                Ok(Value::Empty)
            }
            (Some("Item"), false) => {
                let key = Self::arg(args, 0)?;
                let k = self.key(key)?;
                let mut entries = self.entries.borrow_mut();
                // Reading a missing key adds it.
                let entry = entries.entry(k).or_insert_with(|| (key.clone(), Value::Empty));
                Ok(entry.1.clone())
            }
            (Some("Item"), true) => {
                let key = Self::arg(args, 0)?;
                let k = self.key(key)?;
                let item = Self::arg(args, 1)?.clone();
                let mut entries = self.entries.borrow_mut();
                match entries.get_mut(&k) {
                    Some(slot) => slot.1 = item,
                    None => {
                        entries.insert(k, (key.clone(), item));
                    }
                }
                Ok(Value::Empty)
            }
            (Some("Exists"), _) => {
                let k = self.key(Self::arg(args, 0)?)?;
                Ok(Value::Boolean(self.entries.borrow().contains_key(&k)))
            }
            (Some("Remove"), _) => {
                let k = self.key(Self::arg(args, 0)?)?;
                match self.entries.borrow_mut().shift_remove(&k) {
                    Some(_) => Ok(Value::Empty),
                    None => Err(RuntimeError::raised(ELEMENT_NOT_FOUND, None, Some("Element not found".into()))),
                }
            }
            (Some("RemoveAll"), _) => {
                self.entries.borrow_mut().clear();
                Ok(Value::Empty)
            }
            (Some("Keys"), _) => Ok(Value::array(VbArray::from_vec(
                self.entries.borrow().values().map(|(k, _)| k.clone()).collect(),
            ))),
            (Some("Items"), _) => Ok(Value::array(VbArray::from_vec(
                self.entries.borrow().values().map(|(_, v)| v.clone()).collect(),
            ))),
            (Some("Count"), _) => Ok(value::integral(self.len() as i64, false)),
            (Some("CompareMode"), false) => Ok(Value::Long(self.compare_mode.get())),
            (Some("CompareMode"), true) => {
                if !self.is_empty() {
                    return Err(RuntimeError::invalid_argument("CompareMode"));
                }
                self.compare_mode.set(value::to_i32(Self::arg(args, 0)?)?);
                Ok(Value::Empty)
            }
            _ => Err(RuntimeError::member_not_found(format!("Dictionary member {member}"))),
        }
    }

    fn default_member(&self) -> Option<&str> {
        Some("Item")
    }

    fn enumerate(&self) -> Option<Result<Vec<Value>, RuntimeError>> {
        Some(Ok(self.entries.borrow().values().map(|(k, _)| k.clone()).collect()))
    }
}

/// Factory registered as `Scripting.Dictionary`.
pub struct DictionaryClass;

impl HostClass for DictionaryClass {
    fn name(&self) -> &str {
        "Scripting.Dictionary"
    }

    fn create(&self, _constructor: usize, _args: &[Value]) -> Result<Value, RuntimeError> {
        Ok(Value::Object(ObjectRef::host(Dictionary::new())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn index(name: &str) -> usize {
        MEMBERS.iter().position(|m| m.name == name).unwrap()
    }

    fn call(d: &Dictionary, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        d.invoke(index(name), InvokeKind::Method, args)
    }

    #[test]
    fn add_and_lookup() {
        let d = Dictionary::new();
        call(&d, "Add", &[Value::from("a"), Value::Long(1)]).unwrap();
        call(&d, "Add", &[Value::Long(2), Value::from("two")]).unwrap();
        assert_eq!(d.invoke(index("Item"), InvokeKind::PropertyGet, &[Value::from("a")]).unwrap(), Value::Long(1));
        assert_eq!(d.invoke(index("Item"), InvokeKind::PropertyGet, &[Value::Double(2.0)]).unwrap(), Value::from("two"));
        assert_eq!(call(&d, "Exists", &[Value::from("A")]).unwrap(), Value::Boolean(false));
        assert_eq!(call(&d, "Add", &[Value::from("a"), Value::Empty]).unwrap_err().number, KEY_EXISTS);
    }

    #[test]
    fn text_compare_mode_folds_case() {
        let d = Dictionary::new();
        d.invoke(index("CompareMode"), InvokeKind::PropertyPut, &[Value::Long(1)]).unwrap();
        call(&d, "Add", &[Value::from("Key"), Value::Long(1)]).unwrap();
        assert_eq!(call(&d, "Exists", &[Value::from("KEY")]).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn keys_keep_insertion_order() {
        let d = Dictionary::new();
        for k in ["z", "a", "m"] {
            call(&d, "Add", &[Value::from(k), Value::Empty]).unwrap();
        }
        call(&d, "Remove", &[Value::from("a")]).unwrap();
        let keys = d.enumerate().unwrap().unwrap();
        assert_eq!(keys, vec![Value::from("z"), Value::from("m")]);
        assert_eq!(call(&d, "Remove", &[Value::from("a")]).unwrap_err().number, ELEMENT_NOT_FOUND);
    }

    #[test]
    fn reading_missing_item_adds_it() {
        let d = Dictionary::new();
        d.invoke(index("Item"), InvokeKind::PropertyGet, &[Value::from("x")]).unwrap();
        assert_eq!(d.len(), 1);
    }
}
