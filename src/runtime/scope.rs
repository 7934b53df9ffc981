//! The module scope: a script's top-level namespace at execution time.
//!
//! The host pre-populates it with objects (`Response`, `WScript`, ...) and
//! reads variables back after execution. Names are case-insensitive and
//! keep the spelling they were first declared with.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use super::dictionary::DictionaryClass;
use super::object::{HostClass, HostObject, ObjectRef};
use super::value::Value;

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    value: Value,
}

pub struct ModuleScope {
    vars: RefCell<IndexMap<String, Slot>>,
    classes: RefCell<HashMap<String, Rc<dyn HostClass>>>,
}

impl Default for ModuleScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleScope {
    /// A scope with the built-in host classes registered.
    pub fn new() -> Self {
        let scope = Self {
            vars: RefCell::new(IndexMap::new()),
            classes: RefCell::new(HashMap::new()),
        };
        scope.register_class(Rc::new(DictionaryClass));
        scope
    }

    /// Declare `name` if absent and return its slot. Slots are never
    /// removed, so indices stay valid.
    pub fn declare(&self, name: &str) -> usize {
        let mut vars = self.vars.borrow_mut();
        let entry = vars.entry(name.to_ascii_lowercase());
        let index = entry.index();
        entry.or_insert_with(|| Slot {
            name: name.to_string(),
            value: Value::Empty,
        });
        index
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.vars.borrow().get_index_of(&name.to_ascii_lowercase())
    }

    pub fn load(&self, slot: usize) -> Value {
        self.vars
            .borrow()
            .get_index(slot)
            .map_or(Value::Empty, |(_, s)| s.value.clone())
    }

    pub fn store(&self, slot: usize, value: Value) {
        if let Some((_, s)) = self.vars.borrow_mut().get_index_mut(slot) {
            s.value = value;
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lookup(name).map(|slot| self.load(slot))
    }

    pub fn set(&self, name: &str, value: Value) {
        let slot = self.declare(name);
        self.store(slot, value);
    }

    /// Bind a host object as a global.
    pub fn add_object(&self, name: &str, object: Rc<dyn HostObject>) {
        self.set(name, Value::Object(ObjectRef::Host(object)));
    }

    /// Names in declaration order, as first spelled.
    pub fn names(&self) -> Vec<String> {
        self.vars.borrow().values().map(|s| s.name.clone()).collect()
    }

    pub fn register_class(&self, class: Rc<dyn HostClass>) {
        self.classes
            .borrow_mut()
            .insert(class.name().to_ascii_lowercase(), class);
    }

    pub fn class(&self, name: &str) -> Option<Rc<dyn HostClass>> {
        self.classes.borrow().get(&name.to_ascii_lowercase()).cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive_and_keep_spelling() {
        let scope = ModuleScope::new();
        scope.set("Total", Value::Long(1));
        assert_eq!(scope.get("TOTAL"), Some(Value::Long(1)));
        let slot = scope.declare("total");
        scope.store(slot, Value::Long(2));
        assert_eq!(scope.get("Total"), Some(Value::Long(2)));
        assert_eq!(scope.names(), vec!["Total".to_string()]);
    }

    #[test]
    fn dictionary_is_registered() {
        let scope = ModuleScope::new();
        assert!(scope.class("scripting.dictionary").is_some());
        assert!(scope.class("Scripting.FileSystemObject").is_none());
    }
}
