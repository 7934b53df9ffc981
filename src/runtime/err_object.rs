//! The `Err` object: one per execution, written by the runtime when a fault
//! is caught under `On Error Resume Next`.

use std::cell::RefCell;

use super::error::RuntimeError;
use super::object::{HostObject, InvokeKind, MemberInfo, ParamKind};
use super::value::{self, Value};

const ANY: ParamKind = ParamKind::Any;
const NUMBER: ParamKind = ParamKind::Typed(super::value::VbType::Long);

const MEMBERS: [MemberInfo; 12] = [
    MemberInfo::read_only("Number", &[]),
    MemberInfo::read_only("Description", &[]),
    MemberInfo::read_only("Source", &[]),
    MemberInfo::read_only("HelpFile", &[]),
    MemberInfo::read_only("HelpContext", &[]),
    MemberInfo::method("Clear", &[]),
    MemberInfo::method("Raise", &[NUMBER]),
    MemberInfo::method("Raise", &[NUMBER, ANY]),
    MemberInfo::method("Raise", &[NUMBER, ANY, ANY]),
    MemberInfo::method("Raise", &[NUMBER, ANY, ANY, ANY]),
    MemberInfo::method("Raise", &[NUMBER, ANY, ANY, ANY, ANY]),
    // `Err` alone reads Number.
    MemberInfo::read_only("Value", &[]),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrState {
    pub number: i32,
    pub description: String,
    pub source: String,
    pub help_file: String,
    pub help_context: i32,
}

#[derive(Debug, Default)]
pub struct ErrObject {
    state: RefCell<ErrState>,
}

impl ErrObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a caught fault into the object.
    pub fn record(&self, error: &RuntimeError) {
        *self.state.borrow_mut() = ErrState {
            number: error.number,
            description: error.description.clone(),
            source: error.source.clone(),
            help_file: error.help_file.clone(),
            help_context: error.help_context,
        };
    }

    pub fn clear(&self) {
        *self.state.borrow_mut() = ErrState::default();
    }

    pub fn number(&self) -> i32 {
        self.state.borrow().number
    }

    pub fn snapshot(&self) -> ErrState {
        self.state.borrow().clone()
    }

    fn raise(args: &[Value]) -> RuntimeError {
        let number = match args.first().map(value::to_i32) {
            Some(Ok(n)) => n,
            Some(Err(e)) => return e,
            None => return RuntimeError::wrong_argument_count("Raise"),
        };
        let text = |i: usize| -> Option<String> {
            args.get(i)
                .filter(|v| !v.is_null_like())
                .and_then(|v| value::to_str(v).ok())
                .map(|s| s.to_string())
        };
        let mut error = RuntimeError::raised(number, text(1), text(2));
        if let Some(file) = text(3) {
            error.help_file = file;
        }
        if let Some(ctx) = args.get(4).and_then(|v| value::to_i32(v).ok()) {
            error.help_context = ctx;
        }
        error
    }
}

impl HostObject for ErrObject {
    fn type_name(&self) -> &str {
        "ErrObject"
    }

    fn members(&self) -> &[MemberInfo] {
        &MEMBERS
    }

    fn invoke(&self, member: usize, _kind: InvokeKind, args: &[Value]) -> Result<Value, RuntimeError> {
        let state = self.snapshot();
        match MEMBERS.get(member).map(|m| m.name) {
            Some("Number" | "Value") => Ok(Value::Long(state.number)),
            Some("Description") => Ok(Value::from(state.description)),
            Some("Source") => Ok(Value::from(state.source)),
            Some("HelpFile") => Ok(Value::from(state.help_file)),
            Some("HelpContext") => Ok(Value::Long(state.help_context)),
            Some("Clear") => {
                self.clear();
                Ok(Value::Empty)
            }
            Some("Raise") => Err(Self::raise(args)),
            _ => Err(RuntimeError::member_not_found("Err")),
        }
    }

    fn default_member(&self) -> Option<&str> {
        Some("Number")
    }
}
