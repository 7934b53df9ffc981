#[allow(clippy::module_name_repetitions, clippy::indexing_slicing)]
pub mod array;
#[allow(clippy::too_many_lines, clippy::indexing_slicing)]
pub mod binder;
#[allow(clippy::indexing_slicing)]
pub mod builtins;
pub mod date;
pub mod dictionary;
pub mod err_object;
pub mod error;
pub mod object;
#[allow(clippy::too_many_lines)]
pub mod ops;
pub mod scope;
pub mod value;

pub use array::VbArray;
pub use binder::{BinderFactory, BinderKey, CallSite};
pub use err_object::ErrObject;
pub use error::{Fault, FaultKind, RuntimeError, ScriptException};
pub use object::{HostClass, HostObject, InvokeKind, MemberInfo, MemberKind, ObjectRef, ParamKind};
pub use scope::ModuleScope;
pub use value::{Value, VbType};
