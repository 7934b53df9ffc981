//! A VBScript engine: lexer, parser, source mapping for assembled pages,
//! semantic analysis, compilation to a tree IR, dynamic dispatch through
//! cached call-site binders, and an interpreter with VBScript's coercion
//! and error-handling rules.

pub mod host;
pub mod runtime;
pub mod script;
pub mod settings;

pub use host::{Engine, Execution, HostError};
pub use runtime::{ErrObject, HostClass, HostObject, ModuleScope, ScriptException, Value};
pub use script::compiler::CompiledUnit;
pub use script::error::{CompileFailure, Diagnostic};
pub use script::trace::{LogTraceSink, RecordingTraceSink, TraceEvent, TracePoint, TraceSink};
pub use settings::{load_settings, EngineSettings, SettingsError};
