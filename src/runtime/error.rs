//! Runtime faults raised while a compiled unit executes.

use serde::Serialize;

use crate::script::source_map::DocSpan;

/// The class of a runtime fault. Determines the VBScript error number
/// unless the fault came from `Err.Raise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultKind {
    InvalidArgument,
    Overflow,
    SubscriptOutOfRange,
    ArrayLocked,
    DivisionByZero,
    TypeMismatch,
    OutOfStack,
    ObjectNotSet,
    InvalidNull,
    ObjectRequired,
    CannotCreateObject,
    MemberNotFound,
    WrongArgumentCount,
    NotACollection,
    UndefinedVariable,
    IllegalAssignment,
    Raised,
}

impl FaultKind {
    pub fn number(self) -> i32 {
        match self {
            FaultKind::InvalidArgument => 5,
            FaultKind::Overflow => 6,
            FaultKind::SubscriptOutOfRange => 9,
            FaultKind::ArrayLocked => 10,
            FaultKind::DivisionByZero => 11,
            FaultKind::TypeMismatch => 13,
            FaultKind::OutOfStack => 28,
            FaultKind::ObjectNotSet => 91,
            FaultKind::InvalidNull => 94,
            FaultKind::ObjectRequired => 424,
            FaultKind::CannotCreateObject => 429,
            FaultKind::MemberNotFound => 438,
            FaultKind::WrongArgumentCount => 450,
            FaultKind::NotACollection => 451,
            FaultKind::UndefinedVariable => 500,
            FaultKind::IllegalAssignment => 501,
            FaultKind::Raised => 0,
        }
    }

    fn description(self) -> &'static str {
        match self {
            FaultKind::InvalidArgument => "Invalid procedure call or argument",
            FaultKind::Overflow => "Overflow",
            FaultKind::SubscriptOutOfRange => "Subscript out of range",
            FaultKind::ArrayLocked => "This array is fixed or temporarily locked",
            FaultKind::DivisionByZero => "Division by zero",
            FaultKind::TypeMismatch => "Type mismatch",
            FaultKind::OutOfStack => "Out of stack space",
            FaultKind::ObjectNotSet => "Object variable not set",
            FaultKind::InvalidNull => "Invalid use of Null",
            FaultKind::ObjectRequired => "Object required",
            FaultKind::CannotCreateObject => "ActiveX component can't create object",
            FaultKind::MemberNotFound => "Object doesn't support this property or method",
            FaultKind::WrongArgumentCount => "Wrong number of arguments or invalid property assignment",
            FaultKind::NotACollection => "Object not a collection",
            FaultKind::UndefinedVariable => "Variable is undefined",
            FaultKind::IllegalAssignment => "Illegal assignment",
            FaultKind::Raised => "Unknown runtime error",
        }
    }
}

pub const DEFAULT_SOURCE: &str = "Microsoft VBScript runtime error";

/// A catchable runtime fault: what `On Error Resume Next` records into `Err`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: FaultKind,
    pub number: i32,
    pub description: String,
    pub source: String,
    pub help_file: String,
    pub help_context: i32,
}

impl RuntimeError {
    pub fn new(kind: FaultKind) -> Self {
        Self {
            kind,
            number: kind.number(),
            description: kind.description().to_string(),
            source: DEFAULT_SOURCE.to_string(),
            help_file: String::new(),
            help_context: 0,
        }
    }

    /// Fault whose description carries a detail, VBScript style: `Type mismatch: 'CInt'`.
    pub fn with_detail(kind: FaultKind, detail: impl AsRef<str>) -> Self {
        let mut e = Self::new(kind);
        e.description = format!("{}: '{}'", kind.description(), detail.as_ref());
        e
    }

    pub fn type_mismatch(detail: impl AsRef<str>) -> Self {
        Self::with_detail(FaultKind::TypeMismatch, detail)
    }

    pub fn invalid_argument(detail: impl AsRef<str>) -> Self {
        Self::with_detail(FaultKind::InvalidArgument, detail)
    }

    pub fn overflow() -> Self {
        Self::new(FaultKind::Overflow)
    }

    pub fn division_by_zero() -> Self {
        Self::new(FaultKind::DivisionByZero)
    }

    pub fn subscript_out_of_range() -> Self {
        Self::new(FaultKind::SubscriptOutOfRange)
    }

    pub fn invalid_null() -> Self {
        Self::new(FaultKind::InvalidNull)
    }

    pub fn object_required(detail: impl AsRef<str>) -> Self {
        Self::with_detail(FaultKind::ObjectRequired, detail)
    }

    pub fn member_not_found(name: impl AsRef<str>) -> Self {
        Self::with_detail(FaultKind::MemberNotFound, name)
    }

    pub fn wrong_argument_count(name: impl AsRef<str>) -> Self {
        Self::with_detail(FaultKind::WrongArgumentCount, name)
    }

    pub fn undefined_variable(name: impl AsRef<str>) -> Self {
        Self::with_detail(FaultKind::UndefinedVariable, name)
    }

    /// An `Err.Raise` from script or a host-defined error number.
    pub fn raised(number: i32, source: Option<String>, description: Option<String>) -> Self {
        let known = [
            FaultKind::InvalidArgument,
            FaultKind::Overflow,
            FaultKind::SubscriptOutOfRange,
            FaultKind::DivisionByZero,
            FaultKind::TypeMismatch,
            FaultKind::ObjectRequired,
            FaultKind::MemberNotFound,
        ]
        .into_iter()
        .find(|k| k.number() == number);
        let description = description.unwrap_or_else(|| {
            known.map_or_else(|| FaultKind::Raised.description().to_string(), |k| k.description().to_string())
        });
        Self {
            kind: FaultKind::Raised,
            number,
            description,
            source: source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            help_file: String::new(),
            help_context: 0,
        }
    }
}

// `source` names the raising component, not an error chain.
impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for RuntimeError {}

/// Anything that can stop a statement from completing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error(transparent)]
    Script(#[from] RuntimeError),
    /// Host-initiated termination (timeout, shutdown). Never intercepted by
    /// `On Error Resume Next`.
    #[error("script execution aborted: {reason}")]
    Aborted { reason: String },
}

impl Fault {
    pub fn is_catchable(&self) -> bool {
        matches!(self, Fault::Script(_))
    }
}

/// An uncaught fault as seen by the hosting caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptException {
    pub number: i32,
    pub description: String,
    pub source: String,
    /// Mapped original position, rendered as `file, line L, column C`.
    pub source_location: String,
    pub help_file: String,
    pub help_context: i32,
    pub aborted: bool,
    #[serde(skip)]
    pub location: Option<DocSpan>,
}

impl std::fmt::Display for ScriptException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (error {})", self.source_location, self.description, self.number)
    }
}

impl std::error::Error for ScriptException {}

impl ScriptException {
    pub fn from_fault(fault: Fault, location: Option<DocSpan>, unit_name: &str) -> Self {
        let source_location = location
            .as_ref()
            .map_or_else(|| unit_name.to_string(), ToString::to_string);
        match fault {
            Fault::Script(e) => Self {
                number: e.number,
                description: e.description,
                source: e.source,
                source_location,
                help_file: e.help_file,
                help_context: e.help_context,
                aborted: false,
                location,
            },
            Fault::Aborted { reason } => Self {
                number: 0,
                description: reason,
                source: String::new(),
                source_location,
                help_file: String::new(),
                help_context: 0,
                aborted: true,
                location,
            },
        }
    }
}
