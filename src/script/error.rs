use serde::Serialize;

use super::ast::Span;
use super::source_map::SourceMapper;

/// A compilation error with source location (in generated-buffer coordinates).
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub kind: ErrorKind,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Semantic,
    Compiler,
}

/// VBScript compilation error numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    SyntaxError,
    ExpectedLParen,
    ExpectedRParen,
    ExpectedIdentifier,
    ExpectedEquals,
    ExpectedIf,
    ExpectedTo,
    ExpectedEnd,
    ExpectedFunction,
    ExpectedSub,
    ExpectedThen,
    ExpectedWend,
    ExpectedLoop,
    ExpectedNext,
    ExpectedCase,
    ExpectedSelect,
    ExpectedExpression,
    ExpectedStatement,
    ExpectedEndOfStatement,
    ExpectedInteger,
    InvalidNumber,
    InvalidCharacter,
    UnterminatedString,
    InvalidMe,
    InvalidExit,
    InvalidForVariable,
    NameRedefined,
    ExpectedLiteral,
    ExpectedIn,
    ExpectedClass,
    ExpectedProperty,
    ExpectedWith,
    MultipleDefaults,
    IllegalAssignment,
    IncludeNotFound,
    IncludeCycle,
    TooManyItems,
}

impl ErrorCode {
    /// The numeric code VBScript reports for this error.
    pub fn number(self) -> u32 {
        match self {
            ErrorCode::SyntaxError => 1002,
            ErrorCode::ExpectedLParen => 1005,
            ErrorCode::ExpectedRParen => 1006,
            ErrorCode::ExpectedIdentifier => 1010,
            ErrorCode::ExpectedEquals => 1011,
            ErrorCode::ExpectedIf => 1012,
            ErrorCode::ExpectedTo => 1013,
            ErrorCode::ExpectedEnd => 1014,
            ErrorCode::ExpectedFunction => 1015,
            ErrorCode::ExpectedSub => 1016,
            ErrorCode::ExpectedThen => 1017,
            ErrorCode::ExpectedWend => 1018,
            ErrorCode::ExpectedLoop => 1019,
            ErrorCode::ExpectedNext => 1020,
            ErrorCode::ExpectedCase => 1021,
            ErrorCode::ExpectedSelect => 1022,
            ErrorCode::ExpectedExpression => 1023,
            ErrorCode::ExpectedStatement => 1024,
            ErrorCode::ExpectedEndOfStatement => 1025,
            ErrorCode::ExpectedInteger => 1026,
            ErrorCode::InvalidNumber => 1031,
            ErrorCode::InvalidCharacter => 1032,
            ErrorCode::UnterminatedString => 1033,
            ErrorCode::InvalidMe => 1037,
            ErrorCode::InvalidExit => 1039,
            ErrorCode::InvalidForVariable => 1040,
            ErrorCode::NameRedefined => 1041,
            ErrorCode::ExpectedLiteral => 1045,
            ErrorCode::ExpectedIn => 1046,
            ErrorCode::ExpectedClass => 1047,
            ErrorCode::ExpectedProperty => 1050,
            ErrorCode::ExpectedWith => 1029,
            ErrorCode::MultipleDefaults => 1052,
            ErrorCode::IllegalAssignment => 1048,
            ErrorCode::IncludeNotFound => 1060,
            ErrorCode::IncludeCycle => 1061,
            ErrorCode::TooManyItems => 1062,
        }
    }
}

impl CompileError {
    pub fn lexer(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Lexer,
            code,
        }
    }

    pub fn parser(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Parser,
            code,
        }
    }

    pub fn semantic(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Semantic,
            code,
        }
    }

    pub fn compiler(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Compiler,
            code,
        }
    }

    /// Format the error with its generated-buffer position.
    pub fn format_with_source(&self) -> String {
        format!(
            "[{}] line {}:{}: {} ({})",
            match self.kind {
                ErrorKind::Lexer => "lexer",
                ErrorKind::Parser => "parser",
                ErrorKind::Semantic => "semantic",
                ErrorKind::Compiler => "compiler",
            },
            self.span.start.line,
            self.span.start.column,
            self.message,
            self.code.number(),
        )
    }

    /// Resolve this error to original-file coordinates.
    pub fn to_diagnostic(&self, mapper: &SourceMapper, fallback_file: &str) -> Diagnostic {
        let (file, line, column) = match mapper.map(self.span) {
            Some(doc) => (doc.file.to_string(), doc.span.start.line, doc.span.start.column),
            None => (fallback_file.to_string(), self.span.start.line, self.span.start.column),
        };
        Diagnostic {
            file,
            line,
            column,
            code: self.code.number(),
            kind: self.kind,
            description: self.message.clone(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// One row of the compile-error table a host renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub code: u32,
    pub kind: ErrorKind,
    pub description: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({},{}): error {}: {}",
            self.file, self.line, self.column, self.code, self.description
        )
    }
}

/// Aggregate compiler exception: every diagnostic from one compile.
#[derive(Debug, Clone, thiserror::Error)]
#[error("compilation failed with {} error(s)", .diagnostics.len())]
pub struct CompileFailure {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileFailure {
    pub fn from_errors(errors: &[CompileError], mapper: &SourceMapper, file: &str) -> Self {
        Self {
            diagnostics: errors.iter().map(|e| e.to_diagnostic(mapper, file)).collect(),
        }
    }
}
