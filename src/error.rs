//! Error and result infrastructure shared by every stage of the pipeline.
pub use anyhow::{anyhow, Error, Result};

/// Source location attached to a parse or validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}
impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Span { line, col }
    }
}
impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A structured diagnostic that carries a stable code and an optional span,
/// as opposed to a bare `anyhow::Error` string. Parsers and the validator
/// collect these; the builder itself still reports caller-detectable
/// programming errors as plain `anyhow!` results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diag {
    pub code: DiagCode,
    pub message: String,
    pub span: Option<Span>,
}
impl Diag {
    pub fn new(code: DiagCode, message: impl Into<String>) -> Self {
        Diag {
            code,
            message: message.into(),
            span: None,
        }
    }
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}
impl std::fmt::Display for Diag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(span) = self.span {
            write!(f, "{} at {}: {}", self.code, span, self.message)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagCode {
    InvalidInput,
    Parse,
    Type,
    Unsupported,
    Structural,
}
impl std::fmt::Display for DiagCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            DiagCode::InvalidInput => "invalid-input",
            DiagCode::Parse => "parse-error",
            DiagCode::Type => "type-error",
            DiagCode::Unsupported => "unsupported",
            DiagCode::Structural => "structural",
        };
        f.write_str(s)
    }
}
