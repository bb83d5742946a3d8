//! Parser error types.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// Error type for env file parsing failures.
#[derive(Debug, Error, Diagnostic)]
#[error("Parse error on line {line}: {message}")]
#[diagnostic(code(palisade::envfile::syntax))]
pub struct ParseError {
    pub message: String,

    /// One-based line number.
    pub line: usize,

    #[source_code]
    pub src: String,

    #[label("here")]
    pub span: Option<SourceSpan>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, src: &str, offset: usize) -> Self {
        let line = src[..offset.min(src.len())].matches('\n').count() + 1;
        Self {
            message: message.into(),
            line,
            src: src.to_string(),
            span: Some(SourceSpan::from(offset..offset + 1)),
        }
    }

    pub fn eof(src: &str) -> Self {
        Self {
            message: "Unexpected end of file".to_string(),
            line: src.lines().count().max(1),
            src: src.to_string(),
            span: Some(SourceSpan::from(src.len().saturating_sub(1)..src.len())),
        }
    }
}
