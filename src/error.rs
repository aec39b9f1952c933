//! # Quill Error Module
//!
//! Unified error handling for the runtime core.
//!
//! ## Design
//!
//! Each subsystem keeps its own `thiserror` enum close to the code that
//! raises it (`ExprError` in `expr`, `BrokerError` in `broker`, and so on).
//! This module provides:
//!
//! - [`QuillError`] - the top-level enum wrapping every subsystem error,
//!   used at the crate boundary.
//! - `kind()` - the wire-visible tag carried by every error (`"ParseError"`,
//!   `"BrokerError"`, ...), independent of the Rust type that raised it.
//!
//! Effectful tags with a named result variable never surface these as `Err`:
//! the interpreter captures them into the result record and continues.
//! Statements without a result sink propagate [`QuillError::Render`].

use thiserror::Error;

/// Top-level error type for the Quill runtime core.
#[derive(Error, Debug)]
pub enum QuillError {
    /// Malformed XML or unknown tag.
    #[error("Parse error{}: {message}", location_suffix(.line, .column))]
    Parse {
        line: Option<u64>,
        column: Option<u64>,
        message: String,
    },

    /// An AST node failed `validate()`.
    #[error("Validation error at <{node}>: {message}")]
    Validation { node: String, message: String },

    /// Expression compilation or evaluation failure.
    #[error(transparent)]
    Expr(#[from] crate::expr::ExprError),

    /// The interpreter could not produce output for a statement with no
    /// result sink.
    #[error("Render error at <{node}>: {message}")]
    Render { node: String, message: String },

    /// Datasource/database failure that escaped the `QueryResult` capture.
    #[error("Query error: {0}")]
    Query(String),

    /// Broker operation failure.
    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),

    /// Job dispatch or handler failure.
    #[error(transparent)]
    Job(#[from] crate::jobs::JobError),

    /// Agent run failure (iterations exceeded, timed out, LLM unreachable).
    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),

    /// Network or provider HTTP failure.
    #[error(transparent)]
    LlmProvider(#[from] crate::llm::LlmProviderError),

    /// Persistence adapter failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Knowledge base failure.
    #[error(transparent)]
    Knowledge(#[from] crate::knowledge::KnowledgeError),

    /// IO error (file not found, permission denied, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

fn location_suffix(line: &Option<u64>, column: &Option<u64>) -> String {
    match (line, column) {
        (Some(l), Some(c)) => format!(" at {}:{}", l, c),
        (Some(l), None) => format!(" at line {}", l),
        _ => String::new(),
    }
}

impl QuillError {
    /// Build a parse error without location information.
    pub fn parse(message: impl Into<String>) -> Self {
        QuillError::Parse {
            line: None,
            column: None,
            message: message.into(),
        }
    }

    /// Build a parse error with a resolved line/column position.
    pub fn parse_at(message: impl Into<String>, line: u64, column: u64) -> Self {
        QuillError::Parse {
            line: Some(line),
            column: Some(column),
            message: message.into(),
        }
    }

    /// Build a render error tagged with the offending node name.
    pub fn render(node: impl Into<String>, message: impl Into<String>) -> Self {
        QuillError::Render {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Build a generic error with a message.
    pub fn other(message: impl Into<String>) -> Self {
        QuillError::Other(message.into())
    }

    /// The wire-visible error kind tag, independent of the Rust type
    /// carrying it.
    pub fn kind(&self) -> &'static str {
        match self {
            QuillError::Parse { .. } => "ParseError",
            QuillError::Validation { .. } => "ValidationError",
            QuillError::Expr(e) => e.kind(),
            QuillError::Render { .. } => "RenderError",
            QuillError::Query(_) => "QueryError",
            QuillError::Broker(e) => e.kind(),
            QuillError::Job(_) => "JobError",
            QuillError::Agent(_) => "AgentError",
            QuillError::LlmProvider(_) => "LLMProviderError",
            QuillError::Storage(_) => "StorageError",
            QuillError::Knowledge(_) => "KnowledgeError",
            QuillError::Io(_) => "IOError",
            QuillError::Other(_) => "RuntimeError",
        }
    }

    /// The HTML comment emitted into the output stream when a broken
    /// statement has no result sink.
    pub fn html_comment(&self) -> String {
        format!("<!-- {}: {} -->", self.kind(), self)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QuillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_kind() {
        let err = QuillError::parse("unexpected end of document");
        assert_eq!(err.kind(), "ParseError");
        assert!(err.to_string().contains("unexpected end"));
    }

    #[test]
    fn test_parse_error_location() {
        let err = QuillError::parse_at("mismatched close tag", 4, 12);
        assert_eq!(err.to_string(), "Parse error at 4:12: mismatched close tag");
    }

    #[test]
    fn test_render_error_html_comment() {
        let err = QuillError::render("q:mail", "missing recipient");
        assert_eq!(err.kind(), "RenderError");
        let comment = err.html_comment();
        assert!(comment.starts_with("<!-- RenderError:"));
        assert!(comment.ends_with("-->"));
    }

    #[test]
    fn test_expr_error_kinds_pass_through() {
        let err: QuillError = crate::expr::ExprError::Unsafe("import os".into()).into();
        assert_eq!(err.kind(), "UnsafeExpression");

        let err: QuillError = crate::expr::ExprError::UndefinedName("nope".into()).into();
        assert_eq!(err.kind(), "UndefinedName");
    }

    #[test]
    fn test_timeout_kind_from_broker() {
        let err: QuillError = crate::broker::BrokerError::Timeout(500).into();
        assert_eq!(err.kind(), "TimeoutError");
    }
}
