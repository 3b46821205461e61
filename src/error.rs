//! Error types for the compiler backend
//!
//! Two fatal classes are kept strictly apart:
//!
//! - [`CoreError::Internal`]: input that should have been rejected by an
//!   earlier stage but was not, or an invariant violated by one of our own
//!   passes. Signals a contract violation between components, never a user
//!   error.
//! - [`CoreError::Unimplemented`]: a syntactically valid construct this
//!   pipeline does not lower yet. Raised distinctly so staging gaps are
//!   never mistaken for bugs.
//!
//! Parser and analyzer errors are user-facing, since the compilation unit
//! accepts textual IR input directly.

use crate::util::span::Span;
use thiserror::Error;

/// Compiler backend error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Internal consistency failure (collaborator contract or pass defect)
    #[error("internal error: {msg}")]
    Internal { msg: String, span: Option<Span> },

    /// Staging failure: valid construct not lowered yet
    #[error("not yet implemented: {what}")]
    Unimplemented { what: String, span: Option<Span> },

    /// IR surface syntax error
    #[error("parse error at {span}: {msg}")]
    Parse { msg: String, span: Span },

    /// IR scope analysis error
    #[error("analysis error at {span}: {msg}")]
    Analysis { msg: String, span: Span },
}

impl CoreError {
    /// Internal consistency failure without a location
    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal {
            msg: msg.into(),
            span: None,
        }
    }

    /// Internal consistency failure at a location
    pub fn internal_at(msg: impl Into<String>, span: Span) -> Self {
        CoreError::Internal {
            msg: msg.into(),
            span: Some(span),
        }
    }

    /// Staging failure without a location
    pub fn unimplemented(what: impl Into<String>) -> Self {
        CoreError::Unimplemented {
            what: what.into(),
            span: None,
        }
    }

    /// Staging failure at a location
    pub fn unimplemented_at(what: impl Into<String>, span: Span) -> Self {
        CoreError::Unimplemented {
            what: what.into(),
            span: Some(span),
        }
    }

    /// Source location attached to this error, if any
    pub fn span(&self) -> Option<Span> {
        match self {
            CoreError::Internal { span, .. } | CoreError::Unimplemented { span, .. } => *span,
            CoreError::Parse { span, .. } | CoreError::Analysis { span, .. } => Some(*span),
        }
    }
}

/// Result type used throughout the backend
pub type Result<T> = std::result::Result<T, CoreError>;
