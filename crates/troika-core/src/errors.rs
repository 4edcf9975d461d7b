//! Core error types shared across the workspace.

use thiserror::Error;

/// Errors raised by foundation-level operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An expression failed to parse or evaluate.
    #[error("expression error: {0}")]
    Expression(String),

    /// A JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tool or protocol schema was structurally invalid.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

/// Convenience alias for core results.
pub type Result<T> = std::result::Result<T, CoreError>;
