//! Error types for the policy model.

use thiserror::Error;

/// Result type alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors that can occur while building or parsing policy documents.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Invalid policy document: {0}")]
    InvalidDocument(String),

    #[error("Invalid statement #{index}: {message}")]
    InvalidStatement { index: usize, message: String },

    #[error("Invalid principal: {0}")]
    InvalidPrincipal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
