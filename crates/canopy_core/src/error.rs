//! Error types for the core module.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use canopy_policy::PolicyError;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error category reported to users and mapped to process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ValidationFailure,
    CyclicReference,
    DuplicateId,
    UnknownEnvironment,
    MissingContext,
    InvalidPolicy,
    FlagMutation,
}

impl ErrorKind {
    /// Short code printed alongside every error.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailure => "validation-failure",
            ErrorKind::CyclicReference => "cyclic-reference",
            ErrorKind::DuplicateId => "duplicate-id",
            ErrorKind::UnknownEnvironment => "unknown-environment",
            ErrorKind::MissingContext => "missing-context",
            ErrorKind::InvalidPolicy => "invalid-policy",
            ErrorKind::FlagMutation => "flag-mutation",
        }
    }

    /// Exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::MissingContext => 2,
            ErrorKind::CyclicReference => 3,
            ErrorKind::UnknownEnvironment => 4,
            ErrorKind::ValidationFailure
            | ErrorKind::DuplicateId
            | ErrorKind::InvalidPolicy
            | ErrorKind::FlagMutation => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single problem found during the end-of-construction sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, display_path(&self.path), self.message)
    }
}

/// A context lookup that had no entry in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingContext {
    pub path: String,
    pub key: String,
    pub provider: String,
    pub props: BTreeMap<String, String>,
}

impl fmt::Display for MissingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props: Vec<String> = self
            .props
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(
            f,
            "{}: no cached value for '{}' (provider {}, query {{{}}})",
            display_path(&self.path),
            self.key,
            self.provider,
            props.join(", ")
        )
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<app>"
    } else {
        path
    }
}

fn join_lines<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| format!("  {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors that can occur during construction and synthesis.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{} validation error(s):\n{}", .0.len(), join_lines(.0))]
    Validation(Vec<ValidationFailure>),

    #[error("[validation-failure] {}: {message}", display_path(.path))]
    Invalid { path: String, message: String },

    #[error("[cyclic-reference] {}: {message}", display_path(.path))]
    CyclicReference { path: String, message: String },

    #[error("[duplicate-id] {}: there is already a construct with id '{id}'", display_path(.path))]
    DuplicateId { path: String, id: String },

    #[error("[unknown-environment] {}: {message}", display_path(.path))]
    UnknownEnvironment { path: String, message: String },

    #[error("[missing-context] {} context value(s) missing:\n{}", .0.len(), join_lines(.0))]
    MissingContext(Vec<MissingContext>),

    #[error("[invalid-policy] {}: {message}", display_path(.path))]
    InvalidPolicy { path: String, message: String },

    #[error("[flag-mutation] {}: cannot change feature flag '{flag}': {message}", display_path(.path))]
    FlagMutation {
        path: String,
        flag: String,
        message: String,
    },

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The user-facing category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(failures) => {
                if !failures.is_empty()
                    && failures.iter().all(|f| f.kind == ErrorKind::InvalidPolicy)
                {
                    ErrorKind::InvalidPolicy
                } else {
                    ErrorKind::ValidationFailure
                }
            }
            CoreError::CyclicReference { .. } => ErrorKind::CyclicReference,
            CoreError::DuplicateId { .. } => ErrorKind::DuplicateId,
            CoreError::UnknownEnvironment { .. } => ErrorKind::UnknownEnvironment,
            CoreError::MissingContext(_) => ErrorKind::MissingContext,
            CoreError::InvalidPolicy { .. } | CoreError::Policy(_) => ErrorKind::InvalidPolicy,
            CoreError::FlagMutation { .. } => ErrorKind::FlagMutation,
            CoreError::Invalid { .. }
            | CoreError::Config(_)
            | CoreError::Serialization(_)
            | CoreError::Io(_) => ErrorKind::ValidationFailure,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Validation failures carried by this error, if any.
    pub fn failures(&self) -> &[ValidationFailure] {
        match self {
            CoreError::Validation(failures) => failures,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::ValidationFailure.exit_code(), 1);
        assert_eq!(ErrorKind::MissingContext.exit_code(), 2);
        assert_eq!(ErrorKind::CyclicReference.exit_code(), 3);
        assert_eq!(ErrorKind::UnknownEnvironment.exit_code(), 4);
    }

    #[test]
    fn test_validation_error_lists_every_failure() {
        let err = CoreError::Validation(vec![
            ValidationFailure::new("A/Key", ErrorKind::ValidationFailure, "bad window"),
            ValidationFailure::new("A/Rule", ErrorKind::ValidationFailure, "no targets"),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 validation error(s)"));
        assert!(text.contains("[validation-failure] A/Key: bad window"));
        assert!(text.contains("A/Rule"));
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }

    #[test]
    fn test_missing_context_lists_query_keys() {
        let mut props = BTreeMap::new();
        props.insert("aliasName".to_string(), "alias/app".to_string());
        let err = CoreError::MissingContext(vec![MissingContext {
            path: "Stack/Key".to_string(),
            key: "key-provider:aliasName=alias/app".to_string(),
            provider: "key-provider".to_string(),
            props,
        }]);
        assert!(err.to_string().contains("aliasName=alias/app"));
        assert_eq!(err.exit_code(), 2);
    }
}
