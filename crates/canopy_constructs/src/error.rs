//! Error types for the construct library.

use thiserror::Error;

use canopy_core::{CoreError, ErrorKind};
use canopy_policy::PolicyError;

/// Result type alias for construct operations.
pub type ConstructResult<T> = Result<T, ConstructError>;

/// Errors that can occur while building constructs.
#[derive(Error, Debug)]
pub enum ConstructError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("[validation-failure] {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("[invalid-policy] {0}")]
    Policy(#[from] PolicyError),

    #[error("[validation-failure] invalid schedule: {0}")]
    Schedule(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConstructError {
    pub(crate) fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The user-facing category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConstructError::Core(err) => err.kind(),
            ConstructError::Policy(_) => ErrorKind::InvalidPolicy,
            ConstructError::Invalid { .. }
            | ConstructError::Schedule(_)
            | ConstructError::Manifest(_)
            | ConstructError::Provider(_)
            | ConstructError::Yaml(_)
            | ConstructError::Io(_) => ErrorKind::ValidationFailure,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Fold into a [`CoreError`] for code that runs inside the core, such as
    /// linkers.
    pub fn into_core(self) -> CoreError {
        match self {
            ConstructError::Core(err) => err,
            ConstructError::Invalid { path, message } => CoreError::Invalid { path, message },
            ConstructError::Policy(err) => CoreError::Policy(err),
            ConstructError::Io(err) => CoreError::Io(err),
            other => CoreError::Config(other.to_string()),
        }
    }
}
