// src/error.rs

//! Error types for the delivery controller
//!
//! `Error` is what commands return to callers. `ErrorKind` is its
//! serializable projection: it is recorded on sessions as `last_error`,
//! pushed to subscribers, and mapped to process exit codes by the CLI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by delivery commands
#[derive(Error, Debug)]
pub enum Error {
    /// None of the requested modules are installed
    #[error("Not installed: {}", modules.join(", "))]
    NotInstalled { modules: Vec<String> },

    /// The session is not waiting on a user confirmation
    #[error("No confirmation pending for module '{module}'")]
    NoConfirmationPending { module: String },

    /// A session for the module is already in flight
    ///
    /// The controller reports duplicates as `Action::AlreadyInProgress` and
    /// never returns this. It exists for callers that treat a suppressed
    /// duplicate as a failure, so it still gets exit code 5 and a 409
    /// problem document.
    #[error("Install already in progress for module '{module}'")]
    AlreadyInProgress { module: String },

    /// The delivery backend reported or raised a failure
    #[error("Backend failure (code {code}): {message}")]
    BackendFailure { code: i32, message: String },

    /// Module identifier failed validation
    #[error("Invalid module id '{id}': {reason}")]
    InvalidModuleId { id: String, reason: String },

    /// The backend sent a status code outside the known set
    #[error("Unknown backend status {code} for module '{module}'")]
    UnknownBackendStatus { module: String, code: i32 },

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Backend failure without a platform error code
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendFailure {
            code: ErrorKind::UNSPECIFIED_BACKEND_CODE,
            message: message.into(),
        }
    }

    /// Project onto the caller-facing error kind
    ///
    /// Ambient failures (config, I/O) have no delivery kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::NotInstalled { .. } => Some(ErrorKind::NotInstalled),
            Self::NoConfirmationPending { .. } => Some(ErrorKind::NoConfirmationPending),
            Self::AlreadyInProgress { .. } => Some(ErrorKind::AlreadyInProgress),
            Self::BackendFailure { code, .. } => Some(ErrorKind::BackendFailure { code: *code }),
            Self::InvalidModuleId { .. } => Some(ErrorKind::InvalidModuleId),
            Self::UnknownBackendStatus { .. } => Some(ErrorKind::UnknownBackendStatus),
            Self::Config(_) | Self::Io(_) => None,
        }
    }

    /// Exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.kind().map_or(1, |kind| kind.exit_code())
    }
}

/// Caller-facing error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    NotInstalled,
    NoConfirmationPending,
    /// Informational: a duplicate request was suppressed
    AlreadyInProgress,
    BackendFailure { code: i32 },
    InvalidModuleId,
    /// Logged and counted, never fatal
    UnknownBackendStatus,
}

impl ErrorKind {
    /// Code used when the backend failed without reporting one
    pub const UNSPECIFIED_BACKEND_CODE: i32 = -100;

    /// Stable process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidModuleId => 2,
            Self::NotInstalled => 3,
            Self::NoConfirmationPending => 4,
            Self::AlreadyInProgress => 5,
            Self::BackendFailure { .. } => 6,
            Self::UnknownBackendStatus => 7,
        }
    }

    /// Short identifier used in problem documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::NoConfirmationPending => "no_confirmation_pending",
            Self::AlreadyInProgress => "already_in_progress",
            Self::BackendFailure { .. } => "backend_failure",
            Self::InvalidModuleId => "invalid_module_id",
            Self::UnknownBackendStatus => "unknown_backend_status",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendFailure { code } => write!(f, "backend_failure({})", code),
            other => write!(f, "{}", other.as_str()),
        }
    }
}
