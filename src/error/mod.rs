//! Crate-wide errors. [`RoadmapError`] is what operations return;
//! [`StructuredError`] is its `--json` rendering with an [`ErrorCode`].
//!
//! Per-entity failures talking to a remote are modelled separately by
//! [`crate::sync::BackendError`]; they only become a [`RoadmapError`] when
//! they abort a whole run.

mod codes;

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use codes::ErrorCode;

/// Main error type for roadmap operations.
#[derive(Error, Debug)]
pub enum RoadmapError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Invalid entity file {path}: {reason}")]
    InvalidEntity { path: String, reason: String },

    #[error("Local data is corrupted and could not be recovered: {0}")]
    LocalCorruption(String),

    #[error("Write failed for {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Sync state write failed: {0}")]
    StateWrite(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Required config value not set: {0}")]
    MissingConfig(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Remote unreachable: {0}")]
    Connectivity(String),

    #[error("Timed out waiting for lock: {0}")]
    LockTimeout(String),

    #[error("Could not take lock: {0}")]
    LockFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl RoadmapError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Git(_) => ErrorCode::GitError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) | Self::Yaml(_) => ErrorCode::SerializationError,
            Self::EntityNotFound(_) => ErrorCode::EntityNotFound,
            Self::InvalidEntity { .. } => ErrorCode::EntityInvalid,
            Self::LocalCorruption(_) => ErrorCode::EntityCorrupted,
            Self::WriteFailed { .. } => ErrorCode::StorageWriteError,
            Self::StateWrite(_) => ErrorCode::SyncStateWriteError,
            Self::Config(_) => ErrorCode::ConfigInvalid,
            Self::MissingConfig(_) => ErrorCode::ConfigMissingRequired,
            Self::Auth(_) => ErrorCode::NetworkAuthFailed,
            Self::Http(_) => ErrorCode::NetworkRequestFailed,
            Self::Connectivity(_) => ErrorCode::NetworkUnreachable,
            Self::LockTimeout(_) => ErrorCode::LockTimeout,
            Self::LockFailed(_) => ErrorCode::LockFailed,
            Self::ValidationFailed(_) => ErrorCode::ValidationFailed,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Machine-readable details (ids, paths, config keys).
    #[must_use]
    pub fn context(&self) -> Option<Value> {
        match self {
            Self::EntityNotFound(id) => Some(serde_json::json!({ "entity_id": id })),
            Self::InvalidEntity { path, reason } => {
                Some(serde_json::json!({ "path": path, "reason": reason }))
            }
            Self::WriteFailed { path, reason } => {
                Some(serde_json::json!({ "path": path, "reason": reason }))
            }
            Self::MissingConfig(key) => Some(serde_json::json!({ "config_key": key })),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_structured(&self) -> StructuredError {
        StructuredError::from_error(self)
    }
}

/// Emitted on stdout in `--json` mode so scripts can branch on `code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// The error code (e.g., "ENTITY_NOT_FOUND")
    pub code: ErrorCode,

    pub numeric_code: u16,

    pub message: String,

    pub suggestion: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    /// Fixable by the user without a code change.
    pub recoverable: bool,

    /// Error category (e.g., "entity", "config", "network")
    pub category: String,
}

impl StructuredError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            numeric_code: code.numeric(),
            suggestion: code.suggestion().to_string(),
            context: None,
            recoverable: code.is_recoverable(),
            category: code.category().to_string(),
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn from_error(err: &RoadmapError) -> Self {
        Self {
            context: err.context(),
            ..Self::new(err.code(), err.to_string())
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<&RoadmapError> for StructuredError {
    fn from(err: &RoadmapError) -> Self {
        Self::from_error(err)
    }
}

/// Result type alias using RoadmapError.
pub type Result<T> = std::result::Result<T, RoadmapError>;
