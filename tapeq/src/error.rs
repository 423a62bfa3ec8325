//! Error types for tapeq.
//!
//! [`BackendError`] is what an object store backend reports. [`SchedulerError`]
//! is what every queue, mount and garbage-collection operation returns. Backend
//! errors are folded into scheduler errors so that a vanished object always
//! surfaces as [`SchedulerError::NoSuchObject`] and a lock timeout always
//! surfaces as [`SchedulerError::LostDatabaseConnection`].

use thiserror::Error;

/// Errors reported by an object store backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no such object: {0}")]
    NoSuchObject(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("timed out after {waited_ms}ms waiting for lock on {address}")]
    LockTimeout { address: String, waited_ms: u64 },

    #[error("lock on {address} is not held by this token")]
    LockNotHeld { address: String },

    /// Lock contention reported by backends that fail fast instead of
    /// blocking. Retryable.
    #[error("contention on {0}")]
    Contention(String),

    #[error("backend I/O error: {0}")]
    Io(String),
}

impl BackendError {
    /// Whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention(_) | Self::LockTimeout { .. })
    }
}

/// Errors returned by queue, mount and garbage-collection operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with this fSeq is already queued for the tape, or the batch
    /// itself repeats it.
    #[error("duplicate fSeq {fseq} for tape {vid}")]
    DuplicateFseq { vid: String, fseq: u64 },

    /// An expected object has vanished, usually because another agent
    /// already processed it.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    #[error("session not running: {0}")]
    SessionNotRunning(String),

    #[error("lost database connection: {0}")]
    LostDatabaseConnection(String),

    #[error("object {address} has type {found}, expected {expected}")]
    WrongType {
        address: String,
        expected: &'static str,
        found: String,
    },

    #[error("agent {address} still owns {count} objects")]
    AgentStillOwnsObjects { address: String, count: usize },

    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(BackendError),

    #[error("catalogue error: {0}")]
    Catalogue(#[source] anyhow::Error),
}

impl SchedulerError {
    pub fn is_no_such_object(&self) -> bool {
        matches!(self, Self::NoSuchObject(_))
    }

    /// Transient failures a caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LostDatabaseConnection(_) => true,
            Self::Backend(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<BackendError> for SchedulerError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NoSuchObject(address) => Self::NoSuchObject(address),
            timeout @ BackendError::LockTimeout { .. } => {
                Self::LostDatabaseConnection(timeout.to_string())
            }
            other => Self::Backend(other),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
