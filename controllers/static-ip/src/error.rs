//! Controller-specific error types.
//!
//! `ReconcileError` is the taxonomy every reconcile step reports in; the
//! driver translates it into requeue decisions and owner conditions.
//! `ControllerError` covers process-level failures (startup, watches).

use resource_store::StoreError;
use thiserror::Error;

/// Errors produced while reconciling a single object.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Target object is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency collision that outlived the retry budget
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Pool has no free address
    #[error("No free address in pool {0}")]
    PoolExhausted(String),

    /// Pool or fulfilled data is malformed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Store unreachable, slow or failing; retried with backoff
    #[error("Transient error: {0}")]
    Transient(String),

    /// Owner resolves to no pool, or the referenced pool does not exist
    #[error("IPPool not found: {0}")]
    PoolNotFound(String),

    /// Owner carries unusable configuration (e.g. ambiguous pool selection)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Non-retryable store failure
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) | StoreError::AlreadyExists(what) => Self::Conflict(what),
            StoreError::Transient(what) => Self::Transient(what),
            other => Self::Store(other),
        }
    }
}

impl ReconcileError {
    /// CamelCase reason used in conditions and metrics labels
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::PoolExhausted(_) => "PoolExhausted",
            Self::Validation(_) => "ValidationFailed",
            Self::Transient(_) => "TransientError",
            Self::PoolNotFound(_) => "PoolNotFound",
            Self::InvalidConfig(_) => "InvalidConfiguration",
            Self::Store(_) => "StoreError",
        }
    }

    /// Whether the condition persists until someone edits the offending object
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InvalidConfig(_))
    }
}

/// Errors that stop the controller process.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client could not be built
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Socket error (metrics listener)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
