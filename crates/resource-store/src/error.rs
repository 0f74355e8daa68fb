//! Resource store errors

use thiserror::Error;

/// Errors that can occur when reading or writing stored resources
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create of an object whose name is taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Stored resourceVersion differs from the one the write was based on
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store unreachable, throttled or failing server-side; safe to retry
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Kubernetes API rejected the request
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
