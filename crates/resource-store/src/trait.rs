//! ObjectStore trait for mocking
//!
//! This trait abstracts resource storage so the reconcilers can run against
//! the Kubernetes API in production and an in-memory store in unit tests.

use crate::error::StoreError;
use crate::key::{LabelSelector, ObjectKey};
use futures::stream::BoxStream;

/// A change observed on a watched resource kind
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object created or modified (also emitted for every object on (re)list)
    Applied(K),
    /// Object removed from the store
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The object carried by the event
    pub fn object(&self) -> &K {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// Stream of change events for one resource kind
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

/// Versioned storage of one resource kind
///
/// Writes are optimistic: `update` and `update_status` fail with
/// [`StoreError::Conflict`] when the `resourceVersion` carried by the object
/// is no longer the stored one. All async methods must be `Send` to work
/// with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Reads an object; absent objects are [`StoreError::NotFound`]
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError>;

    /// Reads an object, mapping `NotFound` to `None`
    async fn get_opt(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lists objects in a namespace (`None` = all namespaces) matching a selector
    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>, StoreError>;

    /// Creates an object; a taken name is [`StoreError::AlreadyExists`]
    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces metadata and spec, guarded by the object's `resourceVersion`.
    ///
    /// Removing the last finalizer of an object marked for deletion removes it.
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces status, guarded by the object's `resourceVersion`
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    /// Requests deletion. Objects with finalizers are only marked
    /// (`deletionTimestamp`); deleting an absent object is not an error.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Change stream for a namespace (`None` = all namespaces)
    fn watch(&self, namespace: Option<&str>) -> WatchStream<K>;
}
