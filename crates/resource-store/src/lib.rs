//! Resource Store
//!
//! The storage interface consumed by the static IP reconcilers: versioned
//! get/list/create/update/delete plus a change stream, per resource kind.
//!
//! Two implementations are provided:
//! - [`KubeStore`]: backed by the Kubernetes API server (`kube::Api`)
//! - [`MemoryStore`]: in-memory, for unit tests (feature `test-util`)
//!
//! # Example
//!
//! ```no_run
//! use resource_store::{KubeStore, LabelSelector, ObjectKey, ObjectStore};
//! use crds::IPPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let pools: KubeStore<IPPool> = KubeStore::new(client);
//!
//! let pool = pools.get(&ObjectKey::new("default", "vm-net")).await?;
//! let all = pools.list(Some("default"), &LabelSelector::default()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Optimistic concurrency
//!
//! `update` and `update_status` carry the `resourceVersion` of the object
//! that was read. A concurrent write in between yields
//! [`StoreError::Conflict`]; callers re-read and retry.

pub mod error;
pub mod key;
pub mod kube_store;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use error::StoreError;
pub use key::{LabelSelector, ObjectKey};
pub use kube_store::KubeStore;
pub use store_trait::{ObjectStore, WatchEvent, WatchStream};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MemoryStore;
