//! Shared reconciliation context.
//!
//! Holds the stores for every resource kind the controller touches plus the
//! tunables. Every store call goes through [`Context::call`] so none of them
//! can run unbounded.

use crate::error::ReconcileError;
use crate::metrics::Metrics;
use crds::{IPClaim, IPPool, VSphereCluster, VSphereMachine};
use resource_store::{ObjectKey, ObjectStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Attempts for a read-modify-write before a conflict is reported
pub const CONFLICT_RETRIES: usize = 5;

/// Tunables derived from the command line
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deadline for each store call
    pub store_timeout: Duration,
    /// Requeue interval for converged owners
    pub sync_period: Duration,
    /// First backoff delay
    pub backoff_min: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
}

/// Which part of an object a read-modify-write replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Metadata and spec (`update`)
    Spec,
    /// Status subresource (`update_status`)
    Status,
}

/// Stores and settings shared by all reconcilers
pub struct Context {
    /// IPPool store
    pub pools: Arc<dyn ObjectStore<IPPool>>,
    /// IPClaim store
    pub claims: Arc<dyn ObjectStore<IPClaim>>,
    /// VSphereMachine store
    pub machines: Arc<dyn ObjectStore<VSphereMachine>>,
    /// VSphereCluster store
    pub clusters: Arc<dyn ObjectStore<VSphereCluster>>,
    /// Tunables
    pub settings: Settings,
    /// Metrics sink
    pub metrics: Metrics,
}

impl Context {
    /// Runs one store call under the store deadline
    pub async fn call<T, F>(&self, what: &str, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, fut).await {
            Ok(result) => result.map_err(ReconcileError::from),
            Err(_) => Err(ReconcileError::Transient(format!(
                "{} timed out after {:?}",
                what, self.settings.store_timeout
            ))),
        }
    }

    /// Read-modify-write with conflict retries.
    ///
    /// `mutate` returns whether it changed anything; when it did not, no
    /// write happens. Returns `None` when the object does not exist (or
    /// disappeared while writing), otherwise the latest stored copy.
    pub async fn modify<K, F>(
        &self,
        store: &dyn ObjectStore<K>,
        key: &ObjectKey,
        target: WriteTarget,
        mut mutate: F,
    ) -> Result<Option<K>, ReconcileError>
    where
        K: Send + Sync + 'static,
        F: FnMut(&mut K) -> bool + Send,
    {
        for attempt in 1..=CONFLICT_RETRIES {
            let Some(mut obj) = self.call("get", store.get_opt(key)).await? else {
                return Ok(None);
            };
            if !mutate(&mut obj) {
                return Ok(Some(obj));
            }

            let written = match target {
                WriteTarget::Spec => self.call("update", store.update(&obj)).await,
                WriteTarget::Status => self.call("update status", store.update_status(&obj)).await,
            };
            match written {
                Ok(obj) => return Ok(Some(obj)),
                Err(ReconcileError::Conflict(_)) => {
                    debug!("Conflict writing {} (attempt {}), re-reading", key, attempt);
                }
                Err(ReconcileError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Err(ReconcileError::Conflict(format!(
            "{} still conflicting after {} attempts",
            key, CONFLICT_RETRIES
        )))
    }
}
