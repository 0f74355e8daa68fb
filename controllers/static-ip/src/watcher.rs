//! Resource watchers.
//!
//! Each watcher turns store change events into queue entries:
//!
//! - owner events enqueue the owner,
//! - claim events enqueue the claim and the owner named in its spec, so an
//!   owner reconciles again as soon as its claim is fulfilled,
//! - pool events enqueue the pool and every unfulfilled claim drawing from
//!   it, so claims starved by an exhausted pool retry when capacity frees up.

use crate::claims::waiting_claims;
use crate::context::Context;
use crate::error::ControllerError;
use crate::queue::QueueHandle;
use crds::OwnerKind;
use futures::StreamExt;
use resource_store::{ObjectKey, WatchEvent, WatchStream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue handles, one per resource kind
#[derive(Debug, Clone)]
pub struct Queues {
    /// VSphereMachine owner keys
    pub machines: QueueHandle,
    /// VSphereCluster owner keys
    pub clusters: QueueHandle,
    /// IPClaim keys
    pub claims: QueueHandle,
    /// IPPool keys
    pub pools: QueueHandle,
}

impl Queues {
    fn owner(&self, kind: OwnerKind) -> &QueueHandle {
        match kind {
            OwnerKind::VSphereMachine => &self.machines,
            OwnerKind::VSphereCluster => &self.clusters,
        }
    }
}

/// Next event of a watch; `None` once shutdown is requested.
///
/// Stream errors are logged and skipped since the underlying watcher
/// reconnects on its own. A stream that ends is fatal.
async fn next_event<K>(
    stream: &mut WatchStream<K>,
    shutdown: &CancellationToken,
    kind: &str,
) -> Result<Option<WatchEvent<K>>, ControllerError> {
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return Ok(None),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => return Ok(Some(event)),
            Some(Err(e)) => warn!("{} watch error (retrying): {}", kind, e),
            None => return Err(ControllerError::Watch(format!("{} watch stream ended", kind))),
        }
    }
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    ctx: Arc<Context>,
    queues: Queues,
    namespace: Option<String>,
    shutdown: CancellationToken,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(ctx: Arc<Context>, queues: Queues, namespace: Option<String>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            queues,
            namespace,
            shutdown,
        }
    }

    /// Feeds VSphereMachine events into the machine queue
    pub async fn watch_machines(&self) -> Result<(), ControllerError> {
        info!("Starting VSphereMachine watcher");
        let mut stream = self.ctx.machines.watch(self.namespace.as_deref());
        while let Some(event) = next_event(&mut stream, &self.shutdown, "VSphereMachine").await? {
            if let Some(key) = ObjectKey::of(event.object()) {
                self.queues.machines.enqueue(key);
            }
        }
        Ok(())
    }

    /// Feeds VSphereCluster events into the cluster queue
    pub async fn watch_clusters(&self) -> Result<(), ControllerError> {
        info!("Starting VSphereCluster watcher");
        let mut stream = self.ctx.clusters.watch(self.namespace.as_deref());
        while let Some(event) = next_event(&mut stream, &self.shutdown, "VSphereCluster").await? {
            if let Some(key) = ObjectKey::of(event.object()) {
                self.queues.clusters.enqueue(key);
            }
        }
        Ok(())
    }

    /// Feeds IPClaim events into the claim queue and the owning resource's queue
    pub async fn watch_claims(&self) -> Result<(), ControllerError> {
        info!("Starting IPClaim watcher");
        let mut stream = self.ctx.claims.watch(self.namespace.as_deref());
        while let Some(event) = next_event(&mut stream, &self.shutdown, "IPClaim").await? {
            let claim = event.object();
            let Some(key) = ObjectKey::of(claim) else {
                continue;
            };
            let owner = key.sibling(claim.spec.owner_ref.name.clone());
            debug!("IPClaim {} changed; waking {} {}", key, claim.spec.owner_ref.kind, owner);
            self.queues.owner(claim.spec.owner_ref.kind).enqueue(owner);
            if matches!(event, WatchEvent::Applied(_)) {
                self.queues.claims.enqueue(key);
            }
        }
        Ok(())
    }

    /// Feeds IPPool events into the pool queue and wakes claims waiting on the pool
    pub async fn watch_pools(&self) -> Result<(), ControllerError> {
        info!("Starting IPPool watcher");
        let mut stream = self.ctx.pools.watch(self.namespace.as_deref());
        while let Some(event) = next_event(&mut stream, &self.shutdown, "IPPool").await? {
            let Some(key) = ObjectKey::of(event.object()) else {
                continue;
            };
            self.queues.pools.enqueue(key.clone());

            match waiting_claims(&self.ctx, &key).await {
                Ok(waiting) => {
                    if !waiting.is_empty() {
                        debug!("IPPool {} changed; waking {} waiting claims", key, waiting.len());
                    }
                    for claim in waiting {
                        self.queues.claims.enqueue(claim);
                    }
                }
                Err(e) => warn!("Failed to list claims waiting on IPPool {}: {}", key, e),
            }
        }
        Ok(())
    }
}
