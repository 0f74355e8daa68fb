//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watchers to
//! one work queue per resource kind:
//! - VSphereMachine: per-device static configuration
//! - VSphereCluster: control-plane endpoint
//! - IPClaim: address allocation and release
//! - IPPool: capacity bookkeeping

use crate::context::Context;
use crate::error::ControllerError;
use crate::queue::{Action, WorkQueue};
use crate::reconciler::Reconciler;
use crate::watcher::{Queues, Watcher};
use resource_store::ObjectKey;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Main controller for static IP assignment.
pub struct Controller {
    tasks: JoinSet<(&'static str, Result<(), ControllerError>)>,
    shutdown: CancellationToken,
}

fn spawn_queue<F, Fut>(
    tasks: &mut JoinSet<(&'static str, Result<(), ControllerError>)>,
    queue: WorkQueue,
    name: &'static str,
    concurrency: usize,
    ctx: &Context,
    shutdown: &CancellationToken,
    reconcile: F,
) where
    F: Fn(ObjectKey) -> Fut + Send + 'static,
    Fut: Future<Output = Action> + Send + 'static,
{
    let run = queue.run(concurrency, ctx.settings.backoff_min, shutdown.clone(), reconcile);
    tasks.spawn(async move {
        run.await;
        (name, Ok(()))
    });
}

impl Controller {
    /// Starts all queues and watchers.
    pub fn start(
        ctx: Arc<Context>,
        namespace: Option<String>,
        max_concurrency: usize,
        shutdown: CancellationToken,
    ) -> Self {
        info!("Initializing static IP controller");
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&ctx)));
        let mut tasks = JoinSet::new();

        let (machine_queue, machines) = WorkQueue::new("VSphereMachine");
        let (cluster_queue, clusters) = WorkQueue::new("VSphereCluster");
        let (claim_queue, claims) = WorkQueue::new("IPClaim");
        let (pool_queue, pools) = WorkQueue::new("IPPool");

        let r = Arc::clone(&reconciler);
        spawn_queue(&mut tasks, machine_queue, "VSphereMachine queue", max_concurrency, &ctx, &shutdown, move |key| {
            let r = Arc::clone(&r);
            async move { r.reconcile_machine(&key).await }
        });
        let r = Arc::clone(&reconciler);
        spawn_queue(&mut tasks, cluster_queue, "VSphereCluster queue", max_concurrency, &ctx, &shutdown, move |key| {
            let r = Arc::clone(&r);
            async move { r.reconcile_cluster(&key).await }
        });
        let r = Arc::clone(&reconciler);
        spawn_queue(&mut tasks, claim_queue, "IPClaim queue", max_concurrency, &ctx, &shutdown, move |key| {
            let r = Arc::clone(&r);
            async move { r.reconcile_claim(&key).await }
        });
        let r = Arc::clone(&reconciler);
        spawn_queue(&mut tasks, pool_queue, "IPPool queue", max_concurrency, &ctx, &shutdown, move |key| {
            let r = Arc::clone(&r);
            async move { r.reconcile_pool(&key).await }
        });

        let queues = Queues {
            machines,
            clusters,
            claims,
            pools,
        };
        let watcher = Arc::new(Watcher::new(ctx, queues, namespace, shutdown.clone()));

        let w = Arc::clone(&watcher);
        tasks.spawn(async move { ("VSphereMachine watcher", w.watch_machines().await) });
        let w = Arc::clone(&watcher);
        tasks.spawn(async move { ("VSphereCluster watcher", w.watch_clusters().await) });
        let w = Arc::clone(&watcher);
        tasks.spawn(async move { ("IPClaim watcher", w.watch_claims().await) });
        let w = Arc::clone(&watcher);
        tasks.spawn(async move { ("IPPool watcher", w.watch_pools().await) });

        Self { tasks, shutdown }
    }

    /// Runs until shutdown is requested or a watcher fails.
    ///
    /// A failing task cancels the others; in-flight reconciliations finish
    /// before this returns.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Static IP controller running");
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!("{} stopped", name),
                Ok((name, Err(e))) => {
                    error!("{} failed: {}", name, e);
                    self.shutdown.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Controller task panicked: {}", e);
                    self.shutdown.cancel();
                    first_error.get_or_insert(ControllerError::Watch(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Static IP controller stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_controller_assigns_address_end_to_end() {
        let stores = TestStores::new();
        stores.pools.seed(test_pool("vm-net", "default", &["10.0.0.1", "10.0.0.2"])).unwrap();
        stores
            .machines
            .seed(test_machine("m1", "default", vec![static_device()], Some("vm-net")))
            .unwrap();

        let shutdown = CancellationToken::new();
        let controller = Controller::start(stores.context(), None, 2, shutdown.clone());
        let running = tokio::spawn(controller.run());

        let key = ObjectKey::new("default", "m1");
        let mut configured = Vec::new();
        for _ in 0..100 {
            configured = stores.machines.peek(&key).unwrap().spec.network.devices[0].ip_addrs.clone();
            if !configured.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(configured, vec!["10.0.0.1/24".to_string()]);

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }
}
