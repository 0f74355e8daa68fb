//! Owner reconciliation entry points.
//!
//! One pass per owner event: `Start -> Skip | NeedsAllocation`, then
//! `Pending` (requeue with backoff), `Done` (resync after the sync period)
//! or `Error` (reported as the owner's `StaticIPConfigured` condition).
//! Deleting owners release every claim they created before their finalizer
//! is dropped.

use super::endpoint::is_endpoint_dynamic;
use super::engine::Wait;
use super::{backoff_key, ConfigureOutcome, Reconciler};
use crate::claims::{has_finalizer, owned_claims, pool_key_of, remove_finalizer};
use crate::context::WriteTarget;
use crate::dhcp::is_owner_dhcp;
use crate::error::ReconcileError;
use crate::queue::Action;
use crds::{
    Condition, HasConditions, IPClaim, OwnerKind, CLAIM_FINALIZER, OWNER_FINALIZER,
    STATIC_IP_CONFIGURED,
};
use kube::Resource;
use resource_store::{ObjectKey, ObjectStore};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Consecutive transient failures before they show up on the owner
const TRANSIENT_FAILURES_REPORTED: u32 = 5;

/// What one owner pass amounted to
#[derive(Debug)]
enum Pass {
    /// Owner is gone, or was deleted and cleaned up
    Gone,
    /// Owner is DHCP-mode (or its endpoint is dynamic)
    Skipped,
    /// A configurer ran
    Configured(ConfigureOutcome),
}

impl Reconciler {
    /// Reconciles one VSphereMachine.
    #[instrument(skip(self), fields(kind = "VSphereMachine", key = %key))]
    pub async fn reconcile_machine(&self, key: &ObjectKey) -> Action {
        let started = Instant::now();
        let result = self.machine_pass(key).await;
        let (action, label) = self
            .settle(OwnerKind::VSphereMachine, self.ctx.machines.as_ref(), key, result)
            .await;
        self.ctx
            .metrics
            .observe_reconcile(OwnerKind::VSphereMachine.as_str(), label, started.elapsed());
        action
    }

    /// Reconciles one VSphereCluster.
    #[instrument(skip(self), fields(kind = "VSphereCluster", key = %key))]
    pub async fn reconcile_cluster(&self, key: &ObjectKey) -> Action {
        let started = Instant::now();
        let result = self.cluster_pass(key).await;
        let (action, label) = self
            .settle(OwnerKind::VSphereCluster, self.ctx.clusters.as_ref(), key, result)
            .await;
        self.ctx
            .metrics
            .observe_reconcile(OwnerKind::VSphereCluster.as_str(), label, started.elapsed());
        action
    }

    async fn machine_pass(&self, key: &ObjectKey) -> Result<Pass, ReconcileError> {
        let ctx = &self.ctx;
        let Some(machine) = ctx.call("get machine", ctx.machines.get_opt(key)).await? else {
            return Ok(Pass::Gone);
        };
        if machine.meta().deletion_timestamp.is_some() {
            self.finalize_owner(OwnerKind::VSphereMachine, ctx.machines.as_ref(), key, &machine)
                .await?;
            return Ok(Pass::Gone);
        }
        if is_owner_dhcp(&machine.spec.network.devices) {
            debug!("VSphereMachine {} is DHCP-mode; skipping", key);
            return Ok(Pass::Skipped);
        }
        Ok(Pass::Configured(self.configure_machine(&machine, key).await?))
    }

    async fn cluster_pass(&self, key: &ObjectKey) -> Result<Pass, ReconcileError> {
        let ctx = &self.ctx;
        let Some(cluster) = ctx.call("get cluster", ctx.clusters.get_opt(key)).await? else {
            return Ok(Pass::Gone);
        };
        if cluster.meta().deletion_timestamp.is_some() {
            self.finalize_owner(OwnerKind::VSphereCluster, ctx.clusters.as_ref(), key, &cluster)
                .await?;
            return Ok(Pass::Gone);
        }
        if is_endpoint_dynamic(&cluster) {
            debug!("VSphereCluster {} endpoint is dynamic or already set; skipping", key);
            return Ok(Pass::Skipped);
        }
        Ok(Pass::Configured(self.configure_cluster(&cluster, key).await?))
    }

    /// Releases and removes every claim of a deleting owner, then drops the
    /// owner finalizer.
    async fn finalize_owner<K>(
        &self,
        kind: OwnerKind,
        store: &dyn ObjectStore<K>,
        key: &ObjectKey,
        owner: &K,
    ) -> Result<(), ReconcileError>
    where
        K: Resource + Send + Sync + 'static,
    {
        if !has_finalizer(owner.meta(), OWNER_FINALIZER) {
            return Ok(());
        }
        let ctx = &self.ctx;

        for claim in owned_claims(ctx, kind, key).await? {
            let Some(claim_key) = ObjectKey::of(&claim) else {
                continue;
            };
            ctx.call("delete claim", ctx.claims.delete(&claim_key)).await?;
            if let Some(address) = self.engine.release(&pool_key_of(&claim, &claim_key), &claim_key).await? {
                info!("Released {} held by {} of {} {}", address, claim_key, kind, key);
            }
            ctx.modify(ctx.claims.as_ref(), &claim_key, WriteTarget::Spec, |c: &mut IPClaim| {
                remove_finalizer(&mut c.metadata, CLAIM_FINALIZER)
            })
            .await?;
        }

        ctx.modify(store, key, WriteTarget::Spec, |owner: &mut K| {
            remove_finalizer(owner.meta_mut(), OWNER_FINALIZER)
        })
        .await?;
        self.forget_backoff(&backoff_key(kind.as_str(), key));
        info!("Released all IPClaims of {} {}", kind, key);
        Ok(())
    }

    /// Turns a pass result into a requeue decision, writing the owner
    /// condition where the outcome is user visible. Returns the action and
    /// the metrics result label.
    async fn settle<K>(
        &self,
        kind: OwnerKind,
        store: &dyn ObjectStore<K>,
        key: &ObjectKey,
        result: Result<Pass, ReconcileError>,
    ) -> (Action, &'static str)
    where
        K: HasConditions + Send + Sync + 'static,
    {
        let resource_key = backoff_key(kind.as_str(), key);
        let sync_period = self.ctx.settings.sync_period;

        let (condition, action, label) = match result {
            Ok(Pass::Gone) => return (Action::AwaitChange, "gone"),
            Ok(Pass::Skipped) => {
                self.reset_backoff(&resource_key);
                return (Action::AwaitChange, "skipped");
            }
            Ok(Pass::Configured(ConfigureOutcome::AllConfigured)) => {
                self.reset_backoff(&resource_key);
                let condition = Condition::ready(STATIC_IP_CONFIGURED, "Configured");
                (Some(condition), Action::Requeue(sync_period), "done")
            }
            Ok(Pass::Configured(ConfigureOutcome::PartiallyPending { devices, wait })) => {
                let (delay, _) = self.next_backoff(&resource_key);
                let (reason, severity) = match wait {
                    Wait::Allocating => ("WaitingForAddress", "Info"),
                    Wait::PoolNotFound => ("PoolNotFound", "Warning"),
                    Wait::PoolExhausted => ("PoolExhausted", "Warning"),
                };
                let condition =
                    Condition::not_ready(STATIC_IP_CONFIGURED, reason, severity, pending_message(&devices));
                debug!("{} {} pending ({:?}); requeue in {:?}", kind, key, wait, delay);
                (Some(condition), Action::Requeue(delay), "pending")
            }
            Ok(Pass::Configured(ConfigureOutcome::Failed(msg))) => {
                warn!("{} {} cannot be configured: {}", kind, key, msg);
                let condition = Condition::not_ready(STATIC_IP_CONFIGURED, "ValidationFailed", "Error", msg);
                (Some(condition), Action::Requeue(sync_period), "failed")
            }
            Err(ReconcileError::NotFound(what)) => {
                debug!("{} {} vanished during reconciliation ({})", kind, key, what);
                return (Action::AwaitChange, "gone");
            }
            Err(e) if e.is_terminal() => {
                warn!("{} {} cannot be configured: {}", kind, key, e);
                let condition = Condition::not_ready(STATIC_IP_CONFIGURED, e.reason(), "Error", e.to_string());
                (Some(condition), Action::Requeue(sync_period), "failed")
            }
            Err(e @ (ReconcileError::PoolNotFound(_) | ReconcileError::PoolExhausted(_))) => {
                let (delay, _) = self.next_backoff(&resource_key);
                warn!("{} {} waits for its pool: {}", kind, key, e);
                let condition = Condition::not_ready(STATIC_IP_CONFIGURED, e.reason(), "Warning", e.to_string());
                (Some(condition), Action::Requeue(delay), "pending")
            }
            Err(e) => {
                let (delay, errors) = self.next_backoff(&resource_key);
                error!("Reconciliation failed for {} {} ({} in a row): {}", kind, key, errors, e);
                let condition = (errors >= TRANSIENT_FAILURES_REPORTED).then(|| {
                    Condition::not_ready(STATIC_IP_CONFIGURED, e.reason(), "Warning", e.to_string())
                });
                (condition, Action::Requeue(delay), "error")
            }
        };

        if let Some(condition) = condition {
            if let Err(e) = self.write_condition(store, key, condition).await {
                warn!("Failed to update {} condition on {} {}: {}", STATIC_IP_CONFIGURED, kind, key, e);
                let (delay, _) = self.next_backoff(&resource_key);
                return (Action::Requeue(delay), "error");
            }
        }
        (action, label)
    }
}

fn pending_message(devices: &[usize]) -> String {
    if devices.is_empty() {
        return "waiting for the endpoint address".to_string();
    }
    let list: Vec<String> = devices.iter().map(ToString::to_string).collect();
    format!("waiting for addresses of devices {}", list.join(", "))
}

