//! IPClaim and IPPool reconcilers

use super::{backoff_key, Reconciler};
use crate::address_pool::{counter, AddressPool};
use crate::claims::{add_finalizer, has_finalizer, pool_key_of, remove_finalizer};
use crate::context::WriteTarget;
use crate::error::ReconcileError;
use crate::queue::Action;
use crds::{
    set_condition, ClaimState, Condition, FulfilledAddress, IPClaim, IPClaimStatus, IPPool,
    ADDRESS_ALLOCATED, CLAIM_FINALIZER,
};
use resource_store::ObjectKey;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const CLAIM_KIND: &str = "IPClaim";
const POOL_KIND: &str = "IPPool";

/// Status update for a claim; returns whether anything changed
fn apply_claim_status(claim: &mut IPClaim, state: ClaimState, address: Option<&FulfilledAddress>, condition: Condition) -> bool {
    // A fulfilled claim never changes again
    if claim.fulfilled_address().is_some() {
        return false;
    }
    let status = claim.status.get_or_insert_with(IPClaimStatus::default);
    let mut changed = set_condition(&mut status.conditions, condition);
    if status.state != state {
        status.state = state;
        changed = true;
    }
    if let Some(address) = address {
        status.address = Some(address.clone());
        changed = true;
    }
    if changed {
        status.last_reconciled = Some(chrono::Utc::now());
    }
    changed
}

impl Reconciler {
    /// Allocates an address for a claim and records the snapshot on its status.
    #[instrument(skip(self), fields(kind = CLAIM_KIND, key = %key))]
    pub async fn reconcile_claim(&self, key: &ObjectKey) -> Action {
        let started = Instant::now();
        let result = self.claim_pass(key).await;

        let (action, label) = match result {
            Ok(action) => (action, "ok"),
            Err(e) => {
                let (delay, errors) = self.next_backoff(&backoff_key(CLAIM_KIND, key));
                error!("Reconciliation failed for IPClaim {} ({} in a row): {}", key, errors, e);
                (Action::Requeue(delay), "error")
            }
        };
        self.ctx.metrics.observe_reconcile(CLAIM_KIND, label, started.elapsed());
        action
    }

    async fn claim_pass(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let ctx = &self.ctx;
        let resource_key = backoff_key(CLAIM_KIND, key);

        let Some(claim) = ctx.call("get claim", ctx.claims.get_opt(key)).await? else {
            debug!("IPClaim {} is gone", key);
            self.forget_backoff(&resource_key);
            return Ok(Action::AwaitChange);
        };
        let pool_key = pool_key_of(&claim, key);

        if claim.metadata.deletion_timestamp.is_some() {
            if has_finalizer(&claim.metadata, CLAIM_FINALIZER) {
                self.engine.release(&pool_key, key).await?;
                ctx.modify(ctx.claims.as_ref(), key, WriteTarget::Spec, |c: &mut IPClaim| {
                    remove_finalizer(&mut c.metadata, CLAIM_FINALIZER)
                })
                .await?;
                info!("Released IPClaim {}", key);
            }
            self.forget_backoff(&resource_key);
            return Ok(Action::AwaitChange);
        }

        if claim.fulfilled_address().is_some() {
            self.reset_backoff(&resource_key);
            return Ok(Action::AwaitChange);
        }

        if !has_finalizer(&claim.metadata, CLAIM_FINALIZER) {
            ctx.modify(ctx.claims.as_ref(), key, WriteTarget::Spec, |c: &mut IPClaim| {
                add_finalizer(&mut c.metadata, CLAIM_FINALIZER)
            })
            .await?;
        }

        let (state, address, condition, action) = match self.engine.allocate(&pool_key, key).await {
            Ok(address) => {
                self.reset_backoff(&resource_key);
                let condition = Condition::ready(ADDRESS_ALLOCATED, "Allocated");
                (ClaimState::Fulfilled, Some(address), condition, Action::AwaitChange)
            }
            Err(e @ (ReconcileError::PoolExhausted(_) | ReconcileError::PoolNotFound(_))) => {
                let (delay, _) = self.next_backoff(&resource_key);
                warn!("IPClaim {} waits for an address: {}", key, e);
                let condition = Condition::not_ready(ADDRESS_ALLOCATED, e.reason(), "Warning", e.to_string());
                (ClaimState::Pending, None, condition, Action::Requeue(delay))
            }
            Err(ReconcileError::Validation(msg)) => {
                warn!("IPClaim {} cannot be fulfilled from pool {}: {}", key, pool_key, msg);
                let condition = Condition::not_ready(ADDRESS_ALLOCATED, "ValidationFailed", "Error", msg);
                (ClaimState::Failed, None, condition, Action::AwaitChange)
            }
            Err(ReconcileError::NotFound(_)) => return Ok(Action::AwaitChange),
            Err(e) => return Err(e),
        };

        ctx.modify(ctx.claims.as_ref(), key, WriteTarget::Status, |c: &mut IPClaim| {
            apply_claim_status(c, state.clone(), address.as_ref(), condition.clone())
        })
        .await?;
        Ok(action)
    }

    /// Refreshes a pool's capacity counters and gauges.
    #[instrument(skip(self), fields(kind = POOL_KIND, key = %key))]
    pub async fn reconcile_pool(&self, key: &ObjectKey) -> Action {
        let started = Instant::now();
        let (action, label) = match self.pool_pass(key).await {
            Ok(()) => (Action::Requeue(self.ctx.settings.sync_period), "ok"),
            Err(e) => {
                let (delay, _) = self.next_backoff(&backoff_key(POOL_KIND, key));
                error!("Reconciliation failed for IPPool {}: {}", key, e);
                (Action::Requeue(delay), "error")
            }
        };
        self.ctx.metrics.observe_reconcile(POOL_KIND, label, started.elapsed());
        action
    }

    async fn pool_pass(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let ctx = &self.ctx;
        let Some(pool) = ctx.call("get pool", ctx.pools.get_opt(key)).await? else {
            ctx.metrics.forget_pool(key);
            self.forget_backoff(&backoff_key(POOL_KIND, key));
            return Ok(());
        };

        let view = match AddressPool::from_resource(&pool) {
            Ok(view) => view,
            Err(e) => {
                warn!("IPPool {} is invalid: {}", key, e);
                return Ok(());
            }
        };
        let (total, allocated, available) = (
            counter(view.capacity()),
            counter(view.allocated_count()),
            counter(view.available()),
        );

        ctx.modify(ctx.pools.as_ref(), key, WriteTarget::Status, |p: &mut IPPool| {
            let status = p.status.get_or_insert_with(Default::default);
            if (status.total_addresses, status.allocated_addresses, status.available_addresses)
                == (total, allocated, available)
            {
                return false;
            }
            status.total_addresses = total;
            status.allocated_addresses = allocated;
            status.available_addresses = available;
            true
        })
        .await?;

        ctx.metrics.set_pool_usage(key, total, allocated, available);
        self.reset_backoff(&backoff_key(POOL_KIND, key));
        Ok(())
    }
}
