//! Claim fulfillment engine.
//!
//! Owns the allocate/release transaction against a pool. Within this
//! process a per-pool async mutex spans "load pool, pick address, persist
//! status"; across processes the pool's resourceVersion does the same job,
//! since a stale status write fails with a conflict and is retried on a
//! fresh read.

use super::device::validate_fulfilled;
use crate::address_pool::{counter, AddressPool};
use crate::context::{Context, WriteTarget, CONFLICT_RETRIES};
use crate::error::ReconcileError;
use crds::{ClaimState, FulfilledAddress, IPClaim, IPPool, ADDRESS_ALLOCATED};
use resource_store::ObjectKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Why a claim does not hold an address yet, in increasing severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Wait {
    /// Not processed yet
    Allocating,
    /// The claim's pool does not exist
    PoolNotFound,
    /// The claim's pool has no free address
    PoolExhausted,
}

/// Fulfillment state of a claim as seen by the configurers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fulfillment {
    /// Address bound
    Fulfilled(FulfilledAddress),
    /// Address not bound yet
    Pending(Wait),
    /// The pool's data is unusable; carries the validation message
    Failed(String),
}

impl Fulfillment {
    /// Reads the fulfillment state recorded on a claim
    pub fn of(claim: &IPClaim) -> Self {
        if claim.metadata.deletion_timestamp.is_some() {
            return Self::Pending(Wait::Allocating);
        }
        if let Some(address) = claim.fulfilled_address() {
            return Self::Fulfilled(address.clone());
        }

        let status = claim.status.as_ref();
        let allocated = status.and_then(|s| crds::find_condition(&s.conditions, ADDRESS_ALLOCATED));
        if status.is_some_and(|s| s.state == ClaimState::Failed) {
            let message = allocated
                .and_then(|c| c.message.clone())
                .unwrap_or_else(|| "pool data is invalid".to_string());
            return Self::Failed(message);
        }
        match allocated.and_then(|c| c.reason.as_deref()) {
            Some("PoolExhausted") => Self::Pending(Wait::PoolExhausted),
            Some("PoolNotFound") => Self::Pending(Wait::PoolNotFound),
            _ => Self::Pending(Wait::Allocating),
        }
    }
}

/// Name a claim is recorded under in its pool's status
pub fn holder_id(pool_key: &ObjectKey, claim_key: &ObjectKey) -> String {
    if pool_key.namespace == claim_key.namespace {
        claim_key.name.clone()
    } else {
        claim_key.to_string()
    }
}

/// Rewrites capacity counters from the allocation list.
///
/// An unparsable pool keeps its totals and only tracks the allocated count.
fn refresh_counters(pool: &mut IPPool) {
    let view = AddressPool::from_resource(pool);
    let status = pool.status.get_or_insert_with(Default::default);
    match view {
        Ok(view) => {
            status.total_addresses = counter(view.capacity());
            status.allocated_addresses = counter(view.allocated_count());
            status.available_addresses = counter(view.available());
        }
        Err(_) => {
            status.allocated_addresses = status.allocations.len() as u64;
            status.available_addresses = status.total_addresses.saturating_sub(status.allocated_addresses);
        }
    }
    status.last_reconciled = Some(chrono::Utc::now());
}

/// Allocate/release/lookup against pools
pub struct ClaimEngine {
    ctx: Arc<Context>,
    locks: Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClaimEngine {
    /// Creates an engine over the context's stores
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn pool_lock(&self, pool_key: &ObjectKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(pool_key.clone()).or_default())
    }

    /// Binds the lowest free address of the pool to the claim.
    ///
    /// Idempotent: a claim that already holds an address gets the same
    /// snapshot back. A pool whose data would not configure a device (no
    /// gateway, mixed families) fails with `Validation` and binds nothing.
    /// Fails with `NotFound` when the claim is gone or being
    /// deleted, so an owner deletion racing an allocation cannot orphan an
    /// address.
    pub async fn allocate(
        &self,
        pool_key: &ObjectKey,
        claim_key: &ObjectKey,
    ) -> Result<FulfilledAddress, ReconcileError> {
        let lock = self.pool_lock(pool_key);
        let _guard = lock.lock().await;
        let ctx = &self.ctx;

        match ctx.call("get claim", ctx.claims.get_opt(claim_key)).await? {
            Some(claim) if claim.metadata.deletion_timestamp.is_none() => {}
            _ => return Err(ReconcileError::NotFound(claim_key.to_string())),
        }

        let holder = holder_id(pool_key, claim_key);
        for attempt in 1..=CONFLICT_RETRIES {
            let Some(mut pool) = ctx.call("get pool", ctx.pools.get_opt(pool_key)).await? else {
                return Err(ReconcileError::PoolNotFound(pool_key.to_string()));
            };
            let mut view = AddressPool::from_resource(&pool)?;

            if let Some(held) = view.allocation_of(&holder) {
                debug!("{} already holds {} in pool {}", claim_key, held, pool_key);
                return Ok(view.snapshot(held));
            }
            let Some(address) = view.next_free() else {
                return Err(ReconcileError::PoolExhausted(pool_key.to_string()));
            };
            // Nothing is bound until the pool data would configure a device
            validate_fulfilled(&claim_key.name, &view.snapshot(address))?;

            view.assign(address, &holder);
            pool.status.get_or_insert_with(Default::default).allocations = view.records();
            refresh_counters(&mut pool);

            match ctx.call("update pool status", ctx.pools.update_status(&pool)).await {
                Ok(_) => {
                    info!("Allocated {} from pool {} to {}", address, pool_key, claim_key);
                    return Ok(view.snapshot(address));
                }
                Err(ReconcileError::Conflict(_)) => {
                    debug!("Pool {} changed while allocating (attempt {})", pool_key, attempt);
                }
                Err(ReconcileError::NotFound(_)) => {
                    return Err(ReconcileError::PoolNotFound(pool_key.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        Err(ReconcileError::Conflict(format!(
            "pool {} still conflicting after {} attempts",
            pool_key, CONFLICT_RETRIES
        )))
    }

    /// Returns the claim's address to the pool.
    ///
    /// Idempotent: releasing a claim that holds nothing, or whose pool is
    /// gone, succeeds without writing. Returns the released address.
    pub async fn release(
        &self,
        pool_key: &ObjectKey,
        claim_key: &ObjectKey,
    ) -> Result<Option<String>, ReconcileError> {
        let lock = self.pool_lock(pool_key);
        let _guard = lock.lock().await;

        let holder = holder_id(pool_key, claim_key);
        let mut released = None;
        let written = self
            .ctx
            .modify(
                self.ctx.pools.as_ref(),
                pool_key,
                WriteTarget::Status,
                |pool: &mut IPPool| {
                    let Some(status) = pool.status.as_mut() else {
                        return false;
                    };
                    let before = status.allocations.len();
                    released = status
                        .allocations
                        .iter()
                        .find(|a| a.claim == holder)
                        .map(|a| a.address.clone());
                    status.allocations.retain(|a| a.claim != holder);
                    if status.allocations.len() == before {
                        return false;
                    }
                    refresh_counters(pool);
                    true
                },
            )
            .await?;

        match (&written, &released) {
            (None, _) => debug!("Pool {} is gone; nothing to release for {}", pool_key, claim_key),
            (Some(_), Some(address)) => info!("Released {} from pool {} ({})", address, pool_key, claim_key),
            (Some(_), None) => debug!("{} held no address in pool {}", claim_key, pool_key),
        }
        Ok(written.and(released))
    }

    /// Reads a claim's fulfillment state without side effects.
    ///
    /// A missing claim is reported as pending; the caller creates it.
    pub async fn lookup(&self, claim_key: &ObjectKey) -> Result<Fulfillment, ReconcileError> {
        let claim = self
            .ctx
            .call("get claim", self.ctx.claims.get_opt(claim_key))
            .await?;
        Ok(match claim {
            Some(claim) => Fulfillment::of(&claim),
            None => {
                warn!("IPClaim {} not found during lookup", claim_key);
                Fulfillment::Pending(Wait::Allocating)
            }
        })
    }
}
