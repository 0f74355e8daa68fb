//! Reconciliation logic.
//!
//! - `engine`: claim fulfillment against pools (allocate, release, lookup)
//! - `claim`: the IPClaim and IPPool lanes driving the engine
//! - `device`: per-device configuration of VSphereMachines
//! - `endpoint`: control-plane endpoint of VSphereClusters
//! - `driver`: owner entry points turning outcomes into requeue decisions

pub mod claim;
pub mod device;
pub mod driver;
pub mod endpoint;
pub mod engine;

#[cfg(test)]
mod engine_test;
#[cfg(test)]
mod scenario_test;

use crate::backoff::ExponentialBackoff;
use crate::context::{Context, WriteTarget};
use crate::error::ReconcileError;
use crds::{Condition, HasConditions};
use engine::{ClaimEngine, Wait};
use resource_store::{ObjectKey, ObjectStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(min, max),
            error_count: 0,
        }
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Result of configuring one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// Every static device (or the endpoint) carries its address
    AllConfigured,
    /// Some claims are not fulfilled yet; `devices` lists the waiting device
    /// indices (empty for an endpoint) and `wait` the most severe reason
    PartiallyPending { devices: Vec<usize>, wait: Wait },
    /// Fulfilled data failed validation
    Failed(String),
}

/// Reconciles owners, claims and pools.
pub struct Reconciler {
    pub(crate) ctx: Arc<Context>,
    pub(crate) engine: ClaimEngine,
    /// Error count tracking per resource (kind/namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            engine: ClaimEngine::new(Arc::clone(&ctx)),
            ctx,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Advances the backoff of a resource; returns the delay and the number
    /// of consecutive failures including this one
    pub(crate) fn next_backoff(&self, resource_key: &str) -> (Duration, u32) {
        let settings = &self.ctx.settings;
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(resource_key.to_string())
                    .or_insert_with(|| BackoffState::new(settings.backoff_min, settings.backoff_max));
                state.error_count += 1;
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (settings.backoff_min, 1)
            }
        }
    }

    /// Reset backoff for a resource (on successful reconciliation)
    pub(crate) fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }

    /// Drops the backoff entry of a deleted resource
    pub(crate) fn forget_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }

    /// Persists a status condition; no write when an equivalent one is present
    pub(crate) async fn write_condition<K>(
        &self,
        store: &dyn ObjectStore<K>,
        key: &ObjectKey,
        condition: Condition,
    ) -> Result<(), ReconcileError>
    where
        K: HasConditions + Send + Sync + 'static,
    {
        self.ctx
            .modify(store, key, WriteTarget::Status, |obj: &mut K| {
                crds::set_condition(obj.conditions_mut(), condition.clone())
            })
            .await
            .map(|_| ())
    }
}

/// Backoff key of a resource
pub(crate) fn backoff_key(kind: &str, key: &ObjectKey) -> String {
    format!("{}/{}", kind, key)
}
