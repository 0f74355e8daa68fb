//! VSphereCluster control-plane endpoint configuration

use super::device::validate_fulfilled;
use super::engine::Fulfillment;
use super::{ConfigureOutcome, Reconciler};
use crate::claims::{add_finalizer, claim_name, ensure_claim, resolve_pool, ClaimOwner};
use crate::context::WriteTarget;
use crate::error::ReconcileError;
use crds::{OwnerKind, VSphereCluster, ENDPOINT_MODE_ANNOTATION, OWNER_FINALIZER};
use kube::Resource;
use resource_store::ObjectKey;
use tracing::{debug, info};

/// Port used when the endpoint does not set one
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;

/// Whether the cluster's endpoint is left to something else: the mode
/// annotation asks for DHCP, or a host is already set
pub fn is_endpoint_dynamic(cluster: &VSphereCluster) -> bool {
    let dhcp = cluster
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ENDPOINT_MODE_ANNOTATION))
        .is_some_and(|mode| mode.trim().eq_ignore_ascii_case("dhcp"));
    dhcp || !cluster.spec.control_plane_endpoint.host.trim().is_empty()
}

impl Reconciler {
    /// Drives the single endpoint claim of a cluster and writes the address
    /// into `spec.controlPlaneEndpoint`.
    pub async fn configure_cluster(
        &self,
        cluster: &VSphereCluster,
        key: &ObjectKey,
    ) -> Result<ConfigureOutcome, ReconcileError> {
        let ctx = &self.ctx;
        if !cluster.spec.control_plane_endpoint.host.trim().is_empty() {
            return Ok(ConfigureOutcome::AllConfigured);
        }

        let pool = resolve_pool(ctx, key, &cluster.metadata).await?;
        ctx.modify(ctx.clusters.as_ref(), key, WriteTarget::Spec, |c: &mut VSphereCluster| {
            add_finalizer(&mut c.metadata, OWNER_FINALIZER)
        })
        .await?
        .ok_or_else(|| ReconcileError::NotFound(key.to_string()))?;

        let owner = ClaimOwner {
            kind: OwnerKind::VSphereCluster,
            key: key.clone(),
            reference: cluster.controller_owner_ref(&()),
        };
        ensure_claim(ctx, &owner, &pool, None).await?;
        let claim_key = key.sibling(claim_name(&key.name, None));

        let address = match self.engine.lookup(&claim_key).await? {
            Fulfillment::Fulfilled(address) => address,
            Fulfillment::Pending(wait) => {
                debug!("Endpoint of {} waits for {} ({:?})", key, claim_key, wait);
                return Ok(ConfigureOutcome::PartiallyPending { devices: Vec::new(), wait });
            }
            Fulfillment::Failed(msg) => {
                return Ok(ConfigureOutcome::Failed(format!("IPClaim {}: {}", claim_key, msg)));
            }
        };
        let ip = match validate_fulfilled(&claim_key.name, &address) {
            Ok(ip) => ip,
            Err(e) => return Ok(ConfigureOutcome::Failed(e.to_string())),
        };

        ctx.modify(ctx.clusters.as_ref(), key, WriteTarget::Spec, |c: &mut VSphereCluster| {
            let endpoint = &mut c.spec.control_plane_endpoint;
            if !endpoint.host.trim().is_empty() {
                return false;
            }
            endpoint.host = ip.to_string();
            if endpoint.port == 0 {
                endpoint.port = DEFAULT_API_SERVER_PORT;
            }
            true
        })
        .await?
        .ok_or_else(|| ReconcileError::NotFound(key.to_string()))?;

        info!("Configured control-plane endpoint {} for VSphereCluster {}", ip, key);
        Ok(ConfigureOutcome::AllConfigured)
    }
}
