//! VSphereMachine device configuration
//!
//! Every static device without addresses gets a claim named after the
//! machine and the device index. Fulfilled claims are written onto their
//! devices in one update, in device order; devices whose claim is still
//! pending are reported and left alone.

use super::engine::{Fulfillment, Wait};
use super::{ConfigureOutcome, Reconciler};
use crate::claims::{add_finalizer, claim_name, ensure_claim, resolve_pool, ClaimOwner};
use crate::context::WriteTarget;
use crate::dhcp::is_device_dhcp;
use crate::error::ReconcileError;
use crds::{FulfilledAddress, NetworkDeviceSpec, OwnerKind, VSphereMachine, OWNER_FINALIZER};
use kube::Resource;
use resource_store::ObjectKey;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Checks an address snapshot before it is handed out or written anywhere.
///
/// Returns the parsed address.
pub fn validate_fulfilled(claim: &str, address: &FulfilledAddress) -> Result<IpAddr, ReconcileError> {
    if address.address.trim().is_empty() {
        return Err(ReconcileError::Validation(format!("address for IPClaim {} is empty", claim)));
    }
    if address.gateway.trim().is_empty() {
        return Err(ReconcileError::Validation(format!("address for IPClaim {} has no gateway", claim)));
    }
    let ip: IpAddr = address.address.trim().parse().map_err(|_| {
        ReconcileError::Validation(format!("IPClaim {} carries invalid address '{}'", claim, address.address))
    })?;
    let gateway: IpAddr = address.gateway.trim().parse().map_err(|_| {
        ReconcileError::Validation(format!("IPClaim {} carries invalid gateway '{}'", claim, address.gateway))
    })?;
    if ip.is_ipv4() != gateway.is_ipv4() {
        return Err(ReconcileError::Validation(format!(
            "IPClaim {} mixes address families ({} via {})",
            claim, address.address, address.gateway
        )));
    }
    let max_prefix = if ip.is_ipv4() { 32 } else { 128 };
    if address.prefix > max_prefix {
        return Err(ReconcileError::Validation(format!(
            "IPClaim {} carries prefix /{} for {}",
            claim, address.prefix, address.address
        )));
    }
    Ok(ip)
}

/// Copies a fulfilled snapshot onto a device's static configuration
pub fn apply_to_device(device: &mut NetworkDeviceSpec, ip: IpAddr, address: &FulfilledAddress) {
    device.ip_addrs = vec![format!("{}/{}", ip, address.prefix)];
    match ip {
        IpAddr::V4(_) => device.gateway4 = Some(address.gateway.trim().to_string()),
        IpAddr::V6(_) => device.gateway6 = Some(address.gateway.trim().to_string()),
    }
    device.nameservers = address.dns_servers.clone();
    device.search_domains = address.search_domains.clone();
}

/// Static devices that still need an address
pub fn unconfigured_devices(devices: &[NetworkDeviceSpec]) -> Vec<usize> {
    devices
        .iter()
        .enumerate()
        .filter(|(_, d)| !is_device_dhcp(d) && d.ip_addrs.is_empty())
        .map(|(index, _)| index)
        .collect()
}

impl Reconciler {
    /// Drives claims for a machine's static devices and writes fulfilled
    /// addresses back onto them.
    pub async fn configure_machine(
        &self,
        machine: &VSphereMachine,
        key: &ObjectKey,
    ) -> Result<ConfigureOutcome, ReconcileError> {
        let ctx = &self.ctx;
        let needed = unconfigured_devices(&machine.spec.network.devices);
        if needed.is_empty() {
            debug!("VSphereMachine {} has no unconfigured static device", key);
            return Ok(ConfigureOutcome::AllConfigured);
        }

        let pool = resolve_pool(ctx, key, &machine.metadata).await?;

        // Claims must not outlive the machine without being released
        ctx.modify(ctx.machines.as_ref(), key, WriteTarget::Spec, |m: &mut VSphereMachine| {
            add_finalizer(&mut m.metadata, OWNER_FINALIZER)
        })
        .await?
        .ok_or_else(|| ReconcileError::NotFound(key.to_string()))?;

        let owner = ClaimOwner {
            kind: OwnerKind::VSphereMachine,
            key: key.clone(),
            reference: machine.controller_owner_ref(&()),
        };

        let mut ready: Vec<(usize, IpAddr, FulfilledAddress)> = Vec::new();
        let mut waiting: Vec<usize> = Vec::new();
        let mut wait = Wait::Allocating;
        let mut failures: Vec<String> = Vec::new();

        for index in needed {
            ensure_claim(ctx, &owner, &pool, Some(index)).await?;
            let claim_key = key.sibling(claim_name(&key.name, Some(index)));

            match self.engine.lookup(&claim_key).await? {
                Fulfillment::Fulfilled(address) => match validate_fulfilled(&claim_key.name, &address) {
                    Ok(ip) => ready.push((index, ip, address)),
                    Err(e) => {
                        warn!("Device {} of {}: {}", index, key, e);
                        failures.push(e.to_string());
                    }
                },
                Fulfillment::Pending(reason) => {
                    debug!("Device {} of {} waits for {} ({:?})", index, key, claim_key, reason);
                    waiting.push(index);
                    wait = wait.max(reason);
                }
                Fulfillment::Failed(msg) => failures.push(format!("IPClaim {}: {}", claim_key, msg)),
            }
        }

        if !ready.is_empty() {
            let mut written = Vec::new();
            ctx.modify(ctx.machines.as_ref(), key, WriteTarget::Spec, |m: &mut VSphereMachine| {
                written.clear();
                for (index, ip, address) in &ready {
                    let Some(device) = m.spec.network.devices.get_mut(*index) else {
                        continue;
                    };
                    // Re-checked on the fresh copy; a concurrent edit may have configured it
                    if is_device_dhcp(device) || !device.ip_addrs.is_empty() {
                        continue;
                    }
                    apply_to_device(device, *ip, address);
                    written.push(*index);
                }
                !written.is_empty()
            })
            .await?
            .ok_or_else(|| ReconcileError::NotFound(key.to_string()))?;

            for index in &written {
                info!("Configured device {} of VSphereMachine {}", index, key);
            }
        }

        Ok(if !failures.is_empty() {
            ConfigureOutcome::Failed(failures.join("; "))
        } else if !waiting.is_empty() {
            ConfigureOutcome::PartiallyPending { devices: waiting, wait }
        } else {
            ConfigureOutcome::AllConfigured
        })
    }
}
