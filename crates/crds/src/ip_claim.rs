//! IPClaim CRD
//!
//! Requests exactly one address from an IPPool on behalf of a machine
//! network device or a cluster control-plane endpoint.

use crate::conditions::{Condition, HasConditions};
use crate::references::{ClaimOwnerRef, IPPoolRef};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "staticip.microscaler.io",
    version = "v1alpha1",
    kind = "IPClaim",
    namespaced,
    status = "IPClaimStatus",
    printcolumn = r#"{"name":"Pool", "type":"string", "jsonPath":".spec.poolRef.name"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".status.address.address"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPClaimSpec {
    /// Reference to IPPool
    pub pool_ref: IPPoolRef,

    /// Resource that requested the address
    pub owner_ref: ClaimOwnerRef,

    /// Zero-based network device index (absent for endpoint claims)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Fulfillment state of an IPClaim
pub struct IPClaimStatus {
    /// Fulfillment state
    pub state: ClaimState,

    /// Address snapshot taken from the pool at fulfillment time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<FulfilledAddress>,

    /// Conditions (`AddressAllocated`)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Claim fulfillment state
#[serde(rename_all = "PascalCase")]
pub enum ClaimState {
    /// Waiting for an address
    #[default]
    Pending,

    /// Address bound; never changes afterwards
    Fulfilled,

    /// Pool data unusable; waits for the pool to be fixed
    Failed,
}

/// Read-only copy of everything a consumer needs to configure an interface.
///
/// Copied once at fulfillment; later pool edits do not alter it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FulfilledAddress {
    /// Allocated address (no prefix)
    pub address: String,

    /// Gateway
    #[serde(default)]
    pub gateway: String,

    /// Prefix length
    pub prefix: u8,

    /// DNS servers, in order
    #[serde(default)]
    pub dns_servers: Vec<String>,

    /// DNS search domains, in order
    #[serde(default)]
    pub search_domains: Vec<String>,
}

impl IPClaim {
    /// Snapshot of the bound address, if the claim is fulfilled
    pub fn fulfilled_address(&self) -> Option<&FulfilledAddress> {
        self.status
            .as_ref()
            .filter(|s| s.state == ClaimState::Fulfilled)
            .and_then(|s| s.address.as_ref())
    }
}

impl HasConditions for IPClaim {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(IPClaimStatus::default).conditions
    }
}
