//! IPPool CRD
//!
//! Defines a finite pool of statically assignable addresses together with
//! the network metadata (gateway, prefix, DNS) handed out with each address.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "staticip.microscaler.io",
    version = "v1alpha1",
    kind = "IPPool",
    namespaced,
    status = "IPPoolStatus",
    printcolumn = r#"{"name":"Allocated", "type":"integer", "jsonPath":".status.allocatedAddresses"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableAddresses"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// CIDR blocks whose host addresses are allocatable (e.g. "10.0.0.0/24")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,

    /// Inclusive address ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<AddressRange>,

    /// Individual addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    /// Addresses that are never handed out (pre-reserved)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_addresses: Vec<String>,

    /// Prefix length handed to consumers
    pub prefix: u8,

    /// Gateway handed to consumers; never allocated itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// DNS servers, in resolver order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,

    /// DNS search domains, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Inclusive range of addresses
pub struct AddressRange {
    /// First address of the range
    pub start: String,

    /// Last address of the range
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Allocation ledger and capacity counters of an IPPool
pub struct IPPoolStatus {
    /// Addresses currently bound to a claim, ascending by address.
    ///
    /// A list rather than a map so merge patches replace it wholesale.
    #[serde(default)]
    pub allocations: Vec<PoolAllocation>,

    /// Number of allocatable addresses (saturates at u64::MAX)
    #[serde(default)]
    pub total_addresses: u64,

    /// Number of allocated addresses
    #[serde(default)]
    pub allocated_addresses: u64,

    /// Number of free addresses
    #[serde(default)]
    pub available_addresses: u64,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// One address bound to one claim
pub struct PoolAllocation {
    /// Allocated address
    pub address: String,

    /// Name of the IPClaim holding the address
    pub claim: String,
}
