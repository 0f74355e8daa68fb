//! Cross-resource references used by IPClaim

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Reference to an IPPool
pub struct IPPoolRef {
    /// Name of the IPPool
    pub name: String,

    /// Namespace (defaults to same namespace as IPClaim)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// The resource a claim was created for (always in the claim's namespace)
pub struct ClaimOwnerRef {
    /// Owner kind
    pub kind: OwnerKind,

    /// Owner name
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
/// Kinds of resources that own claims
pub enum OwnerKind {
    /// Per-device claims of a machine
    VSphereMachine,

    /// Control-plane endpoint claim of a cluster
    VSphereCluster,
}

impl OwnerKind {
    /// Kind string as it appears in labels and owner references
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VSphereMachine => "VSphereMachine",
            Self::VSphereCluster => "VSphereCluster",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
