//! Static IP CRD Definitions
//!
//! Kubernetes Custom Resource Definitions owned by the static IP controller
//! (`IPPool`, `IPClaim`) and the subset of Cluster API vSphere types it reads
//! and writes (`VSphereMachine`, `VSphereCluster`).

pub mod conditions;
pub mod ip_claim;
pub mod ip_pool;
pub mod references;
pub mod vsphere;

pub use conditions::*;
pub use ip_claim::*;
pub use ip_pool::*;
pub use references::*;
pub use vsphere::*;

/// Owner annotation naming the `IPPool` (same namespace) to allocate from
pub const POOL_ANNOTATION: &str = "staticip.microscaler.io/ip-pool";

/// Cluster annotation; `dhcp` disables control-plane endpoint allocation
pub const ENDPOINT_MODE_ANNOTATION: &str = "staticip.microscaler.io/endpoint-mode";

/// Cluster API label carrying the owning cluster name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Claim label: kind of the owner that created the claim
pub const OWNER_KIND_LABEL: &str = "staticip.microscaler.io/owner-kind";

/// Claim label: name of the owner that created the claim
pub const OWNER_NAME_LABEL: &str = "staticip.microscaler.io/owner-name";

/// Claim label: name of the pool the claim draws from
pub const POOL_LABEL: &str = "staticip.microscaler.io/pool";

/// Finalizer on claims; removed once the address is back in the pool
pub const CLAIM_FINALIZER: &str = "staticip.microscaler.io/release-address";

/// Finalizer on owners; removed once every claim of the owner is released
pub const OWNER_FINALIZER: &str = "staticip.microscaler.io/ip-claims";
