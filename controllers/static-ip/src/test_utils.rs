//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and an in-memory
//! context to run reconcilers against.

use crate::context::{Context, Settings};
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crds::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use resource_store::MemoryStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// In-memory stores for every resource kind
#[derive(Clone)]
pub struct TestStores {
    /// IPPools, including their allocation status
    pub pools: MemoryStore<IPPool>,
    /// IPClaims created by the owner reconcilers
    pub claims: MemoryStore<IPClaim>,
    /// VSphereMachine owners
    pub machines: MemoryStore<VSphereMachine>,
    /// VSphereCluster owners
    pub clusters: MemoryStore<VSphereCluster>,
}

impl TestStores {
    pub fn new() -> Self {
        Self {
            pools: MemoryStore::new(),
            claims: MemoryStore::new(),
            machines: MemoryStore::new(),
            clusters: MemoryStore::new(),
        }
    }

    /// Context over these stores with short delays
    pub fn context(&self) -> Arc<Context> {
        self.context_with(test_settings())
    }

    pub fn context_with(&self, settings: Settings) -> Arc<Context> {
        Arc::new(Context {
            pools: Arc::new(self.pools.clone()),
            claims: Arc::new(self.claims.clone()),
            machines: Arc::new(self.machines.clone()),
            clusters: Arc::new(self.clusters.clone()),
            settings,
            metrics: Metrics::new().unwrap(),
        })
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.context())
    }

    /// Writes across all stores
    pub fn total_writes(&self) -> usize {
        self.pools.write_count()
            + self.claims.write_count()
            + self.machines.write_count()
            + self.clusters.write_count()
    }
}

/// Settings used by [`TestStores::context`]
pub fn test_settings() -> Settings {
    Settings {
        store_timeout: Duration::from_secs(1),
        sync_period: Duration::from_secs(600),
        backoff_min: Duration::from_millis(20),
        backoff_max: Duration::from_secs(1),
    }
}

/// Helper to create test IPPool CRD with explicit addresses
pub fn test_pool(name: &str, namespace: &str, addresses: &[&str]) -> IPPool {
    let mut pool = IPPool::new(
        name,
        IPPoolSpec {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            prefix: 24,
            gateway: Some("10.0.0.254".to_string()),
            dns_servers: vec!["10.0.0.53".to_string(), "10.0.0.54".to_string()],
            search_domains: vec!["lab.example.com".to_string()],
            ..Default::default()
        },
    );
    pool.metadata.namespace = Some(namespace.to_string());
    pool
}

/// A static device without configuration
pub fn static_device() -> NetworkDeviceSpec {
    NetworkDeviceSpec {
        network_name: "vm-net".to_string(),
        ..Default::default()
    }
}

/// A DHCPv4 device
pub fn dhcp_device() -> NetworkDeviceSpec {
    NetworkDeviceSpec {
        network_name: "vm-net".to_string(),
        dhcp4: true,
        ..Default::default()
    }
}

fn owner_meta(name: &str, namespace: &str, pool: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        annotations: pool.map(|p| BTreeMap::from([(POOL_ANNOTATION.to_string(), p.to_string())])),
        labels: Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), "workload".to_string())])),
        ..Default::default()
    }
}

/// Helper to create test VSphereMachine CRD
pub fn test_machine(
    name: &str,
    namespace: &str,
    devices: Vec<NetworkDeviceSpec>,
    pool: Option<&str>,
) -> VSphereMachine {
    VSphereMachine {
        metadata: owner_meta(name, namespace, pool),
        spec: VSphereMachineSpec {
            network: NetworkSpec {
                devices,
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    }
}

/// Helper to create test VSphereCluster CRD with an empty endpoint
pub fn test_cluster(name: &str, namespace: &str, pool: Option<&str>) -> VSphereCluster {
    VSphereCluster {
        metadata: owner_meta(name, namespace, pool),
        spec: VSphereClusterSpec::default(),
        status: None,
    }
}

/// Helper to create test IPClaim CRD owned by a machine
pub fn test_claim(name: &str, namespace: &str, pool: &str, owner: &str, device_index: Option<u32>) -> IPClaim {
    let mut claim = IPClaim::new(
        name,
        IPClaimSpec {
            pool_ref: IPPoolRef {
                name: pool.to_string(),
                namespace: None,
            },
            owner_ref: ClaimOwnerRef {
                kind: OwnerKind::VSphereMachine,
                name: owner.to_string(),
            },
            device_index,
        },
    );
    claim.metadata.namespace = Some(namespace.to_string());
    claim.metadata.labels = Some(BTreeMap::from([
        (OWNER_KIND_LABEL.to_string(), OwnerKind::VSphereMachine.as_str().to_string()),
        (OWNER_NAME_LABEL.to_string(), owner.to_string()),
    ]));
    claim.metadata.finalizers = Some(vec![CLAIM_FINALIZER.to_string()]);
    claim
}
