//! Cluster API vSphere types consumed by the controller
//!
//! Only the fields the controller reads or writes are typed. Everything else
//! is carried through `extra` maps, because owners are written back with a
//! full update and fields owned by CAPV must survive the round trip.
//!
//! These CRDs are installed by CAPV; schema generation is disabled and
//! `crdgen` never prints them.

use crate::conditions::{Condition, HasConditions};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereMachine",
    namespaced,
    status = "VSphereMachineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineSpec {
    /// VM network configuration
    #[serde(default)]
    pub network: NetworkSpec,

    /// Fields not interpreted by this controller
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Network section of a VSphereMachine
pub struct NetworkSpec {
    /// Network devices, in VM NIC order
    #[serde(default)]
    pub devices: Vec<NetworkDeviceSpec>,

    /// Fields not interpreted by this controller
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// A single VM network device
pub struct NetworkDeviceSpec {
    /// vSphere network (port group) name
    #[serde(default)]
    pub network_name: String,

    /// Obtain IPv4 configuration through DHCP
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dhcp4: bool,

    /// Obtain IPv6 configuration through DHCP
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dhcp6: bool,

    /// Static addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    /// IPv4 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,

    /// IPv6 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<String>,

    /// DNS servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    /// DNS search domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,

    /// Fields not interpreted by this controller (macAddr, mtu, routes, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Observed state of a VSphereMachine
pub struct VSphereMachineStatus {
    /// Conditions, including those owned by CAPV
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Fields not interpreted by this controller
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VSphereCluster",
    namespaced,
    status = "VSphereClusterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterSpec {
    /// Control-plane virtual IP
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// Fields not interpreted by this controller
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
/// Host and port of an API server endpoint
pub struct ApiEndpoint {
    /// Address or DNS name
    #[serde(default)]
    pub host: String,

    /// TCP port
    #[serde(default)]
    pub port: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Observed state of a VSphereCluster
pub struct VSphereClusterStatus {
    /// Conditions, including those owned by CAPV
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Fields not interpreted by this controller
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HasConditions for VSphereMachine {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(VSphereMachineStatus::default).conditions
    }
}

impl HasConditions for VSphereCluster {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(VSphereClusterStatus::default).conditions
    }
}
