//! Status conditions
//!
//! Cluster API style conditions shared by the owned CRDs and the consumed
//! vSphere types. The shape matches `clusterv1.Condition` so conditions
//! written by other controllers on the same object survive a round trip.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set on `IPClaim` once an address is bound
pub const ADDRESS_ALLOCATED: &str = "AddressAllocated";

/// Condition type set on owners once static configuration is applied
pub const STATIC_IP_CONFIGURED: &str = "StaticIPConfigured";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Tri-state condition status
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    #[default]
    Unknown,
}

/// A single status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. `AddressAllocated`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Severity, only meaningful when status is False (Cluster API convention)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    /// Machine readable reason (CamelCase)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A `True` condition with a reason
    pub fn ready(type_: &str, reason: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            reason: Some(reason.to_string()),
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// A `False` condition with reason, message and severity
    pub fn not_ready(type_: &str, reason: &str, severity: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Some(Utc::now()),
        }
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Inserts or replaces the condition of the same type.
///
/// Returns `false` (and leaves the list untouched) when an equivalent
/// condition is already present, so callers can skip the write entirely.
/// The transition time is only moved when the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => false,
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Looks up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Resources whose status carries a condition list
pub trait HasConditions {
    /// Current conditions (empty when there is no status yet)
    fn conditions(&self) -> &[Condition];

    /// Mutable conditions, creating the status when missing
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}
