//! Status condition helpers
//!
//! The operator surfaces progress and failures on the `NetworkTopologyReady`
//! condition of the Cluster resource. Conditions keep their transition time
//! unless the status actually changes.

use crate::crd::{Cluster, ClusterStatus, Condition, ConditionSeverity, ConditionStatus};

/// Condition type maintained by the network topology reconciler
pub const NETWORK_TOPOLOGY_READY: &str = "NetworkTopologyReady";

/// True when the cluster carries a condition of the given type
pub fn has(cluster: &Cluster, type_: &str) -> bool {
    get(cluster, type_).is_some()
}

/// Returns the condition of the given type, if present
pub fn get<'a>(cluster: &'a Cluster, type_: &str) -> Option<&'a Condition> {
    cluster
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default()
        .iter()
        .find(|c| c.type_ == type_)
}

/// Set or replace a condition, keeping the old transition time when the
/// status did not change
pub fn set(cluster: &mut Cluster, mut condition: Condition) {
    let status = cluster.status.get_or_insert_with(ClusterStatus::default);

    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.type_ == condition.type_)
    {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        status.conditions.push(condition);
    }
}

/// Mark NetworkTopologyReady True
pub fn mark_ready(cluster: &mut Cluster) {
    set(cluster, Condition::ready(NETWORK_TOPOLOGY_READY));
}

/// Mark NetworkTopologyReady False with the given reason
pub fn mark_false(
    cluster: &mut Cluster,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set(
        cluster,
        Condition::false_condition(NETWORK_TOPOLOGY_READY, reason, severity, message),
    );
}

/// Initial condition before the first convergence attempt
pub fn mark_in_progress(cluster: &mut Cluster) {
    mark_false(cluster, "InProgress", ConditionSeverity::Info, "");
}

pub fn mark_mode_not_supported(cluster: &mut Cluster, mode: &str) {
    mark_false(
        cluster,
        "ModeNotSupported",
        ConditionSeverity::Info,
        format!("The provided mode '{mode}' is not supported"),
    );
}

pub fn mark_transit_gateway_not_available(cluster: &mut Cluster) {
    mark_false(
        cluster,
        "TransitGatewayNotAvailable",
        ConditionSeverity::Warning,
        "The transit gateway is not yet available for attachment",
    );
}

pub fn mark_vpc_not_ready(cluster: &mut Cluster) {
    mark_false(
        cluster,
        "VPCNotReady",
        ConditionSeverity::Info,
        "The cluster's VPC is not yet ready",
    );
}

pub fn mark_id_not_provided(cluster: &mut Cluster, resource: &str) {
    mark_false(
        cluster,
        "RequiredIDMissing",
        ConditionSeverity::Error,
        format!("The {resource} ID is missing from the annotations"),
    );
}

/// True when NetworkTopologyReady is True
pub fn is_ready(cluster: &Cluster) -> bool {
    get(cluster, NETWORK_TOPOLOGY_READY)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}
