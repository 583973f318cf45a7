//! Cluster annotation contract
//!
//! Annotations are the authoritative interface between the operator and the
//! rest of the platform: the topology mode selects the convergence strategy
//! and the transit gateway / prefix list annotations record the converged
//! resources (ARN form preferred, bare ids accepted for backward
//! compatibility and rewritten to ARNs on the next reconcile).

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::crd::Cluster;
use crate::error::Error;

/// Network topology mode of a cluster
pub const MODE: &str = "network-topology.giantswarm.io/mode";

/// Transit gateway used by a cluster (ARN preferred, bare id accepted)
pub const TRANSIT_GATEWAY: &str = "network-topology.giantswarm.io/transit-gateway";

/// Prefix list holding the CIDRs of all clusters (ARN preferred, bare id accepted)
pub const PREFIX_LIST: &str = "network-topology.giantswarm.io/prefix-list";

/// Cluster API pause annotation
pub const PAUSED: &str = "cluster.x-k8s.io/paused";

/// Topology mode values accepted on the mode annotation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkTopologyMode {
    /// No topology management
    None,
    /// Customer owns TGW and prefix list, the operator only attaches
    UserManaged,
    /// The operator owns the full TGW and prefix list lifecycle
    GiantSwarmManaged,
}

impl std::str::FromStr for NetworkTopologyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "UserManaged" => Ok(Self::UserManaged),
            "GiantSwarmManaged" => Ok(Self::GiantSwarmManaged),
            _ => Err(Error::validation(format!(
                "invalid network topology mode '{s}', expected one of: None, UserManaged, GiantSwarmManaged"
            ))),
        }
    }
}

impl std::fmt::Display for NetworkTopologyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::UserManaged => write!(f, "UserManaged"),
            Self::GiantSwarmManaged => write!(f, "GiantSwarmManaged"),
        }
    }
}

/// Returns the value of the given annotation, treating empty values as unset
pub fn get(cluster: &Cluster, key: &str) -> Option<String> {
    cluster
        .annotations()
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Returns the parsed topology mode, or None when the annotation is unset
pub fn mode(cluster: &Cluster) -> Result<Option<NetworkTopologyMode>, Error> {
    match get(cluster, MODE) {
        None => Ok(None),
        Some(value) => value.parse().map(Some),
    }
}

/// Returns the transit gateway annotation (ARN or bare id)
pub fn transit_gateway(cluster: &Cluster) -> Option<String> {
    get(cluster, TRANSIT_GATEWAY)
}

/// Returns the prefix list annotation (ARN or bare id)
pub fn prefix_list(cluster: &Cluster) -> Option<String> {
    get(cluster, PREFIX_LIST)
}

/// Set an annotation on the in-memory object
pub fn set(cluster: &mut Cluster, key: &str, value: &str) {
    cluster
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Build a single-entry annotation patch
pub fn patch(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}

/// True when the cluster is paused via spec or annotation
pub fn is_paused(cluster: &Cluster) -> bool {
    cluster.spec.paused.unwrap_or(false) || cluster.annotations().contains_key(PAUSED)
}
