//! Typed bindings for the Cluster API resources the operator consumes
//!
//! The CRDs themselves are installed and owned by the platform (Cluster API
//! and its AWS provider); these types only cover the fields the operator
//! reads and writes.

pub mod aws_cluster;
pub mod cluster;

pub use aws_cluster::{
    AWSCluster, AWSClusterRoleIdentity, AWSClusterRoleIdentitySpec, AWSClusterSpec, IdentityRef,
    NetworkSpec, SubnetSpec, VpcSpec,
};
pub use cluster::{
    Cluster, ClusterSpec, ClusterStatus, Condition, ConditionSeverity, ConditionStatus,
    InfrastructureRef,
};
