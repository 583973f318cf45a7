//! AWS network topology operator
//!
//! Converges AWS Transit Gateway network topologies for a fleet of managed
//! Kubernetes clusters. For every Cluster resource the operator maintains a
//! Transit Gateway, a Managed Prefix List, per-VPC attachments, cross-account
//! RAM shares and subnet routes so that workload clusters in multiple AWS
//! accounts share one hub-and-spoke private network.

pub mod annotations;
pub mod aws;
pub mod conditions;
pub mod controller;
pub mod crd;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod registrar;

pub use error::{Error, Result};
