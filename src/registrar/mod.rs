//! Cloud-resource registrars
//!
//! A registrar converges the AWS side of one cluster: [`register`] drives
//! observed state toward the topology the annotations describe,
//! [`unregister`] tears it down again. Both are idempotent and convergent.
//!
//! [`register`]: Registrar::register
//! [`unregister`]: Registrar::unregister

pub mod error;
pub mod transit_gateway;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::Cluster;

pub use error::RegisterError;
pub use transit_gateway::TransitGatewayRegistrar;

/// Convergence operations the reconcile engine drives per cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Converge AWS resources for the cluster. May patch annotations on the
    /// way; the passed record is updated to the patched object.
    async fn register(&self, cluster: &mut Cluster) -> Result<(), RegisterError>;

    /// Tear down the AWS resources recorded for the cluster. Already absent
    /// resources are treated as removed.
    async fn unregister(&self, cluster: &Cluster) -> Result<(), RegisterError>;
}
