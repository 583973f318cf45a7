//! Reconcile engine
//!
//! Two reconcilers share the Cluster event stream: `network_topology`
//! converges AWS resources through the registrars, `share` maintains the
//! cross-account RAM shares. They run as independent controllers; ordering
//! between them is enforced only through finalizers.

pub mod network_topology;
pub mod share;
