//! Typed access to the management-plane object store
//!
//! The [`ClusterRepository`] trait is the only seam through which the
//! reconcilers and registrars touch Kubernetes. Production wires the kube
//! client implementation, tests supply mocks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{AWSCluster, AWSClusterRoleIdentity, Cluster};
use crate::error::{Error, Result};

/// Name and namespace of a cluster-scoped object pair
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
}

impl ClusterRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Cluster> for ClusterRef {
    fn from(cluster: &Cluster) -> Self {
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
        }
    }
}

/// True when the object carries the given finalizer
pub fn contains_finalizer(cluster: &Cluster, finalizer: &str) -> bool {
    cluster.finalizers().iter().any(|f| f == finalizer)
}

/// Returns the infrastructure cluster reference of a Cluster
pub fn infrastructure_ref(cluster: &Cluster) -> Result<ClusterRef> {
    let infra = cluster.spec.infrastructure_ref.as_ref().ok_or_else(|| {
        Error::validation(format!(
            "cluster {} has no infrastructure reference",
            ClusterRef::from(cluster)
        ))
    })?;

    let namespace = if infra.namespace.is_empty() {
        cluster.namespace().unwrap_or_default()
    } else {
        infra.namespace.clone()
    };
    Ok(ClusterRef::new(infra.name.clone(), namespace))
}

/// Object-store operations consumed by the reconcilers and registrars
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRepository: Send + Sync {
    /// Fetch a Cluster by reference
    async fn get(&self, cluster_ref: &ClusterRef) -> Result<Cluster>;

    /// Fetch the AWS infrastructure cluster by reference
    async fn get_aws_cluster(&self, cluster_ref: &ClusterRef) -> Result<AWSCluster>;

    /// Fetch the role identity referenced by the AWS cluster at the given reference
    async fn get_role_identity(&self, cluster_ref: &ClusterRef) -> Result<AWSClusterRoleIdentity>;

    /// Fetch the management cluster configured at startup
    async fn get_management_cluster(&self) -> Result<Cluster>;

    /// Reference of the management cluster configured at startup
    fn management_cluster_ref(&self) -> ClusterRef;

    /// Add a finalizer, returning the updated object
    async fn add_finalizer(&self, cluster: &Cluster, finalizer: &str) -> Result<Cluster>;

    /// Remove a finalizer, returning the updated object
    async fn remove_finalizer(&self, cluster: &Cluster, finalizer: &str) -> Result<Cluster>;

    /// Merge-patch annotations onto the cluster, returning the updated object
    async fn patch_annotations(
        &self,
        cluster: &Cluster,
        annotations: BTreeMap<String, String>,
    ) -> Result<Cluster>;

    /// Patch the status subresource with the conditions of the given object
    async fn update_status(&self, cluster: &Cluster) -> Result<()>;

    /// True when the given cluster is the management cluster
    fn is_management_cluster(&self, cluster: &Cluster) -> bool;
}

/// Repository backed by the kube client
pub struct KubeClusterRepository {
    client: Client,
    management_cluster: ClusterRef,
}

impl KubeClusterRepository {
    pub fn new(client: Client, management_cluster: ClusterRef) -> Self {
        Self {
            client,
            management_cluster,
        }
    }

    fn clusters(&self, namespace: &str) -> Api<Cluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterRepository for KubeClusterRepository {
    async fn get(&self, cluster_ref: &ClusterRef) -> Result<Cluster> {
        let cluster = self
            .clusters(&cluster_ref.namespace)
            .get(&cluster_ref.name)
            .await?;
        Ok(cluster)
    }

    async fn get_aws_cluster(&self, cluster_ref: &ClusterRef) -> Result<AWSCluster> {
        let api: Api<AWSCluster> = Api::namespaced(self.client.clone(), &cluster_ref.namespace);
        let cluster = api.get(&cluster_ref.name).await?;
        Ok(cluster)
    }

    async fn get_role_identity(&self, cluster_ref: &ClusterRef) -> Result<AWSClusterRoleIdentity> {
        let aws_cluster = self.get_aws_cluster(cluster_ref).await?;
        let identity_name = aws_cluster
            .spec
            .identity_ref
            .as_ref()
            .map(|r| r.name.clone())
            .ok_or_else(|| {
                Error::validation(format!(
                    "AWSCluster {cluster_ref} has no identity reference"
                ))
            })?;

        let api: Api<AWSClusterRoleIdentity> = Api::all(self.client.clone());
        let identity = api.get(&identity_name).await?;
        Ok(identity)
    }

    async fn get_management_cluster(&self) -> Result<Cluster> {
        self.get(&self.management_cluster).await
    }

    fn management_cluster_ref(&self) -> ClusterRef {
        self.management_cluster.clone()
    }

    async fn add_finalizer(&self, cluster: &Cluster, finalizer: &str) -> Result<Cluster> {
        if contains_finalizer(cluster, finalizer) {
            return Ok(cluster.clone());
        }

        let mut finalizers = cluster.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(cluster, finalizers).await
    }

    async fn remove_finalizer(&self, cluster: &Cluster, finalizer: &str) -> Result<Cluster> {
        if !contains_finalizer(cluster, finalizer) {
            return Ok(cluster.clone());
        }

        let finalizers = cluster
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(cluster, finalizers).await
    }

    async fn patch_annotations(
        &self,
        cluster: &Cluster,
        annotations: BTreeMap<String, String>,
    ) -> Result<Cluster> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations,
                "resourceVersion": cluster.resource_version(),
            }
        });

        let updated = self
            .clusters(&cluster.namespace().unwrap_or_default())
            .patch(
                &cluster.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    async fn update_status(&self, cluster: &Cluster) -> Result<()> {
        let Some(status) = cluster.status.as_ref() else {
            return Ok(());
        };

        let patch = serde_json::json!({ "status": status });
        self.clusters(&cluster.namespace().unwrap_or_default())
            .patch_status(
                &cluster.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    fn is_management_cluster(&self, cluster: &Cluster) -> bool {
        cluster.name_any() == self.management_cluster.name
            && cluster.namespace().unwrap_or_default() == self.management_cluster.namespace
    }
}

impl KubeClusterRepository {
    /// Replace the finalizer list under optimistic concurrency; a concurrent
    /// writer surfaces as a Conflict for the host runtime to retry
    async fn patch_finalizers(&self, cluster: &Cluster, finalizers: Vec<String>) -> Result<Cluster> {
        debug!(
            cluster = %ClusterRef::from(cluster),
            ?finalizers,
            "patching finalizers"
        );

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": cluster.resource_version(),
            }
        });

        let updated = self
            .clusters(&cluster.namespace().unwrap_or_default())
            .patch(
                &cluster.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }
}
