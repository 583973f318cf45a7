//! Per-account EC2 client construction and caching
//!
//! VPC attachments must be issued from the account owning the VPC, so the
//! registrar asks the factory for a transit gateway client bound to the
//! workload cluster's account. Clients are built by assuming the cluster's
//! role identity via STS and cached with a soft TTL; credentials refresh
//! inside the SDK, the TTL only bounds the memory of the map.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::BehaviorVersion;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::aws::ec2::{Ec2TransitGatewayClient, TransitGatewayClient};
use crate::error::Result;
use crate::k8s::{ClusterRef, ClusterRepository};

/// Session name stamped on assumed-role credentials
const ASSUME_ROLE_SESSION_NAME: &str = "aws-network-topology-operator";

/// Default soft TTL of cached workload cluster clients
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(300);

/// Load an SDK config with credentials assumed from the given role
pub async fn assume_role_config(
    role_arn: &str,
    external_id: Option<&str>,
) -> aws_config::SdkConfig {
    let mut provider = AssumeRoleProvider::builder(role_arn).session_name(ASSUME_ROLE_SESSION_NAME);
    if let Some(external_id) = external_id {
        provider = provider.external_id(external_id);
    }
    let provider = provider.build().await;

    aws_config::defaults(BehaviorVersion::latest())
        .credentials_provider(provider)
        .load()
        .await
}

/// Provides transit gateway clients bound to a cluster's AWS account
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransitGatewayClientFactory: Send + Sync {
    /// Client for the account of the cluster at the given infrastructure
    /// reference
    async fn client_for_cluster(
        &self,
        cluster_ref: &ClusterRef,
    ) -> Result<Arc<dyn TransitGatewayClient>>;
}

/// Builds a client from an assumed role; split out so the cache can be
/// exercised without STS
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    async fn build<'a>(
        &self,
        role_arn: &'a str,
        external_id: Option<&'a str>,
    ) -> Result<Arc<dyn TransitGatewayClient>>;
}

/// Production client builder assuming roles via STS
pub struct StsClientBuilder;

#[async_trait]
impl ClientBuilder for StsClientBuilder {
    async fn build<'a>(
        &self,
        role_arn: &'a str,
        external_id: Option<&'a str>,
    ) -> Result<Arc<dyn TransitGatewayClient>> {
        debug!(role_arn = %role_arn, "assuming cluster role identity");
        let config = assume_role_config(role_arn, external_id).await;
        Ok(Arc::new(Ec2TransitGatewayClient::new(
            aws_sdk_ec2::Client::new(&config),
        )))
    }
}

struct CacheEntry {
    client: Arc<dyn TransitGatewayClient>,
    built_at: Instant,
}

impl CacheEntry {
    fn new(client: Arc<dyn TransitGatewayClient>) -> Self {
        Self {
            client,
            built_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.built_at.elapsed() < ttl
    }
}

/// TTL-cached factory resolving role identities through the repository
pub struct CachingClientFactory {
    repository: Arc<dyn ClusterRepository>,
    builder: Arc<dyn ClientBuilder>,
    ttl: Duration,
    cache: Mutex<HashMap<ClusterRef, CacheEntry>>,
}

impl CachingClientFactory {
    pub fn new(
        repository: Arc<dyn ClusterRepository>,
        builder: Arc<dyn ClientBuilder>,
        ttl: Duration,
    ) -> Self {
        Self {
            repository,
            builder,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, cluster_ref: &ClusterRef) -> Option<Arc<dyn TransitGatewayClient>> {
        let cache = self.cache.lock().expect("client cache poisoned");
        cache
            .get(cluster_ref)
            .filter(|entry| entry.is_fresh(self.ttl))
            .map(|entry| entry.client.clone())
    }

    /// Insert a freshly built client. When a concurrent reconcile raced us
    /// here and its client is still fresh, the first insert wins and the
    /// newly built client is discarded.
    fn insert(
        &self,
        cluster_ref: ClusterRef,
        client: Arc<dyn TransitGatewayClient>,
    ) -> Arc<dyn TransitGatewayClient> {
        let mut cache = self.cache.lock().expect("client cache poisoned");
        match cache.entry(cluster_ref) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_fresh(self.ttl) {
                    occupied.get().client.clone()
                } else {
                    occupied.insert(CacheEntry::new(client.clone()));
                    client
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(client.clone()));
                client
            }
        }
    }
}

#[async_trait]
impl TransitGatewayClientFactory for CachingClientFactory {
    async fn client_for_cluster(
        &self,
        cluster_ref: &ClusterRef,
    ) -> Result<Arc<dyn TransitGatewayClient>> {
        if let Some(client) = self.cached(cluster_ref) {
            return Ok(client);
        }

        let identity = self.repository.get_role_identity(cluster_ref).await?;
        let client = self
            .builder
            .build(
                &identity.spec.role_arn,
                identity.spec.external_id.as_deref(),
            )
            .await?;

        Ok(self.insert(cluster_ref.clone(), client))
    }
}
