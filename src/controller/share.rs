//! Resource share reconciler
//!
//! Shares the transit gateway and prefix list with workload cluster accounts
//! via RAM. Runs independently of the network topology reconciler over the
//! same Cluster stream and is only active in GiantSwarmManaged mode. Shares
//! are only deleted once the network topology finalizer is gone, so the
//! attachment teardown in the workload account still has access to the
//! shared gateway.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations::{self, NetworkTopologyMode};
use crate::aws::ram::RamClient;
use crate::aws::types::ResourceShare;
use crate::aws::Arn;
use crate::controller::network_topology;
use crate::crd::Cluster;
use crate::error::Error;
use crate::k8s::{self, ClusterRef, ClusterRepository};
use crate::metrics;

/// Finalizer guarding RAM share teardown
pub const FINALIZER: &str = "network-topology.finalizers.giantswarm.io/share";

const RECONCILER: &str = "resource-share";
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state of the resource share reconciler
pub struct Context {
    pub repository: Arc<dyn ClusterRepository>,
    pub ram_client: Arc<dyn RamClient>,
}

/// Run the resource share controller until shutdown
pub async fn run(client: Client, ctx: Arc<Context>) {
    let clusters: Api<Cluster> = Api::all(client);

    info!("starting resource share controller");
    Controller::new(clusters, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(cluster) => debug!(?cluster, "reconciled"),
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        })
        .await;
    info!("resource share controller stopped");
}

/// Reconcile one Cluster event
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    metrics::RECONCILIATIONS.with_label_values(&[RECONCILER]).inc();
    let timer = metrics::RECONCILE_DURATION
        .with_label_values(&[RECONCILER])
        .start_timer();

    let result = reconcile_inner(ClusterRef::from(cluster.as_ref()), ctx).await;

    timer.observe_duration();
    if result.is_err() {
        metrics::RECONCILIATION_ERRORS
            .with_label_values(&[RECONCILER])
            .inc();
    }
    result
}

async fn reconcile_inner(cluster_ref: ClusterRef, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling");

    let cluster = match ctx.repository.get(&cluster_ref).await {
        Ok(cluster) => cluster,
        Err(err) if err.is_not_found() => {
            info!("cluster no longer exists");
            return Ok(Action::await_change());
        }
        Err(err) => return Err(err),
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        info!("reconciling delete");
        return reconcile_delete(cluster, ctx).await;
    }

    reconcile_normal(cluster, ctx).await
}

async fn reconcile_normal(cluster: Cluster, ctx: Arc<Context>) -> Result<Action, Error> {
    if annotations::mode(&cluster)? != Some(NetworkTopologyMode::GiantSwarmManaged) {
        debug!("cluster does not use a managed topology, nothing to share");
        return Ok(Action::await_change());
    }

    let workload_account_id = workload_account_id(&cluster, ctx.repository.as_ref()).await?;

    let shares = [
        (
            annotations::transit_gateway(&cluster),
            transit_gateway_share_name(&cluster),
        ),
        (
            annotations::prefix_list(&cluster),
            prefix_list_share_name(&cluster),
        ),
    ];

    let mut cluster = cluster;
    let mut finalizer_added = false;
    for (annotation, share_name) in shares {
        let Some(value) = annotation else {
            info!(share = %share_name, "annotation not set yet, skipping share");
            continue;
        };
        let resource_arn: Arn = value.parse()?;

        if resource_arn.account_id == workload_account_id {
            info!(share = %share_name, "resource in same account as cluster, skipping");
            continue;
        }

        // sharing either resource warrants the finalizer so cleanup stays
        // symmetric
        if !finalizer_added {
            cluster = ctx.repository.add_finalizer(&cluster, FINALIZER).await?;
            finalizer_added = true;
        }

        ctx.ram_client
            .apply_resource_share(&ResourceShare {
                name: share_name,
                resource_arns: vec![resource_arn.to_string()],
                external_account_id: workload_account_id.clone(),
            })
            .await?;
    }

    Ok(Action::await_change())
}

async fn reconcile_delete(cluster: Cluster, ctx: Arc<Context>) -> Result<Action, Error> {
    if k8s::contains_finalizer(&cluster, network_topology::FINALIZER) {
        info!("waiting for network topology teardown before deleting shares");
        return Ok(Action::await_change());
    }

    ctx.ram_client
        .delete_resource_share(&transit_gateway_share_name(&cluster))
        .await?;
    ctx.ram_client
        .delete_resource_share(&prefix_list_share_name(&cluster))
        .await?;

    ctx.repository.remove_finalizer(&cluster, FINALIZER).await?;
    Ok(Action::await_change())
}

/// AWS account of the workload cluster, read off its role identity ARN
async fn workload_account_id(
    cluster: &Cluster,
    repository: &dyn ClusterRepository,
) -> Result<String, Error> {
    let infra_ref = k8s::infrastructure_ref(cluster)?;
    let identity = repository.get_role_identity(&infra_ref).await?;
    let role_arn: Arn = identity.spec.role_arn.parse()?;
    Ok(role_arn.account_id)
}

fn transit_gateway_share_name(cluster: &Cluster) -> String {
    format!("{}-transit-gateway", cluster.name_any())
}

fn prefix_list_share_name(cluster: &Cluster) -> String {
    format!("{}-prefix-list", cluster.name_any())
}

/// Requeue policy for transport-class failures
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(cluster = %cluster.name_any(), error = %error, "reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    use kube::api::ObjectMeta;

    use crate::aws::ram::MockRamClient;
    use crate::crd::{
        AWSClusterRoleIdentity, AWSClusterRoleIdentitySpec, ClusterSpec, InfrastructureRef,
    };
    use crate::k8s::MockClusterRepository;

    const TGW_ARN: &str = "arn:aws:ec2:eu-west-1:123456789012:transit-gateway/tgw-0abc";
    const PL_ARN: &str = "arn:aws:ec2:eu-west-1:123456789012:prefix-list/pl-0def";
    const WC_ACCOUNT: &str = "987654321098";
    const MC_ACCOUNT: &str = "123456789012";

    fn cluster(name: &str, entries: &[(&str, &str)]) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("org-acme".to_string()),
                annotations: Some(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: ClusterSpec {
                paused: None,
                infrastructure_ref: Some(InfrastructureRef {
                    name: name.to_string(),
                    namespace: "org-acme".to_string(),
                    ..Default::default()
                }),
            },
            status: None,
        }
    }

    fn deleting_cluster(name: &str, finalizers: &[&str]) -> Cluster {
        let mut cluster = cluster(name, &[]);
        cluster.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        cluster.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        cluster
    }

    fn identity_in(account: &str) -> AWSClusterRoleIdentity {
        AWSClusterRoleIdentity {
            metadata: Default::default(),
            spec: AWSClusterRoleIdentitySpec {
                role_arn: format!("arn:aws:iam::{account}:role/capa-controller"),
                external_id: None,
            },
        }
    }

    fn repository_serving(cluster: Cluster, account: &'static str) -> MockClusterRepository {
        let mut repository = MockClusterRepository::new();
        repository
            .expect_get()
            .returning(move |_| Ok(cluster.clone()));
        repository
            .expect_get_role_identity()
            .returning(move |_| Ok(identity_in(account)));
        repository.expect_add_finalizer().returning(|cluster, finalizer| {
            let mut updated = cluster.clone();
            updated
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string());
            Ok(updated)
        });
        repository
    }

    async fn run_reconcile(
        cluster: Cluster,
        repository: MockClusterRepository,
        ram: MockRamClient,
    ) -> Result<Action, Error> {
        let ctx = Arc::new(Context {
            repository: Arc::new(repository),
            ram_client: Arc::new(ram),
        });
        reconcile(Arc::new(cluster), ctx).await
    }

    #[tokio::test]
    async fn non_managed_topologies_are_ignored() {
        for mode in ["None", "UserManaged"] {
            let c = cluster("wc1", &[(annotations::MODE, mode)]);
            let mut repository = MockClusterRepository::new();
            let served = c.clone();
            repository.expect_get().returning(move |_| Ok(served.clone()));

            // RAM mock without expectations: any share call panics.
            run_reconcile(c, repository, MockRamClient::new())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn cross_account_clusters_get_both_shares_and_the_finalizer() {
        let c = cluster(
            "wc1",
            &[
                (annotations::MODE, "GiantSwarmManaged"),
                (annotations::TRANSIT_GATEWAY, TGW_ARN),
                (annotations::PREFIX_LIST, PL_ARN),
            ],
        );

        let repository = repository_serving(c.clone(), WC_ACCOUNT);

        let mut ram = MockRamClient::new();
        ram.expect_apply_resource_share()
            .times(1)
            .withf(|share| {
                share.name == "wc1-transit-gateway"
                    && share.resource_arns == vec![TGW_ARN.to_string()]
                    && share.external_account_id == WC_ACCOUNT
            })
            .returning(|_| Ok(()));
        ram.expect_apply_resource_share()
            .times(1)
            .withf(|share| {
                share.name == "wc1-prefix-list"
                    && share.resource_arns == vec![PL_ARN.to_string()]
                    && share.external_account_id == WC_ACCOUNT
            })
            .returning(|_| Ok(()));

        run_reconcile(c, repository, ram).await.unwrap();
    }

    #[tokio::test]
    async fn same_account_clusters_need_no_share() {
        let c = cluster(
            "wc1",
            &[
                (annotations::MODE, "GiantSwarmManaged"),
                (annotations::TRANSIT_GATEWAY, TGW_ARN),
                (annotations::PREFIX_LIST, PL_ARN),
            ],
        );

        let mut repository = MockClusterRepository::new();
        let served = c.clone();
        repository.expect_get().returning(move |_| Ok(served.clone()));
        repository
            .expect_get_role_identity()
            .returning(|_| Ok(identity_in(MC_ACCOUNT)));
        // add_finalizer intentionally unexpected: no share, no finalizer.

        run_reconcile(c, repository, MockRamClient::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prefix_list_sharing_proceeds_without_a_gateway_annotation() {
        let c = cluster(
            "wc1",
            &[
                (annotations::MODE, "GiantSwarmManaged"),
                (annotations::PREFIX_LIST, PL_ARN),
            ],
        );

        let mut repository = repository_serving(c.clone(), WC_ACCOUNT);
        repository
            .expect_add_finalizer()
            .times(1)
            .withf(|_, finalizer| finalizer == FINALIZER)
            .returning(|cluster, finalizer| {
                let mut updated = cluster.clone();
                updated
                    .metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .push(finalizer.to_string());
                Ok(updated)
            });

        let mut ram = MockRamClient::new();
        ram.expect_apply_resource_share()
            .times(1)
            .withf(|share| share.name == "wc1-prefix-list")
            .returning(|_| Ok(()));

        run_reconcile(c, repository, ram).await.unwrap();
    }

    #[tokio::test]
    async fn unset_annotations_mean_no_shares_yet() {
        let c = cluster("wc1", &[(annotations::MODE, "GiantSwarmManaged")]);

        let mut repository = MockClusterRepository::new();
        let served = c.clone();
        repository.expect_get().returning(move |_| Ok(served.clone()));
        repository
            .expect_get_role_identity()
            .returning(|_| Ok(identity_in(WC_ACCOUNT)));

        run_reconcile(c, repository, MockRamClient::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn share_deletion_waits_for_the_network_topology_finalizer() {
        let deleting = deleting_cluster("wc1", &[network_topology::FINALIZER, FINALIZER]);

        let mut repository = MockClusterRepository::new();
        let served = deleting.clone();
        repository.expect_get().returning(move |_| Ok(served.clone()));
        repository.expect_remove_finalizer().never();

        // RAM mock without expectations: deleting a share now would panic.
        run_reconcile(deleting, repository, MockRamClient::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shares_are_deleted_once_network_topology_is_gone() {
        let deleting = deleting_cluster("wc1", &[FINALIZER]);

        let mut repository = MockClusterRepository::new();
        let served = deleting.clone();
        repository.expect_get().returning(move |_| Ok(served.clone()));
        repository
            .expect_remove_finalizer()
            .times(1)
            .withf(|_, finalizer| finalizer == FINALIZER)
            .returning(|cluster, _| Ok(cluster.clone()));

        let mut ram = MockRamClient::new();
        ram.expect_delete_resource_share()
            .times(1)
            .withf(|name| name == "wc1-transit-gateway")
            .returning(|_| Ok(()));
        ram.expect_delete_resource_share()
            .times(1)
            .withf(|name| name == "wc1-prefix-list")
            .returning(|_| Ok(()));

        run_reconcile(deleting, repository, ram).await.unwrap();
    }

    #[tokio::test]
    async fn failed_share_deletion_keeps_the_finalizer() {
        let deleting = deleting_cluster("wc1", &[FINALIZER]);

        let mut repository = MockClusterRepository::new();
        let served = deleting.clone();
        repository.expect_get().returning(move |_| Ok(served.clone()));
        repository.expect_remove_finalizer().never();

        let mut ram = MockRamClient::new();
        ram.expect_delete_resource_share()
            .returning(|_| Err(Error::aws("DeleteResourceShare denied")));

        let err = run_reconcile(deleting, repository, ram).await.unwrap_err();
        assert!(err.to_string().contains("DeleteResourceShare"));
    }
}
