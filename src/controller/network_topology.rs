//! Network topology reconciler
//!
//! Drives the registrars over every Cluster event: pause and delete
//! dispatch, finalizer lifecycle, condition feedback and the requeue policy.
//! Typed registrar failures map to one condition reason each; transport
//! failures propagate and the error policy requeues them.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::annotations;
use crate::conditions;
use crate::crd::Cluster;
use crate::error::Error;
use crate::k8s::{self, ClusterRef, ClusterRepository};
use crate::metrics;
use crate::registrar::{RegisterError, Registrar};

/// Finalizer guarding AWS resource teardown
pub const FINALIZER: &str = "network-topology.finalizers.giantswarm.io";

/// Requeue interval after successful convergence and for unknown errors
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(600);

/// Requeue interval while waiting for external state to become ready
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(60);

const RECONCILER: &str = "network-topology";

/// Shared state of the network topology reconciler
pub struct Context {
    pub repository: Arc<dyn ClusterRepository>,
    pub registrars: Vec<Arc<dyn Registrar>>,
}

/// Run the network topology controller until shutdown
pub async fn run(client: Client, ctx: Arc<Context>) {
    let clusters: Api<Cluster> = Api::all(client);

    info!("starting network topology controller");
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
    info!("network topology controller stopped");
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

    let mut cluster = match ctx.repository.get(&cluster_ref).await {
        Ok(cluster) => cluster,
        Err(err) if err.is_not_found() => {
            info!("cluster no longer exists");
            return Ok(Action::await_change());
        }
        Err(err) => return Err(err),
    };

    if annotations::is_paused(&cluster) {
        info!("cluster is marked as paused, won't reconcile");
        return Ok(Action::await_change());
    }

    if !conditions::has(&cluster, conditions::NETWORK_TOPOLOGY_READY) {
        conditions::mark_in_progress(&mut cluster);
        // ok to continue if this fails
        let _ = ctx.repository.update_status(&cluster).await;
    }

    if cluster.metadata.deletion_timestamp.is_some() {
        info!("reconciling delete");
        return reconcile_delete(cluster, ctx).await;
    }

    reconcile_normal(cluster, ctx).await
}

async fn reconcile_normal(cluster: Cluster, ctx: Arc<Context>) -> Result<Action, Error> {
    let mut cluster = ctx.repository.add_finalizer(&cluster, FINALIZER).await?;

    let outcome = register_all(&mut cluster, &ctx).await;

    // the condition set by the registrar outcome reaches the status on
    // every exit path of the normal branch
    let _ = ctx.repository.update_status(&cluster).await;

    outcome
}

async fn register_all(cluster: &mut Cluster, ctx: &Context) -> Result<Action, Error> {
    for registrar in &ctx.registrars {
        match registrar.register(cluster).await {
            Ok(()) => {}
            Err(RegisterError::ModeNotSupported { mode }) => {
                conditions::mark_mode_not_supported(cluster, &mode);
                return Ok(Action::await_change());
            }
            Err(RegisterError::TransitGatewayNotAvailable) => {
                conditions::mark_transit_gateway_not_available(cluster);
                return Ok(Action::requeue(NOT_READY_REQUEUE));
            }
            Err(RegisterError::VpcNotReady) => {
                conditions::mark_vpc_not_ready(cluster);
                return Ok(Action::requeue(NOT_READY_REQUEUE));
            }
            Err(RegisterError::IdNotProvided { resource }) => {
                conditions::mark_id_not_provided(cluster, &resource);
                return Ok(Action::await_change());
            }
            Err(err) => return Err(err.into()),
        }
    }

    conditions::mark_ready(cluster);
    Ok(Action::requeue(DEFAULT_REQUEUE))
}

async fn reconcile_delete(cluster: Cluster, ctx: Arc<Context>) -> Result<Action, Error> {
    if !k8s::contains_finalizer(&cluster, FINALIZER) {
        info!("cluster carries no finalizer, nothing to clean up");
        return Ok(Action::await_change());
    }

    // teardown mirrors registration order
    for registrar in ctx.registrars.iter().rev() {
        registrar.unregister(&cluster).await.map_err(Error::from)?;
    }

    ctx.repository.remove_finalizer(&cluster, FINALIZER).await?;
    Ok(Action::await_change())
}

/// Requeue policy for transport-class failures
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(cluster = %cluster.name_any(), error = %error, "reconciliation failed");
    Action::requeue(DEFAULT_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use kube::api::ObjectMeta;

    use crate::crd::{ClusterSpec, ConditionSeverity, ConditionStatus};
    use crate::k8s::MockClusterRepository;
    use crate::registrar::MockRegistrar;

    fn cluster(name: &str, annotations: &[(&str, &str)]) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("org-acme".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: ClusterSpec::default(),
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

    fn not_found() -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }))
    }

    fn assert_action(actual: &Action, expected: &Action) {
        assert_eq!(format!("{actual:?}"), format!("{expected:?}"));
    }

    /// Captures every status written through the repository so tests can
    /// verify condition transitions without coupling to call internals
    #[derive(Clone, Default)]
    struct StatusCapture {
        clusters: Arc<Mutex<Vec<Cluster>>>,
    }

    impl StatusCapture {
        fn record(&self, cluster: Cluster) {
            self.clusters.lock().unwrap().push(cluster);
        }

        fn last_condition(&self) -> Option<crate::crd::Condition> {
            self.clusters
                .lock()
                .unwrap()
                .last()
                .and_then(|c| conditions::get(c, conditions::NETWORK_TOPOLOGY_READY).cloned())
        }

        fn first_condition(&self) -> Option<crate::crd::Condition> {
            self.clusters
                .lock()
                .unwrap()
                .first()
                .and_then(|c| conditions::get(c, conditions::NETWORK_TOPOLOGY_READY).cloned())
        }
    }

    /// Repository that serves the given cluster, passes finalizer patches
    /// through and records status updates
    fn repository_for(cluster: Cluster, capture: StatusCapture) -> MockClusterRepository {
        let mut repository = MockClusterRepository::new();
        repository
            .expect_get()
            .returning(move |_| Ok(cluster.clone()));
        repository.expect_add_finalizer().returning(|cluster, finalizer| {
            let mut updated = cluster.clone();
            updated
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string());
            Ok(updated)
        });
        repository.expect_update_status().returning(move |cluster| {
            capture.record(cluster.clone());
            Ok(())
        });
        repository
    }

    fn registrar_failing_with(
        err: fn() -> RegisterError,
    ) -> Vec<Arc<dyn Registrar>> {
        let mut registrar = MockRegistrar::new();
        registrar.expect_register().returning(move |_| Err(err()));
        vec![Arc::new(registrar)]
    }

    fn succeeding_registrar() -> Vec<Arc<dyn Registrar>> {
        let mut registrar = MockRegistrar::new();
        registrar.expect_register().returning(|_| Ok(()));
        vec![Arc::new(registrar)]
    }

    async fn reconcile_with(
        cluster: Cluster,
        registrars: Vec<Arc<dyn Registrar>>,
    ) -> (Result<Action, Error>, StatusCapture) {
        let capture = StatusCapture::default();
        let repository = repository_for(cluster.clone(), capture.clone());
        let ctx = Arc::new(Context {
            repository: Arc::new(repository),
            registrars,
        });
        let result = reconcile(Arc::new(cluster), ctx).await;
        (result, capture)
    }

    mod dispatch {
        use super::*;

        #[tokio::test]
        async fn a_vanished_cluster_is_success_without_requeue() {
            let mut repository = MockClusterRepository::new();
            repository.expect_get().returning(|_| Err(not_found()));

            let ctx = Arc::new(Context {
                repository: Arc::new(repository),
                registrars: vec![],
            });
            let action = reconcile(Arc::new(cluster("gone", &[])), ctx)
                .await
                .unwrap();
            assert_action(&action, &Action::await_change());
        }

        #[tokio::test]
        async fn transport_errors_on_fetch_propagate() {
            let mut repository = MockClusterRepository::new();
            repository
                .expect_get()
                .returning(|_| Err(Error::aws("connection reset")));

            let ctx = Arc::new(Context {
                repository: Arc::new(repository),
                registrars: vec![],
            });
            let err = reconcile(Arc::new(cluster("wc1", &[])), ctx)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("connection reset"));
        }

        #[tokio::test]
        async fn paused_clusters_are_left_alone() {
            let paused = cluster("wc1", &[(annotations::PAUSED, "")]);

            let mut repository = MockClusterRepository::new();
            let served = paused.clone();
            repository.expect_get().returning(move |_| Ok(served.clone()));

            // No add_finalizer / update_status expectations: any write panics.
            let ctx = Arc::new(Context {
                repository: Arc::new(repository),
                registrars: vec![],
            });
            let action = reconcile(Arc::new(paused), ctx).await.unwrap();
            assert_action(&action, &Action::await_change());
        }

        #[tokio::test]
        async fn the_condition_is_initialized_before_convergence() {
            let (result, capture) =
                reconcile_with(cluster("wc1", &[]), succeeding_registrar()).await;
            result.unwrap();

            let first = capture.first_condition().expect("initial status written");
            assert_eq!(first.status, ConditionStatus::False);
            assert_eq!(first.reason.as_deref(), Some("InProgress"));
            assert_eq!(first.severity, Some(ConditionSeverity::Info));
        }
    }

    mod outcome_mapping {
        use super::*;

        #[tokio::test]
        async fn success_marks_ready_and_requeues_in_ten_minutes() {
            let (result, capture) =
                reconcile_with(cluster("wc1", &[]), succeeding_registrar()).await;

            assert_action(&result.unwrap(), &Action::requeue(DEFAULT_REQUEUE));
            let condition = capture.last_condition().unwrap();
            assert_eq!(condition.status, ConditionStatus::True);
        }

        #[tokio::test]
        async fn mode_not_supported_is_informational_without_requeue() {
            let (result, capture) = reconcile_with(
                cluster("wc1", &[]),
                registrar_failing_with(|| RegisterError::ModeNotSupported {
                    mode: "None".to_string(),
                }),
            )
            .await;

            assert_action(&result.unwrap(), &Action::await_change());
            let condition = capture.last_condition().unwrap();
            assert_eq!(condition.reason.as_deref(), Some("ModeNotSupported"));
            assert_eq!(condition.severity, Some(ConditionSeverity::Info));
        }

        #[tokio::test]
        async fn an_unavailable_gateway_warns_and_retries_in_a_minute() {
            let (result, capture) = reconcile_with(
                cluster("wc1", &[]),
                registrar_failing_with(|| RegisterError::TransitGatewayNotAvailable),
            )
            .await;

            assert_action(&result.unwrap(), &Action::requeue(NOT_READY_REQUEUE));
            let condition = capture.last_condition().unwrap();
            assert_eq!(
                condition.reason.as_deref(),
                Some("TransitGatewayNotAvailable")
            );
            assert_eq!(condition.severity, Some(ConditionSeverity::Warning));
        }

        #[tokio::test]
        async fn a_missing_vpc_retries_in_a_minute() {
            let (result, capture) = reconcile_with(
                cluster("wc1", &[]),
                registrar_failing_with(|| RegisterError::VpcNotReady),
            )
            .await;

            assert_action(&result.unwrap(), &Action::requeue(NOT_READY_REQUEUE));
            let condition = capture.last_condition().unwrap();
            assert_eq!(condition.reason.as_deref(), Some("VPCNotReady"));
            assert_eq!(condition.severity, Some(ConditionSeverity::Info));
        }

        #[tokio::test]
        async fn a_missing_required_id_is_terminal_until_the_spec_changes() {
            let (result, capture) = reconcile_with(
                cluster("wc1", &[]),
                registrar_failing_with(|| RegisterError::IdNotProvided {
                    resource: "TransitGateway".to_string(),
                }),
            )
            .await;

            assert_action(&result.unwrap(), &Action::await_change());
            let condition = capture.last_condition().unwrap();
            assert_eq!(condition.reason.as_deref(), Some("RequiredIDMissing"));
            assert_eq!(condition.severity, Some(ConditionSeverity::Error));
        }

        #[tokio::test]
        async fn transport_failures_propagate_and_leave_the_condition_untouched() {
            let (result, capture) = reconcile_with(
                cluster("wc1", &[]),
                registrar_failing_with(|| {
                    RegisterError::Other(Error::aws("DescribeTransitGateways throttled"))
                }),
            )
            .await;

            let err = result.unwrap_err();
            assert!(err.to_string().contains("throttled"));

            // The failure condition stays whatever it was before (InProgress
            // from initialization); only the next success flips it to True.
            let condition = capture.last_condition().unwrap();
            assert_eq!(condition.reason.as_deref(), Some("InProgress"));
        }

        #[tokio::test]
        async fn repeated_reconciles_of_converged_state_return_the_same_outcome() {
            let converged = {
                let mut c = cluster("wc1", &[]);
                c.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
                conditions::mark_ready(&mut c);
                c
            };

            let (first, _) = reconcile_with(converged.clone(), succeeding_registrar()).await;
            let (second, _) = reconcile_with(converged, succeeding_registrar()).await;
            assert_action(&first.unwrap(), &second.unwrap());
        }
    }

    mod delete_path {
        use super::*;

        #[tokio::test]
        async fn delete_without_our_finalizer_is_a_noop() {
            let deleting = deleting_cluster("wc1", &["some.other/finalizer"]);

            let mut repository = MockClusterRepository::new();
            let served = deleting.clone();
            repository.expect_get().returning(move |_| Ok(served.clone()));
            repository.expect_update_status().returning(|_| Ok(()));

            let mut registrar = MockRegistrar::new();
            registrar.expect_unregister().never();

            let ctx = Arc::new(Context {
                repository: Arc::new(repository),
                registrars: vec![Arc::new(registrar)],
            });
            let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
            assert_action(&action, &Action::await_change());
        }

        #[tokio::test]
        async fn registrars_unregister_in_reverse_order_before_the_finalizer_clears() {
            let deleting = deleting_cluster("wc1", &[FINALIZER]);
            let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();

            let mut first = MockRegistrar::new();
            let order_first = order.clone();
            first.expect_unregister().times(1).returning(move |_| {
                order_first.lock().unwrap().push("first");
                Ok(())
            });

            let mut second = MockRegistrar::new();
            let order_second = order.clone();
            second.expect_unregister().times(1).returning(move |_| {
                order_second.lock().unwrap().push("second");
                Ok(())
            });

            let mut repository = MockClusterRepository::new();
            let served = deleting.clone();
            repository.expect_get().returning(move |_| Ok(served.clone()));
            repository.expect_update_status().returning(|_| Ok(()));
            repository
                .expect_remove_finalizer()
                .times(1)
                .withf(|_, finalizer| finalizer == FINALIZER)
                .returning(|cluster, _| Ok(cluster.clone()));

            let ctx = Arc::new(Context {
                repository: Arc::new(repository),
                registrars: vec![Arc::new(first), Arc::new(second)],
            });
            reconcile(Arc::new(deleting), ctx).await.unwrap();

            assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
        }

        #[tokio::test]
        async fn a_failed_teardown_keeps_the_finalizer() {
            let deleting = deleting_cluster("wc1", &[FINALIZER]);

            let mut registrar = MockRegistrar::new();
            registrar
                .expect_unregister()
                .returning(|_| Err(RegisterError::Other(Error::aws("DeleteTransitGatewayVpcAttachment failed"))));

            let mut repository = MockClusterRepository::new();
            let served = deleting.clone();
            repository.expect_get().returning(move |_| Ok(served.clone()));
            repository.expect_update_status().returning(|_| Ok(()));
            repository.expect_remove_finalizer().never();

            let ctx = Arc::new(Context {
                repository: Arc::new(repository),
                registrars: vec![Arc::new(registrar)],
            });
            let err = reconcile(Arc::new(deleting), ctx).await.unwrap_err();
            assert!(err.to_string().contains("DeleteTransitGatewayVpcAttachment"));
        }
    }

    mod requeue_policy {
        use super::*;

        #[test]
        fn unknown_errors_requeue_after_ten_minutes() {
            let ctx = Arc::new(Context {
                repository: Arc::new(MockClusterRepository::new()),
                registrars: vec![],
            });
            let action = error_policy(
                Arc::new(cluster("wc1", &[])),
                &Error::aws("throttled"),
                ctx,
            );
            assert_action(&action, &Action::requeue(DEFAULT_REQUEUE));
        }
    }
}
