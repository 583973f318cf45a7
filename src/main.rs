//! AWS network topology operator
//!
//! Entry point: parses configuration, connects to the Kubernetes API,
//! bootstraps the management-account AWS clients by assuming the management
//! cluster's role identity, and runs the two reconcilers plus the metrics
//! and probe servers until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aws_network_topology_operator::aws::{
    assume_role_config, CachingClientFactory, Ec2TransitGatewayClient, SdkRamClient, SdkSnsClient,
    StsClientBuilder,
};
use aws_network_topology_operator::controller::{network_topology, share};
use aws_network_topology_operator::k8s::{ClusterRef, ClusterRepository, KubeClusterRepository};
use aws_network_topology_operator::metrics;
use aws_network_topology_operator::registrar::{Registrar, TransitGatewayRegistrar};

/// Operator maintaining AWS transit gateway topologies for cluster fleets
#[derive(Parser, Debug)]
#[command(name = "aws-network-topology-operator", version, about, long_about = None)]
struct Cli {
    /// Name of the Cluster CR for the management cluster
    #[arg(long, env = "MANAGEMENT_CLUSTER_NAME")]
    management_cluster_name: String,

    /// Namespace of the Cluster CR for the management cluster
    #[arg(long, env = "MANAGEMENT_CLUSTER_NAMESPACE")]
    management_cluster_namespace: String,

    /// SNS topic for attachment requests in UserManaged mode
    #[arg(long, env = "SNS_TOPIC", default_value = "")]
    sns_topic: String,

    /// Address the metrics endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    /// Address the health probe endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// Enable leader election for the controller
    #[arg(long, default_value_t = false)]
    leader_elect: bool,

    /// Delete the management cluster's transit gateway when the management
    /// cluster itself is deleted
    #[arg(long, default_value_t = false)]
    delete_unused_transit_gateways: bool,

    /// Soft TTL of cached workload cluster AWS clients, in seconds
    #[arg(long, default_value_t = 300)]
    client_cache_ttl_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if cli.management_cluster_name.is_empty() || cli.management_cluster_namespace.is_empty() {
        anyhow::bail!("management-cluster-name and management-cluster-namespace are required");
    }

    info!("starting aws-network-topology-operator");
    if cli.leader_elect {
        info!("leader election requested; relying on the platform's single-active-replica handling");
    }

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    info!("connected to the kubernetes api server");

    let management_cluster = ClusterRef::new(
        cli.management_cluster_name.clone(),
        cli.management_cluster_namespace.clone(),
    );
    let repository: Arc<dyn ClusterRepository> = Arc::new(KubeClusterRepository::new(
        client.clone(),
        management_cluster.clone(),
    ));

    // Management-account clients are bootstrapped once; failing here means
    // the operator cannot do anything useful, so it exits.
    let identity = repository
        .get_role_identity(&management_cluster)
        .await
        .context("failed to get the management cluster's role identity")?;
    info!(role_arn = %identity.spec.role_arn, "assuming management cluster role identity");
    let config = assume_role_config(
        &identity.spec.role_arn,
        identity.spec.external_id.as_deref(),
    )
    .await;

    let transit_gateway_client = Arc::new(Ec2TransitGatewayClient::new(aws_sdk_ec2::Client::new(
        &config,
    )));
    let ram_client = Arc::new(SdkRamClient::new(aws_sdk_ram::Client::new(&config)));
    let sns_client = Arc::new(SdkSnsClient::new(
        aws_sdk_sns::Client::new(&config),
        cli.sns_topic.clone(),
    ));

    let client_factory = Arc::new(CachingClientFactory::new(
        repository.clone(),
        Arc::new(StsClientBuilder),
        Duration::from_secs(cli.client_cache_ttl_seconds),
    ));

    let registrars: Vec<Arc<dyn Registrar>> = vec![Arc::new(TransitGatewayRegistrar::new(
        transit_gateway_client,
        repository.clone(),
        client_factory,
        sns_client,
        cli.delete_unused_transit_gateways,
    ))];

    let network_topology_ctx = Arc::new(network_topology::Context {
        repository: repository.clone(),
        registrars,
    });
    let share_ctx = Arc::new(share::Context {
        repository,
        ram_client,
    });

    let metrics_server = tokio::spawn(metrics::serve_metrics(cli.metrics_bind_address));
    let probe_server = tokio::spawn(metrics::serve_probes(cli.health_probe_bind_address));
    let network_topology_controller =
        tokio::spawn(network_topology::run(client.clone(), network_topology_ctx));
    let share_controller = tokio::spawn(share::run(client, share_ctx));

    tokio::select! {
        _ = network_topology_controller => {
            error!("network topology controller exited unexpectedly");
        }
        _ = share_controller => {
            error!("resource share controller exited unexpectedly");
        }
        result = metrics_server => {
            if let Ok(Err(err)) = result {
                error!(error = %err, "metrics server failed");
            }
        }
        result = probe_server => {
            if let Ok(Err(err)) = result {
                error!(error = %err, "health probe server failed");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, stopping operator");
        }
    }

    info!("aws-network-topology-operator stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,aws_network_topology_operator=debug,kube=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for SIGTERM or ctrl-c
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c signal"),
        _ = terminate => info!("received SIGTERM signal"),
    }
}
