//! Transit gateway and prefix list convergence
//!
//! Branches on the topology mode annotation:
//!
//! - `UserManaged`: the customer supplied transit gateway and prefix list
//!   ids; the registrar validates they exist, attaches the cluster VPC,
//!   announces pending attachments via SNS and installs subnet routes.
//! - `GiantSwarmManaged`: the registrar owns the transit gateway and prefix
//!   list on the management cluster; workload clusters reuse them, attach
//!   their VPC and contribute their CIDR to the prefix list. Routes are
//!   managed by a separate subsystem.
//!
//! Gateway and prefix list calls run against the management account;
//! attachment and route calls run against the account owning the VPC,
//! obtained through the client factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::annotations::{self, NetworkTopologyMode};
use crate::aws::arn;
use crate::aws::ec2::TransitGatewayClient;
use crate::aws::factory::TransitGatewayClientFactory;
use crate::aws::sns::SnsClient;
use crate::aws::types::{
    AttachmentAnnouncement, ManagedPrefixList, PrefixListEntry, TransitGateway, VpcAttachment,
    VpcAttachmentSpec,
};
use crate::crd::{AWSCluster, Cluster};
use crate::error::Error;
use crate::k8s::{self, ClusterRepository};
use crate::registrar::{RegisterError, Registrar};

/// Registrar converging transit gateways, attachments and prefix lists
pub struct TransitGatewayRegistrar {
    /// Gateway and prefix list operations in the management account
    transit_gateway_client: Arc<dyn TransitGatewayClient>,
    repository: Arc<dyn ClusterRepository>,
    /// Attachment and route operations in the VPC-owning account
    client_factory: Arc<dyn TransitGatewayClientFactory>,
    sns_client: Arc<dyn SnsClient>,
    /// Explicit opt-in for deleting the management cluster's gateway on
    /// management cluster deletion
    delete_unused_transit_gateways: bool,
}

fn entry_description(cluster_name: &str) -> String {
    format!("CIDR block for cluster {cluster_name}")
}

impl TransitGatewayRegistrar {
    pub fn new(
        transit_gateway_client: Arc<dyn TransitGatewayClient>,
        repository: Arc<dyn ClusterRepository>,
        client_factory: Arc<dyn TransitGatewayClientFactory>,
        sns_client: Arc<dyn SnsClient>,
        delete_unused_transit_gateways: bool,
    ) -> Self {
        Self {
            transit_gateway_client,
            repository,
            client_factory,
            sns_client,
            delete_unused_transit_gateways,
        }
    }

    async fn register_user_managed(&self, cluster: &mut Cluster) -> Result<(), RegisterError> {
        let cluster_name = cluster.name_any();

        let prefix_list_value =
            annotations::prefix_list(cluster).ok_or(RegisterError::IdNotProvided {
                resource: "PrefixList".to_string(),
            })?;

        let gateway = if self.repository.is_management_cluster(cluster) {
            let value =
                annotations::transit_gateway(cluster).ok_or(RegisterError::IdNotProvided {
                    resource: "TransitGateway".to_string(),
                })?;
            self.describe_existing_gateway(&value).await?
        } else {
            self.inherited_or_own_gateway(cluster).await?
        };
        self.persist_transit_gateway_arn(cluster, &gateway).await?;

        let prefix_list = self.describe_existing_prefix_list(&prefix_list_value).await?;
        self.persist_prefix_list_arn(cluster, &prefix_list).await?;

        let aws_cluster = self.aws_cluster_for(cluster).await?;
        check_network_ready(&gateway, &aws_cluster)?;
        let workload_client = self.workload_client_for(cluster).await?;

        let attachment = self
            .ensure_attachment(&cluster_name, &gateway, &aws_cluster, workload_client.as_ref())
            .await?;

        if attachment.state.is_awaiting_acceptance() {
            info!(attachment_id = %attachment.id, "announcing pending attachment");
            self.sns_client
                .publish_attachment_announcement(&AttachmentAnnouncement {
                    account_id: attachment.vpc_owner_id.clone(),
                    attachment_id: attachment.id.clone(),
                    cidr: aws_cluster.spec.network.vpc.cidr_block.clone(),
                    cluster_name: cluster_name.clone(),
                })
                .await?;
        }

        self.ensure_routes(
            workload_client.as_ref(),
            &gateway.id,
            &prefix_list.id,
            &aws_cluster,
        )
        .await?;

        Ok(())
    }

    async fn register_giantswarm_managed(&self, cluster: &mut Cluster) -> Result<(), RegisterError> {
        let cluster_name = cluster.name_any();

        let gateway = if self.repository.is_management_cluster(cluster) {
            match self.gateway_from_annotation(cluster).await? {
                Some(gateway) => gateway,
                None => {
                    info!("no existing transit gateway found, creating a new one");
                    self.transit_gateway_client
                        .create_transit_gateway(&cluster_name)
                        .await?
                }
            }
        } else {
            self.inherited_or_own_gateway(cluster).await?
        };
        self.persist_transit_gateway_arn(cluster, &gateway).await?;

        let aws_cluster = self.aws_cluster_for(cluster).await?;
        check_network_ready(&gateway, &aws_cluster)?;
        let workload_client = self.workload_client_for(cluster).await?;

        self.ensure_attachment(&cluster_name, &gateway, &aws_cluster, workload_client.as_ref())
            .await?;

        let prefix_list = self.ensure_prefix_list_entry(&aws_cluster).await?;
        self.persist_prefix_list_arn(cluster, &prefix_list).await?;

        Ok(())
    }

    async fn unregister_user_managed(&self, cluster: &Cluster) -> Result<(), RegisterError> {
        let Some(aws_cluster) = self.aws_cluster_for_teardown(cluster).await? else {
            return Ok(());
        };
        let workload_client = self.workload_client_for(cluster).await?;

        self.remove_routes(workload_client.as_ref(), cluster, &aws_cluster)
            .await;
        self.detach(workload_client.as_ref(), cluster, &aws_cluster)
            .await?;
        Ok(())
    }

    async fn unregister_giantswarm_managed(&self, cluster: &Cluster) -> Result<(), RegisterError> {
        let Some(aws_cluster) = self.aws_cluster_for_teardown(cluster).await? else {
            return Ok(());
        };

        self.remove_prefix_list_entry(&aws_cluster).await?;

        let workload_client = self.workload_client_for(cluster).await?;
        self.detach(workload_client.as_ref(), cluster, &aws_cluster)
            .await?;

        if self.repository.is_management_cluster(cluster) {
            if !self.delete_unused_transit_gateways {
                info!("transit gateway deletion is disabled, leaving the gateway in place");
                return Ok(());
            }
            if let Some(value) = annotations::transit_gateway(cluster) {
                let gateway_id = arn::resource_id(&value).map_err(RegisterError::from)?;
                info!(transit_gateway_id = %gateway_id, "deleting transit gateway");
                self.transit_gateway_client
                    .delete_transit_gateway(&gateway_id)
                    .await?;
            }
        }

        Ok(())
    }

    /// Resolve the gateway annotation into an observed gateway, or None when
    /// the annotation is unset
    async fn gateway_from_annotation(
        &self,
        cluster: &Cluster,
    ) -> Result<Option<TransitGateway>, RegisterError> {
        let Some(value) = annotations::transit_gateway(cluster) else {
            return Ok(None);
        };
        let gateway_id = arn::resource_id(&value).map_err(RegisterError::from)?;
        Ok(self
            .transit_gateway_client
            .get_transit_gateway(&gateway_id)
            .await?)
    }

    /// Gateway recorded on this cluster, falling back to the management
    /// cluster's annotation for workload clusters
    async fn inherited_or_own_gateway(
        &self,
        cluster: &Cluster,
    ) -> Result<TransitGateway, RegisterError> {
        let value = match annotations::transit_gateway(cluster) {
            Some(value) => value,
            None => {
                let management_cluster = self.repository.get_management_cluster().await?;
                annotations::transit_gateway(&management_cluster).ok_or_else(|| {
                    RegisterError::Other(Error::validation(
                        "management cluster doesn't have a transit gateway specified",
                    ))
                })?
            }
        };

        self.describe_existing_gateway(&value).await
    }

    async fn describe_existing_gateway(
        &self,
        value: &str,
    ) -> Result<TransitGateway, RegisterError> {
        let gateway_id = arn::resource_id(value).map_err(RegisterError::from)?;
        self.transit_gateway_client
            .get_transit_gateway(&gateway_id)
            .await?
            .ok_or_else(|| {
                RegisterError::Other(Error::validation(
                    "failed to find transit gateway for provided ID",
                ))
            })
    }

    async fn describe_existing_prefix_list(
        &self,
        value: &str,
    ) -> Result<ManagedPrefixList, RegisterError> {
        let prefix_list_id = arn::resource_id(value).map_err(RegisterError::from)?;
        self.transit_gateway_client
            .get_prefix_list(&prefix_list_id)
            .await?
            .ok_or_else(|| {
                RegisterError::Other(Error::validation(
                    "failed to find prefix list for provided ID",
                ))
            })
    }

    /// Record the gateway ARN on the cluster; bare ids from older revisions
    /// are rewritten to the ARN form here
    async fn persist_transit_gateway_arn(
        &self,
        cluster: &mut Cluster,
        gateway: &TransitGateway,
    ) -> Result<(), RegisterError> {
        if annotations::transit_gateway(cluster).as_deref() == Some(gateway.arn.as_str()) {
            return Ok(());
        }

        debug!(transit_gateway_arn = %gateway.arn, "recording transit gateway on cluster");
        *cluster = self
            .repository
            .patch_annotations(
                cluster,
                annotations::patch(annotations::TRANSIT_GATEWAY, &gateway.arn),
            )
            .await?;
        Ok(())
    }

    async fn persist_prefix_list_arn(
        &self,
        cluster: &mut Cluster,
        prefix_list: &ManagedPrefixList,
    ) -> Result<(), RegisterError> {
        if annotations::prefix_list(cluster).as_deref() == Some(prefix_list.arn.as_str()) {
            return Ok(());
        }

        debug!(prefix_list_arn = %prefix_list.arn, "recording prefix list on cluster");
        *cluster = self
            .repository
            .patch_annotations(
                cluster,
                annotations::patch(annotations::PREFIX_LIST, &prefix_list.arn),
            )
            .await?;
        Ok(())
    }

    async fn aws_cluster_for(&self, cluster: &Cluster) -> Result<AWSCluster, RegisterError> {
        let infra_ref = k8s::infrastructure_ref(cluster).map_err(RegisterError::from)?;
        Ok(self.repository.get_aws_cluster(&infra_ref).await?)
    }

    /// AWSCluster for teardown; an already deleted infrastructure cluster
    /// means there is nothing left to detach
    async fn aws_cluster_for_teardown(
        &self,
        cluster: &Cluster,
    ) -> Result<Option<AWSCluster>, RegisterError> {
        let Ok(infra_ref) = k8s::infrastructure_ref(cluster) else {
            warn!("cluster has no infrastructure reference, skipping teardown");
            return Ok(None);
        };

        match self.repository.get_aws_cluster(&infra_ref).await {
            Ok(aws_cluster) => Ok(Some(aws_cluster)),
            Err(err) if err.is_not_found() => {
                info!("AWSCluster is already deleted, skipping transit gateway teardown");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn workload_client_for(
        &self,
        cluster: &Cluster,
    ) -> Result<Arc<dyn TransitGatewayClient>, RegisterError> {
        let infra_ref = k8s::infrastructure_ref(cluster).map_err(RegisterError::from)?;
        Ok(self.client_factory.client_for_cluster(&infra_ref).await?)
    }

    /// Reuse or create the VPC attachment in the VPC-owning account
    async fn ensure_attachment(
        &self,
        cluster_name: &str,
        gateway: &TransitGateway,
        aws_cluster: &AWSCluster,
        workload_client: &dyn TransitGatewayClient,
    ) -> Result<VpcAttachment, RegisterError> {
        let vpc_id = aws_cluster.spec.network.vpc.id.clone();
        let existing = workload_client
            .get_vpc_attachments(&gateway.id, &vpc_id)
            .await?;
        if let Some(attachment) = existing.into_iter().next() {
            return Ok(attachment);
        }

        let subnet_ids = self
            .select_attachment_subnets(workload_client, aws_cluster)
            .await?;
        if subnet_ids.is_empty() {
            return Err(RegisterError::Other(Error::validation(
                "cluster network not yet available on AWSCluster resource",
            )));
        }

        let attachment = workload_client
            .create_vpc_attachment(&VpcAttachmentSpec {
                transit_gateway_id: gateway.id.clone(),
                vpc_id,
                subnet_ids,
                cluster_name: cluster_name.to_string(),
                aws_cluster_name: aws_cluster.name_any(),
            })
            .await?;
        Ok(attachment)
    }

    /// One private subnet per availability zone. Subnets labelled for
    /// gateway attachment take precedence; the declared private subnets of
    /// the AWSCluster are the fallback.
    async fn select_attachment_subnets(
        &self,
        workload_client: &dyn TransitGatewayClient,
        aws_cluster: &AWSCluster,
    ) -> Result<Vec<String>, RegisterError> {
        let tagged = workload_client
            .get_tagged_private_subnets(&aws_cluster.spec.network.vpc.id, &aws_cluster.name_any())
            .await?;

        let mut by_zone: BTreeMap<String, String> = BTreeMap::new();
        for subnet in tagged {
            by_zone.entry(subnet.availability_zone).or_insert(subnet.id);
        }

        if by_zone.is_empty() {
            for subnet in &aws_cluster.spec.network.subnets {
                if subnet.is_public || subnet.id.is_empty() {
                    continue;
                }
                by_zone
                    .entry(subnet.availability_zone.clone())
                    .or_insert_with(|| subnet.id.clone());
            }
        }

        Ok(by_zone.into_values().collect())
    }

    async fn detach(
        &self,
        workload_client: &dyn TransitGatewayClient,
        cluster: &Cluster,
        aws_cluster: &AWSCluster,
    ) -> Result<(), RegisterError> {
        let Some(value) = annotations::transit_gateway(cluster) else {
            return Ok(());
        };
        let gateway_id = arn::resource_id(&value).map_err(RegisterError::from)?;
        let vpc_id = &aws_cluster.spec.network.vpc.id;

        let attachments = workload_client
            .get_vpc_attachments(&gateway_id, vpc_id)
            .await?;
        for attachment in attachments {
            workload_client.delete_vpc_attachment(&attachment.id).await?;
        }

        info!(transit_gateway_id = %gateway_id, vpc_id = %vpc_id, "transit gateway detached from VPC");
        Ok(())
    }

    /// Prefix list lookup ladder: id recorded on the management cluster,
    /// then the conventional name, then create
    async fn get_or_create_prefix_list(&self) -> Result<ManagedPrefixList, RegisterError> {
        if let Some(prefix_list) = self.find_prefix_list().await? {
            return Ok(prefix_list);
        }

        let name = self.prefix_list_name();
        Ok(self.transit_gateway_client.create_prefix_list(&name).await?)
    }

    async fn find_prefix_list(&self) -> Result<Option<ManagedPrefixList>, RegisterError> {
        let management_cluster = self.repository.get_management_cluster().await?;

        if let Some(value) = annotations::prefix_list(&management_cluster) {
            if let Ok(prefix_list_id) = arn::resource_id(&value) {
                if let Some(prefix_list) = self
                    .transit_gateway_client
                    .get_prefix_list(&prefix_list_id)
                    .await?
                {
                    return Ok(Some(prefix_list));
                }
            }
            debug!("failed to get prefix list with ID from annotation, falling back to expected prefix list name");
        }

        self.transit_gateway_client
            .get_prefix_list_by_name(&self.prefix_list_name())
            .await
            .map_err(RegisterError::from)
    }

    fn prefix_list_name(&self) -> String {
        let management_cluster = self.repository.management_cluster_ref();
        format!(
            "{}-{}-tgw-prefixlist",
            management_cluster.name, management_cluster.namespace
        )
    }

    /// Converge the cluster CIDR onto the prefix list. A CIDR recorded with
    /// another cluster's description is a conflict, not ours to overwrite.
    async fn ensure_prefix_list_entry(
        &self,
        aws_cluster: &AWSCluster,
    ) -> Result<ManagedPrefixList, RegisterError> {
        let prefix_list = self.get_or_create_prefix_list().await?;
        let cidr = aws_cluster.spec.network.vpc.cidr_block.clone();
        let description = entry_description(&aws_cluster.name_any());

        let entries = self
            .transit_gateway_client
            .get_prefix_list_entries(&prefix_list.id, prefix_list.version)
            .await?;

        for entry in entries {
            if entry.cidr == cidr {
                if entry.description != description {
                    warn!(
                        prefix_list_id = %prefix_list.id,
                        cidr = %cidr,
                        "CIDR already exists on the prefix list and belongs to another cluster"
                    );
                    return Err(RegisterError::ConflictingCidr);
                }
                debug!(prefix_list_id = %prefix_list.id, "entry already exists in prefix list, skipping");
                return Ok(prefix_list);
            }
        }

        self.transit_gateway_client
            .add_prefix_list_entry(
                &prefix_list.id,
                prefix_list.version,
                &PrefixListEntry { cidr, description },
            )
            .await?;
        Ok(prefix_list)
    }

    async fn remove_prefix_list_entry(
        &self,
        aws_cluster: &AWSCluster,
    ) -> Result<(), RegisterError> {
        let Some(prefix_list) = self.find_prefix_list().await? else {
            return Ok(());
        };

        let cidr = aws_cluster.spec.network.vpc.cidr_block.clone();
        let description = entry_description(&aws_cluster.name_any());

        let entries = self
            .transit_gateway_client
            .get_prefix_list_entries(&prefix_list.id, prefix_list.version)
            .await?;

        if entries
            .iter()
            .any(|entry| entry.cidr == cidr && entry.description == description)
        {
            self.transit_gateway_client
                .remove_prefix_list_entry(&prefix_list.id, prefix_list.version, &cidr)
                .await?;
        }

        Ok(())
    }

    /// Install the prefix-list route via the gateway on every route table
    /// associated with the cluster subnets
    async fn ensure_routes(
        &self,
        workload_client: &dyn TransitGatewayClient,
        gateway_id: &str,
        prefix_list_id: &str,
        aws_cluster: &AWSCluster,
    ) -> Result<(), RegisterError> {
        let subnet_ids = declared_subnet_ids(aws_cluster);
        let route_tables = workload_client.get_route_tables(&subnet_ids).await?;

        for route_table in route_tables {
            let exists = route_table.routes.iter().any(|route| {
                route.destination_prefix_list_id.as_deref() == Some(prefix_list_id)
                    && route.transit_gateway_id.as_deref() == Some(gateway_id)
            });
            if exists {
                continue;
            }

            workload_client
                .create_route(&route_table.id, prefix_list_id, gateway_id)
                .await?;
        }

        Ok(())
    }

    /// Best-effort route removal; remaining routes become dangling but must
    /// not block cluster deletion
    async fn remove_routes(
        &self,
        workload_client: &dyn TransitGatewayClient,
        cluster: &Cluster,
        aws_cluster: &AWSCluster,
    ) {
        let Some(value) = annotations::prefix_list(cluster) else {
            return;
        };
        let Ok(prefix_list_id) = arn::resource_id(&value) else {
            warn!(annotation = %value, "unparseable prefix list annotation, skipping route removal");
            return;
        };

        let subnet_ids = declared_subnet_ids(aws_cluster);
        match workload_client.get_route_tables(&subnet_ids).await {
            Ok(route_tables) => {
                for route_table in route_tables {
                    if let Err(err) = workload_client
                        .delete_route(&route_table.id, &prefix_list_id)
                        .await
                    {
                        warn!(
                            route_table_id = %route_table.id,
                            error = %err,
                            "failed to remove route from route table"
                        );
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to get route tables for route removal"),
        }
    }
}

/// Attachments need a provisioned VPC and an available gateway
fn check_network_ready(
    gateway: &TransitGateway,
    aws_cluster: &AWSCluster,
) -> Result<(), RegisterError> {
    if aws_cluster.spec.network.vpc.id.is_empty() {
        info!(transit_gateway_id = %gateway.id, "vpc not yet ready, skipping attachment for now");
        return Err(RegisterError::VpcNotReady);
    }

    if !gateway.state.is_available() {
        info!(
            transit_gateway_id = %gateway.id,
            state = %gateway.state,
            "transit gateway not available, skipping attachment for now"
        );
        return Err(RegisterError::TransitGatewayNotAvailable);
    }

    Ok(())
}

fn declared_subnet_ids(aws_cluster: &AWSCluster) -> Vec<String> {
    aws_cluster
        .spec
        .network
        .subnets
        .iter()
        .filter(|subnet| !subnet.id.is_empty())
        .map(|subnet| subnet.id.clone())
        .collect()
}

#[async_trait]
impl Registrar for TransitGatewayRegistrar {
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    async fn register(&self, cluster: &mut Cluster) -> Result<(), RegisterError> {
        match annotations::mode(cluster).map_err(RegisterError::from)? {
            None => {
                info!("network topology mode is unset, defaulting to 'None'");
                *cluster = self
                    .repository
                    .patch_annotations(
                        cluster,
                        annotations::patch(
                            annotations::MODE,
                            &NetworkTopologyMode::None.to_string(),
                        ),
                    )
                    .await?;
                Err(RegisterError::ModeNotSupported {
                    mode: NetworkTopologyMode::None.to_string(),
                })
            }
            Some(NetworkTopologyMode::None) => Err(RegisterError::ModeNotSupported {
                mode: NetworkTopologyMode::None.to_string(),
            }),
            Some(NetworkTopologyMode::UserManaged) => {
                self.register_user_managed(cluster).await?;
                info!("done registering transit gateway");
                Ok(())
            }
            Some(NetworkTopologyMode::GiantSwarmManaged) => {
                self.register_giantswarm_managed(cluster).await?;
                info!("done registering transit gateway");
                Ok(())
            }
        }
    }

    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    async fn unregister(&self, cluster: &Cluster) -> Result<(), RegisterError> {
        match annotations::mode(cluster).map_err(RegisterError::from)? {
            None | Some(NetworkTopologyMode::None) => Ok(()),
            Some(NetworkTopologyMode::UserManaged) => {
                self.unregister_user_managed(cluster).await?;
                info!("done unregistering transit gateway");
                Ok(())
            }
            Some(NetworkTopologyMode::GiantSwarmManaged) => {
                self.unregister_giantswarm_managed(cluster).await?;
                info!("done unregistering transit gateway");
                Ok(())
            }
        }
    }
}
