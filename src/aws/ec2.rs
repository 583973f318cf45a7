//! EC2-backed transit gateway operations
//!
//! [`TransitGatewayClient`] is the capability seam the registrar converges
//! through; [`Ec2TransitGatewayClient`] adapts it onto the AWS SDK. One
//! adapter instance is bound to one AWS account: the management account for
//! gateway and prefix list calls, the workload account (via the client
//! factory) for attachment calls.

use async_trait::async_trait;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    AddPrefixListEntry, AutoAcceptSharedAttachmentsValue, Filter, RemovePrefixListEntry,
    ResourceType, Tag, TagSpecification, TransitGatewayRequestOptions,
};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::aws::is_not_found_code;
use crate::aws::types::{
    ManagedPrefixList, PrefixListEntry, Route, RouteTable, Subnet, TransitGateway,
    TransitGatewayState, VpcAttachment, VpcAttachmentSpec, VpcAttachmentState,
};
use crate::error::{Error, Result};

/// Maximum number of entries a created prefix list can have. This number
/// counts against the "routes per route table" quota (regardless of how many
/// actual entries exist) when the list is referenced, so it stays below the
/// default quota of 50.
pub const PREFIX_LIST_MAX_ENTRIES: i32 = 45;

/// Transit gateway, prefix list, attachment, route and subnet operations
/// against one AWS account
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransitGatewayClient: Send + Sync {
    /// Look up a transit gateway by id. An empty id and a NotFound answer
    /// both yield Ok(None); more than one match is an error.
    async fn get_transit_gateway(&self, gateway_id: &str) -> Result<Option<TransitGateway>>;

    /// Create a transit gateway tagged as owned by the given cluster
    async fn create_transit_gateway(&self, cluster_name: &str) -> Result<TransitGateway>;

    /// Delete a transit gateway; already absent is success
    async fn delete_transit_gateway(&self, gateway_id: &str) -> Result<()>;

    /// Attachments matching the (gateway, vpc) pair
    async fn get_vpc_attachments(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<Vec<VpcAttachment>>;

    /// Create a VPC attachment with ownership and Name tags
    async fn create_vpc_attachment(&self, spec: &VpcAttachmentSpec) -> Result<VpcAttachment>;

    /// Delete a VPC attachment; already absent is success
    async fn delete_vpc_attachment(&self, attachment_id: &str) -> Result<()>;

    /// Look up a managed prefix list by id
    async fn get_prefix_list(&self, prefix_list_id: &str) -> Result<Option<ManagedPrefixList>>;

    /// Look up a managed prefix list by name; more than one match is an error
    async fn get_prefix_list_by_name(&self, name: &str) -> Result<Option<ManagedPrefixList>>;

    /// Create an IPv4 managed prefix list with the fixed entry limit
    async fn create_prefix_list(&self, name: &str) -> Result<ManagedPrefixList>;

    /// Entries of a prefix list at the given version
    async fn get_prefix_list_entries(
        &self,
        prefix_list_id: &str,
        version: i64,
    ) -> Result<Vec<PrefixListEntry>>;

    /// Add an entry to a prefix list at the given version
    async fn add_prefix_list_entry(
        &self,
        prefix_list_id: &str,
        version: i64,
        entry: &PrefixListEntry,
    ) -> Result<()>;

    /// Remove the entry with the given CIDR from a prefix list
    async fn remove_prefix_list_entry(
        &self,
        prefix_list_id: &str,
        version: i64,
        cidr: &str,
    ) -> Result<()>;

    /// Route tables associated with any of the given subnets
    async fn get_route_tables(&self, subnet_ids: &[String]) -> Result<Vec<RouteTable>>;

    /// Create a prefix-list route via the transit gateway
    async fn create_route(
        &self,
        route_table_id: &str,
        prefix_list_id: &str,
        gateway_id: &str,
    ) -> Result<()>;

    /// Delete the prefix-list route; already absent is success
    async fn delete_route(&self, route_table_id: &str, prefix_list_id: &str) -> Result<()>;

    /// Private subnets of the VPC labelled for transit gateway attachment
    async fn get_tagged_private_subnets(
        &self,
        vpc_id: &str,
        cluster_name: &str,
    ) -> Result<Vec<Subnet>>;
}

/// SDK-backed implementation of [`TransitGatewayClient`]
#[derive(Clone)]
pub struct Ec2TransitGatewayClient {
    ec2: aws_sdk_ec2::Client,
}

impl Ec2TransitGatewayClient {
    pub fn new(ec2: aws_sdk_ec2::Client) -> Self {
        Self { ec2 }
    }
}

fn cluster_tag_key(cluster_name: &str) -> String {
    format!("kubernetes.io/cluster/{cluster_name}")
}

fn name_filter(name: &str, values: Vec<String>) -> Filter {
    Filter::builder().name(name).set_values(Some(values)).build()
}

#[async_trait]
impl TransitGatewayClient for Ec2TransitGatewayClient {
    async fn get_transit_gateway(&self, gateway_id: &str) -> Result<Option<TransitGateway>> {
        if gateway_id.is_empty() {
            return Ok(None);
        }

        let output = match self
            .ec2
            .describe_transit_gateways()
            .transit_gateway_ids(gateway_id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if matches!(err.code(), Some(code) if is_not_found_code(code)) => {
                debug!(transit_gateway_id = %gateway_id, "transit gateway not found");
                return Ok(None);
            }
            Err(err) => return Err(Error::aws(DisplayErrorContext(err))),
        };

        let gateways = output.transit_gateways();
        match gateways.len() {
            0 => Ok(None),
            1 => Ok(Some(map_transit_gateway(&gateways[0]))),
            _ => Err(Error::aws(
                "multiple Transit Gateways found for ID, expected at most one",
            )),
        }
    }

    async fn create_transit_gateway(&self, cluster_name: &str) -> Result<TransitGateway> {
        let output = self
            .ec2
            .create_transit_gateway()
            .description(format!("Transit Gateway for cluster {cluster_name}"))
            .options(
                TransitGatewayRequestOptions::builder()
                    .auto_accept_shared_attachments(AutoAcceptSharedAttachmentsValue::Enable)
                    .build(),
            )
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::TransitGateway)
                    .tags(
                        Tag::builder()
                            .key(cluster_tag_key(cluster_name))
                            .value("owned")
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        let gateway = output
            .transit_gateway()
            .map(map_transit_gateway)
            .ok_or_else(|| Error::aws("CreateTransitGateway returned no transit gateway"))?;

        info!(transit_gateway_id = %gateway.id, "created new transit gateway");
        Ok(gateway)
    }

    async fn delete_transit_gateway(&self, gateway_id: &str) -> Result<()> {
        match self
            .ec2
            .delete_transit_gateway()
            .transit_gateway_id(gateway_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if matches!(err.code(), Some(code) if is_not_found_code(code)) => Ok(()),
            Err(err) => Err(Error::aws(DisplayErrorContext(err))),
        }
    }

    async fn get_vpc_attachments(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<Vec<VpcAttachment>> {
        let output = self
            .ec2
            .describe_transit_gateway_vpc_attachments()
            .filters(name_filter(
                "transit-gateway-id",
                vec![gateway_id.to_string()],
            ))
            .filters(name_filter("vpc-id", vec![vpc_id.to_string()]))
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        Ok(output
            .transit_gateway_vpc_attachments()
            .iter()
            .map(map_vpc_attachment)
            .collect())
    }

    async fn create_vpc_attachment(&self, spec: &VpcAttachmentSpec) -> Result<VpcAttachment> {
        let output = self
            .ec2
            .create_transit_gateway_vpc_attachment()
            .transit_gateway_id(&spec.transit_gateway_id)
            .vpc_id(&spec.vpc_id)
            .set_subnet_ids(Some(spec.subnet_ids.clone()))
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::TransitGatewayAttachment)
                    .tags(
                        Tag::builder()
                            .key(cluster_tag_key(&spec.cluster_name))
                            .value("owned")
                            .build(),
                    )
                    .tags(
                        Tag::builder()
                            .key("Name")
                            .value(&spec.aws_cluster_name)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        let attachment = output
            .transit_gateway_vpc_attachment()
            .map(map_vpc_attachment)
            .ok_or_else(|| {
                Error::aws("CreateTransitGatewayVpcAttachment returned no attachment")
            })?;

        info!(
            transit_gateway_id = %spec.transit_gateway_id,
            vpc_id = %spec.vpc_id,
            attachment_id = %attachment.id,
            "transit gateway attached to VPC"
        );
        Ok(attachment)
    }

    async fn delete_vpc_attachment(&self, attachment_id: &str) -> Result<()> {
        match self
            .ec2
            .delete_transit_gateway_vpc_attachment()
            .transit_gateway_attachment_id(attachment_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if matches!(err.code(), Some(code) if is_not_found_code(code)) => Ok(()),
            Err(err) => Err(Error::aws(DisplayErrorContext(err))),
        }
    }

    async fn get_prefix_list(&self, prefix_list_id: &str) -> Result<Option<ManagedPrefixList>> {
        if prefix_list_id.is_empty() {
            return Ok(None);
        }

        let output = self
            .ec2
            .describe_managed_prefix_lists()
            .filters(name_filter(
                "prefix-list-id",
                vec![prefix_list_id.to_string()],
            ))
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        Ok(output.prefix_lists().first().map(map_prefix_list))
    }

    async fn get_prefix_list_by_name(&self, name: &str) -> Result<Option<ManagedPrefixList>> {
        let output = self
            .ec2
            .describe_managed_prefix_lists()
            .filters(name_filter("prefix-list-name", vec![name.to_string()]))
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        let lists = output.prefix_lists();
        match lists.len() {
            0 => Ok(None),
            1 => Ok(Some(map_prefix_list(&lists[0]))),
            _ => Err(Error::aws("unexpected number of prefix lists returned")),
        }
    }

    async fn create_prefix_list(&self, name: &str) -> Result<ManagedPrefixList> {
        let output = self
            .ec2
            .create_managed_prefix_list()
            .prefix_list_name(name)
            .address_family("IPv4")
            .max_entries(PREFIX_LIST_MAX_ENTRIES)
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        let prefix_list = output
            .prefix_list()
            .map(map_prefix_list)
            .ok_or_else(|| Error::aws("CreateManagedPrefixList returned no prefix list"))?;

        info!(prefix_list_name = %name, prefix_list_id = %prefix_list.id, "created new prefix list");
        Ok(prefix_list)
    }

    async fn get_prefix_list_entries(
        &self,
        prefix_list_id: &str,
        version: i64,
    ) -> Result<Vec<PrefixListEntry>> {
        let output = self
            .ec2
            .get_managed_prefix_list_entries()
            .prefix_list_id(prefix_list_id)
            .target_version(version)
            .max_results(100)
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        Ok(output
            .entries()
            .iter()
            .map(|entry| PrefixListEntry {
                cidr: entry.cidr().unwrap_or_default().to_string(),
                description: entry.description().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn add_prefix_list_entry(
        &self,
        prefix_list_id: &str,
        version: i64,
        entry: &PrefixListEntry,
    ) -> Result<()> {
        self.ec2
            .modify_managed_prefix_list()
            .prefix_list_id(prefix_list_id)
            .current_version(version)
            .add_entries(
                AddPrefixListEntry::builder()
                    .cidr(&entry.cidr)
                    .description(&entry.description)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        info!(
            prefix_list_id = %prefix_list_id,
            cidr = %entry.cidr,
            "added CIDR to prefix list"
        );
        Ok(())
    }

    async fn remove_prefix_list_entry(
        &self,
        prefix_list_id: &str,
        version: i64,
        cidr: &str,
    ) -> Result<()> {
        match self
            .ec2
            .modify_managed_prefix_list()
            .prefix_list_id(prefix_list_id)
            .current_version(version)
            .remove_entries(RemovePrefixListEntry::builder().cidr(cidr).build())
            .send()
            .await
        {
            Ok(_) => {
                info!(prefix_list_id = %prefix_list_id, cidr = %cidr, "removed CIDR from prefix list");
                Ok(())
            }
            Err(err) if matches!(err.code(), Some(code) if is_not_found_code(code)) => Ok(()),
            Err(err) => Err(Error::aws(DisplayErrorContext(err))),
        }
    }

    async fn get_route_tables(&self, subnet_ids: &[String]) -> Result<Vec<RouteTable>> {
        if subnet_ids.is_empty() {
            return Ok(Vec::new());
        }

        let output = self
            .ec2
            .describe_route_tables()
            .filters(name_filter("association.subnet-id", subnet_ids.to_vec()))
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        Ok(output
            .route_tables()
            .iter()
            .map(|rt| RouteTable {
                id: rt.route_table_id().unwrap_or_default().to_string(),
                routes: rt
                    .routes()
                    .iter()
                    .map(|route| Route {
                        destination_prefix_list_id: route
                            .destination_prefix_list_id()
                            .map(str::to_string),
                        transit_gateway_id: route.transit_gateway_id().map(str::to_string),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        prefix_list_id: &str,
        gateway_id: &str,
    ) -> Result<()> {
        self.ec2
            .create_route()
            .route_table_id(route_table_id)
            .destination_prefix_list_id(prefix_list_id)
            .transit_gateway_id(gateway_id)
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        info!(
            route_table_id = %route_table_id,
            prefix_list_id = %prefix_list_id,
            transit_gateway_id = %gateway_id,
            "added route to route table"
        );
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, prefix_list_id: &str) -> Result<()> {
        match self
            .ec2
            .delete_route()
            .route_table_id(route_table_id)
            .destination_prefix_list_id(prefix_list_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if matches!(err.code(), Some(code) if is_not_found_code(code)) => Ok(()),
            Err(err) => Err(Error::aws(DisplayErrorContext(err))),
        }
    }

    async fn get_tagged_private_subnets(
        &self,
        vpc_id: &str,
        cluster_name: &str,
    ) -> Result<Vec<Subnet>> {
        let output = self
            .ec2
            .describe_subnets()
            .filters(name_filter("vpc-id", vec![vpc_id.to_string()]))
            .filters(name_filter(
                &format!("tag:{}", cluster_tag_key(cluster_name)),
                vec!["owned".to_string(), "shared".to_string()],
            ))
            .filters(name_filter(
                "tag:subnet.giantswarm.io/tgw",
                vec!["true".to_string()],
            ))
            .filters(name_filter(
                "tag:subnet.giantswarm.io/role",
                vec!["private".to_string()],
            ))
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        Ok(output
            .subnets()
            .iter()
            .map(|subnet| Subnet {
                id: subnet.subnet_id().unwrap_or_default().to_string(),
                availability_zone: subnet.availability_zone().unwrap_or_default().to_string(),
            })
            .collect())
    }
}

fn map_transit_gateway(tgw: &aws_sdk_ec2::types::TransitGateway) -> TransitGateway {
    TransitGateway {
        id: tgw.transit_gateway_id().unwrap_or_default().to_string(),
        arn: tgw.transit_gateway_arn().unwrap_or_default().to_string(),
        state: map_gateway_state(tgw.state()),
    }
}

fn map_gateway_state(
    state: Option<&aws_sdk_ec2::types::TransitGatewayState>,
) -> TransitGatewayState {
    use aws_sdk_ec2::types::TransitGatewayState as SdkState;
    match state {
        Some(SdkState::Available) => TransitGatewayState::Available,
        Some(SdkState::Pending) => TransitGatewayState::Pending,
        Some(SdkState::Modifying) => TransitGatewayState::Modifying,
        Some(SdkState::Deleting) => TransitGatewayState::Deleting,
        Some(SdkState::Deleted) => TransitGatewayState::Deleted,
        Some(other) => TransitGatewayState::Other(other.as_str().to_string()),
        None => TransitGatewayState::Other(String::new()),
    }
}

fn map_vpc_attachment(
    attachment: &aws_sdk_ec2::types::TransitGatewayVpcAttachment,
) -> VpcAttachment {
    VpcAttachment {
        id: attachment
            .transit_gateway_attachment_id()
            .unwrap_or_default()
            .to_string(),
        vpc_id: attachment.vpc_id().unwrap_or_default().to_string(),
        vpc_owner_id: attachment.vpc_owner_id().unwrap_or_default().to_string(),
        state: map_attachment_state(attachment.state()),
    }
}

fn map_attachment_state(
    state: Option<&aws_sdk_ec2::types::TransitGatewayAttachmentState>,
) -> VpcAttachmentState {
    use aws_sdk_ec2::types::TransitGatewayAttachmentState as SdkState;
    match state {
        Some(SdkState::Available) => VpcAttachmentState::Available,
        Some(SdkState::Initiating) => VpcAttachmentState::Initiating,
        Some(SdkState::InitiatingRequest) => VpcAttachmentState::InitiatingRequest,
        Some(SdkState::Pending) => VpcAttachmentState::Pending,
        Some(SdkState::PendingAcceptance) => VpcAttachmentState::PendingAcceptance,
        Some(SdkState::Deleting) => VpcAttachmentState::Deleting,
        Some(SdkState::Deleted) => VpcAttachmentState::Deleted,
        Some(other) => VpcAttachmentState::Other(other.as_str().to_string()),
        None => VpcAttachmentState::Other(String::new()),
    }
}

fn map_prefix_list(prefix_list: &aws_sdk_ec2::types::ManagedPrefixList) -> ManagedPrefixList {
    ManagedPrefixList {
        id: prefix_list.prefix_list_id().unwrap_or_default().to_string(),
        arn: prefix_list
            .prefix_list_arn()
            .unwrap_or_default()
            .to_string(),
        name: prefix_list
            .prefix_list_name()
            .unwrap_or_default()
            .to_string(),
        version: prefix_list.version().unwrap_or_default(),
    }
}
