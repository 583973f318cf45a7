//! Domain types exchanged across the AWS capability traits
//!
//! The SDK request/response shapes stay inside the adapters; reconcilers and
//! registrars only see these types.

/// Observed transit gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitGateway {
    pub id: String,
    pub arn: String,
    pub state: TransitGatewayState,
}

/// Lifecycle state of a transit gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitGatewayState {
    Available,
    Pending,
    Modifying,
    Deleting,
    Deleted,
    Other(String),
}

impl TransitGatewayState {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

impl std::fmt::Display for TransitGatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Pending => write!(f, "pending"),
            Self::Modifying => write!(f, "modifying"),
            Self::Deleting => write!(f, "deleting"),
            Self::Deleted => write!(f, "deleted"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Observed transit gateway VPC attachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpcAttachment {
    pub id: String,
    pub vpc_id: String,
    /// Account owning the attached VPC
    pub vpc_owner_id: String,
    pub state: VpcAttachmentState,
}

/// Lifecycle state of a VPC attachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VpcAttachmentState {
    Available,
    Initiating,
    InitiatingRequest,
    Pending,
    PendingAcceptance,
    Deleting,
    Deleted,
    Other(String),
}

impl VpcAttachmentState {
    /// True while the attachment still waits for the gateway side to accept
    pub fn is_awaiting_acceptance(&self) -> bool {
        matches!(
            self,
            Self::Initiating | Self::InitiatingRequest | Self::Pending | Self::PendingAcceptance
        )
    }
}

/// Request to create a VPC attachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpcAttachmentSpec {
    pub transit_gateway_id: String,
    pub vpc_id: String,
    /// One private subnet per availability zone
    pub subnet_ids: Vec<String>,
    /// Cluster name used for the ownership tag
    pub cluster_name: String,
    /// Infrastructure cluster name used for the Name tag
    pub aws_cluster_name: String,
}

/// Observed managed prefix list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedPrefixList {
    pub id: String,
    pub arn: String,
    pub name: String,
    pub version: i64,
}

/// Entry of a managed prefix list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixListEntry {
    pub cidr: String,
    pub description: String,
}

/// Route table with the routes relevant to topology convergence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTable {
    pub id: String,
    pub routes: Vec<Route>,
}

/// Route targeting a prefix list via a transit gateway
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    pub destination_prefix_list_id: Option<String>,
    pub transit_gateway_id: Option<String>,
}

/// Subnet discovered via tags
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub availability_zone: String,
}

/// Cross-account RAM share
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceShare {
    pub name: String,
    pub resource_arns: Vec<String>,
    /// Account id of the principal the resources are shared with
    pub external_account_id: String,
}

/// Attachment acceptance announcement published via SNS
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentAnnouncement {
    /// Account owning the attachment VPC
    pub account_id: String,
    pub attachment_id: String,
    /// CIDR of the workload cluster VPC
    pub cidr: String,
    pub cluster_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_is_awaited_in_all_pending_states() {
        for state in [
            VpcAttachmentState::Initiating,
            VpcAttachmentState::InitiatingRequest,
            VpcAttachmentState::Pending,
            VpcAttachmentState::PendingAcceptance,
        ] {
            assert!(state.is_awaiting_acceptance(), "{state:?}");
        }

        assert!(!VpcAttachmentState::Available.is_awaiting_acceptance());
        assert!(!VpcAttachmentState::Deleting.is_awaiting_acceptance());
    }

    #[test]
    fn only_available_gateways_accept_attachments() {
        assert!(TransitGatewayState::Available.is_available());
        assert!(!TransitGatewayState::Pending.is_available());
        assert!(!TransitGatewayState::Other("failed".to_string()).is_available());
    }
}
