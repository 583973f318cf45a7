//! AWS capability seams and SDK adapters
//!
//! Reconcilers and registrars depend on the narrow traits in this module
//! ([`TransitGatewayClient`], [`RamClient`], [`SnsClient`],
//! [`TransitGatewayClientFactory`]); production wires the SDK adapters,
//! tests supply mocks.

pub mod arn;
pub mod ec2;
pub mod factory;
pub mod ram;
pub mod sns;
pub mod types;

pub use arn::Arn;
pub use ec2::{Ec2TransitGatewayClient, TransitGatewayClient, PREFIX_LIST_MAX_ENTRIES};
pub use factory::{
    assume_role_config, CachingClientFactory, ClientBuilder, StsClientBuilder,
    TransitGatewayClientFactory, DEFAULT_CLIENT_TTL,
};
pub use ram::{RamClient, SdkRamClient};
pub use sns::{SdkSnsClient, SnsClient};

/// True for the error codes AWS returns when a resource is already gone.
/// Deletion paths map these to success.
pub(crate) fn is_not_found_code(code: &str) -> bool {
    code.ends_with(".NotFound")
        || code == "NotFoundException"
        || code == "ResourceNotFoundException"
        || code == "UnknownResourceException"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes_cover_ec2_and_ram_shapes() {
        for code in [
            "InvalidRouteTableID.NotFound",
            "InvalidAssociationID.NotFound",
            "InvalidSubnetID.NotFound",
            "InvalidVpcID.NotFound",
            "InvalidTransitGatewayID.NotFound",
            "InvalidTransitGatewayAttachmentID.NotFound",
            "InvalidPrefixListID.NotFound",
            "UnknownResourceException",
        ] {
            assert!(is_not_found_code(code), "{code}");
        }

        assert!(!is_not_found_code("UnauthorizedOperation"));
        assert!(!is_not_found_code("IncorrectState"));
    }
}
