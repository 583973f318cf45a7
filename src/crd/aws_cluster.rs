//! Cluster API AWS provider resources
//!
//! Partial bindings of `infrastructure.cluster.x-k8s.io/v1beta2` covering the
//! VPC, subnet and role identity fields the operator consumes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of an AWS infrastructure cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    kind = "AWSCluster",
    plural = "awsclusters",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct AWSClusterSpec {
    /// VPC and subnet configuration
    #[serde(default)]
    pub network: NetworkSpec,

    /// Reference to the identity used for AWS API calls in this account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<IdentityRef>,
}

/// Network configuration of an AWS cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct NetworkSpec {
    #[serde(default)]
    pub vpc: VpcSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,
}

/// VPC identity and addressing
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    /// VPC id; empty until the VPC has been provisioned
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cidr_block: String,
}

/// Declared subnet of an AWS cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cidr_block: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub is_public: bool,
}

/// Reference to an AWSClusterRoleIdentity
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct IdentityRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: String,
}

/// Role identity assumed for AWS API access to a cluster account
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    kind = "AWSClusterRoleIdentity",
    plural = "awsclusterroleidentities",
    derive = "Default"
)]
pub struct AWSClusterRoleIdentitySpec {
    /// ARN of the role to assume
    #[serde(rename = "roleARN")]
    pub role_arn: String,

    /// External id expected by the role trust policy
    #[serde(
        default,
        rename = "externalID",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_cluster_spec_deserializes_capa_payloads() {
        let spec: AWSClusterSpec = serde_json::from_value(serde_json::json!({
            "network": {
                "vpc": { "id": "vpc-123", "cidrBlock": "10.0.0.0/16" },
                "subnets": [
                    {
                        "id": "subnet-1",
                        "cidrBlock": "10.0.0.0/20",
                        "availabilityZone": "eu-west-1a",
                        "isPublic": false
                    },
                    {
                        "id": "subnet-2",
                        "cidrBlock": "10.0.16.0/20",
                        "availabilityZone": "eu-west-1a",
                        "isPublic": true
                    }
                ]
            },
            "identityRef": { "kind": "AWSClusterRoleIdentity", "name": "acme" }
        }))
        .unwrap();

        assert_eq!(spec.network.vpc.id, "vpc-123");
        assert_eq!(spec.network.vpc.cidr_block, "10.0.0.0/16");
        assert_eq!(spec.network.subnets.len(), 2);
        assert!(!spec.network.subnets[0].is_public);
        assert_eq!(spec.identity_ref.unwrap().name, "acme");
    }

    #[test]
    fn role_identity_uses_capa_casing() {
        let spec: AWSClusterRoleIdentitySpec = serde_json::from_value(serde_json::json!({
            "roleARN": "arn:aws:iam::987654321098:role/capa-controller",
            "externalID": "gs-fleet"
        }))
        .unwrap();

        assert_eq!(spec.role_arn, "arn:aws:iam::987654321098:role/capa-controller");
        assert_eq!(spec.external_id.as_deref(), Some("gs-fleet"));

        let without_external: AWSClusterRoleIdentitySpec = serde_json::from_value(
            serde_json::json!({ "roleARN": "arn:aws:iam::123456789012:role/mc" }),
        )
        .unwrap();
        assert!(without_external.external_id.is_none());
    }
}
