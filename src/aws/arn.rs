//! Amazon Resource Name parsing
//!
//! Annotations carry either full ARNs or bare resource ids; describe calls
//! need bare ids while RAM sharing and account comparisons need the ARN
//! parts. ARNs have the shape
//! `arn:partition:service:region:account-id:resource`.

use crate::error::{Error, Result};

/// Parsed Amazon Resource Name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource: String,
}

impl std::str::FromStr for Arn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidArn {
            arn: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.splitn(6, ':');
        if parts.next() != Some("arn") {
            return Err(invalid("missing 'arn:' prefix"));
        }

        let partition = parts.next().ok_or_else(|| invalid("missing partition"))?;
        let service = parts.next().ok_or_else(|| invalid("missing service"))?;
        let region = parts.next().ok_or_else(|| invalid("missing region"))?;
        let account_id = parts.next().ok_or_else(|| invalid("missing account id"))?;
        let resource = parts.next().ok_or_else(|| invalid("missing resource"))?;
        if resource.is_empty() {
            return Err(invalid("missing resource"));
        }

        Ok(Self {
            partition: partition.to_string(),
            service: service.to_string(),
            region: region.to_string(),
            account_id: account_id.to_string(),
            resource: resource.to_string(),
        })
    }
}

impl std::fmt::Display for Arn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account_id, self.resource
        )
    }
}

impl Arn {
    /// The bare resource id: the part after `<resource-type>/`, or the whole
    /// resource when it carries no type prefix
    pub fn resource_id(&self) -> &str {
        self.resource
            .split_once('/')
            .map(|(_, id)| id)
            .unwrap_or(&self.resource)
    }
}

/// True when the value looks like an ARN rather than a bare resource id
pub fn is_arn(value: &str) -> bool {
    value.starts_with("arn:")
}

/// Normalize an annotation value (ARN or bare id) into a bare resource id
pub fn resource_id(value: &str) -> Result<String> {
    if is_arn(value) {
        let arn: Arn = value.parse()?;
        Ok(arn.resource_id().to_string())
    } else {
        Ok(value.to_string())
    }
}
