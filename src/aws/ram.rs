//! Cross-account resource sharing via AWS RAM
//!
//! Shares the management-account transit gateway and prefix list with the
//! workload-cluster accounts. Shares in a Deleting or Deleted status are
//! treated as absent so a freshly recreated share with the same name stays
//! observable.

use async_trait::async_trait;
use aws_sdk_ram::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ram::types::{ResourceOwner, ResourceShareStatus};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::aws::is_not_found_code;
use crate::aws::types::ResourceShare;
use crate::error::{Error, Result};

/// Resource share operations against the management account
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RamClient: Send + Sync {
    /// Create the share unless a live share with the same name already exists
    async fn apply_resource_share(&self, share: &ResourceShare) -> Result<()>;

    /// Delete the share by name; already absent is success
    async fn delete_resource_share(&self, name: &str) -> Result<()>;
}

/// SDK-backed implementation of [`RamClient`]
#[derive(Clone)]
pub struct SdkRamClient {
    ram: aws_sdk_ram::Client,
}

impl SdkRamClient {
    pub fn new(ram: aws_sdk_ram::Client) -> Self {
        Self { ram }
    }

    /// Look up the live share with the given name owned by this account
    async fn get_resource_share(&self, name: &str) -> Result<Option<String>> {
        let output = self
            .ram
            .get_resource_shares()
            .resource_owner(ResourceOwner::SelfValue)
            .name(name)
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        let live: Vec<_> = output
            .resource_shares()
            .iter()
            .filter(|share| is_live(share.status()))
            .collect();

        match live.len() {
            0 => Ok(None),
            1 => Ok(live[0].resource_share_arn().map(str::to_string)),
            n => Err(Error::aws(format!(
                "expected 1 resource share, found {n}"
            ))),
        }
    }
}

/// True unless the share is being or has been deleted
fn is_live(status: Option<&ResourceShareStatus>) -> bool {
    !matches!(
        status,
        Some(ResourceShareStatus::Deleting) | Some(ResourceShareStatus::Deleted)
    )
}

#[async_trait]
impl RamClient for SdkRamClient {
    async fn apply_resource_share(&self, share: &ResourceShare) -> Result<()> {
        if self.get_resource_share(&share.name).await?.is_some() {
            info!(resource_share_name = %share.name, "resource share already exists");
            return Ok(());
        }

        let mut request = self
            .ram
            .create_resource_share()
            .name(&share.name)
            .allow_external_principals(true)
            .principals(&share.external_account_id);
        for arn in &share.resource_arns {
            request = request.resource_arns(arn);
        }

        request
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        info!(
            resource_share_name = %share.name,
            principal = %share.external_account_id,
            "created resource share"
        );
        Ok(())
    }

    async fn delete_resource_share(&self, name: &str) -> Result<()> {
        let Some(share_arn) = self.get_resource_share(name).await? else {
            info!(resource_share_name = %name, "resource share not found");
            return Ok(());
        };

        match self
            .ram
            .delete_resource_share()
            .resource_share_arn(&share_arn)
            .send()
            .await
        {
            Ok(_) => {
                info!(resource_share_name = %name, "deleted resource share");
                Ok(())
            }
            Err(err) if matches!(err.code(), Some(code) if is_not_found_code(code)) => Ok(()),
            Err(err) => Err(Error::aws(DisplayErrorContext(err))),
        }
    }
}
