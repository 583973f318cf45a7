//! Attachment acceptance announcements via SNS
//!
//! In UserManaged mode the customer operates the transit gateway, so newly
//! created attachments wait for manual acceptance. The operator announces
//! them on an SNS topic watched by the gateway owners.

use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::types::MessageAttributeValue;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::aws::types::AttachmentAnnouncement;
use crate::error::{Error, Result};

/// Contact address included with every announcement
const OPERATOR_CONTACT: &str = "support@giantswarm.io";

/// Announcement publishing seam
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnsClient: Send + Sync {
    /// Announce a pending transit gateway attachment
    async fn publish_attachment_announcement(
        &self,
        announcement: &AttachmentAnnouncement,
    ) -> Result<()>;
}

/// SDK-backed implementation of [`SnsClient`] bound to one topic
#[derive(Clone)]
pub struct SdkSnsClient {
    sns: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SdkSnsClient {
    pub fn new(sns: aws_sdk_sns::Client, topic_arn: impl Into<String>) -> Self {
        Self {
            sns,
            topic_arn: topic_arn.into(),
        }
    }
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(Error::aws)
}

#[async_trait]
impl SnsClient for SdkSnsClient {
    async fn publish_attachment_announcement(
        &self,
        announcement: &AttachmentAnnouncement,
    ) -> Result<()> {
        if self.topic_arn.is_empty() {
            return Err(Error::configuration("no SNS topic provided"));
        }

        self.sns
            .publish()
            .topic_arn(&self.topic_arn)
            .message("Request TransitGatewayAttachment")
            .message_attributes("Postfach", string_attribute(OPERATOR_CONTACT)?)
            .message_attributes("Account_ID", string_attribute(&announcement.account_id)?)
            .message_attributes(
                "Attachment_ID",
                string_attribute(&announcement.attachment_id)?,
            )
            .message_attributes("CIDR", string_attribute(&announcement.cidr)?)
            .message_attributes("Name", string_attribute(&announcement.cluster_name)?)
            .send()
            .await
            .map_err(|err| Error::aws(DisplayErrorContext(err)))?;

        info!(
            attachment_id = %announcement.attachment_id,
            cluster = %announcement.cluster_name,
            "announced pending transit gateway attachment"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_attributes_carry_the_string_data_type() {
        let attribute = string_attribute("987654321098").unwrap();
        assert_eq!(attribute.data_type(), "String");
        assert_eq!(attribute.string_value(), Some("987654321098"));
    }
}
