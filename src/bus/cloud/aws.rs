//! AWS SNS/SQS queue provider.
//!
//! Topics are SNS topics, subscriber queues are SQS queues bound with raw
//! message delivery, so queue bodies are the published envelope JSON.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::{Message, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use tracing::{debug, info, warn};

use super::facade::{QueueFacade, QueueMessage};
use crate::bus::{BusError, Result};
use crate::config::CloudConfig;

/// Convert an SQS message, or `None` when its id, receipt handle or body is missing.
fn queue_message(m: &Message) -> Option<QueueMessage> {
    Some(QueueMessage {
        id: m.message_id()?.to_string(),
        receipt_handle: m.receipt_handle()?.to_string(),
        body: m.body()?.to_string(),
    })
}

/// Error codes that retrying cannot fix.
const FATAL_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthorizationError",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
    "NotFound",
];

/// Longest subject SNS accepts.
const MAX_SUBJECT_LEN: usize = 99;

fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> BusError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_string);
    let message = format!(
        "{} failed: {}",
        operation,
        aws_sdk_sns::error::DisplayErrorContext(&err)
    );
    match (&err, code.as_deref()) {
        (_, Some(code)) if FATAL_CODES.contains(&code) => BusError::FatalProvider(message),
        (SdkError::ConstructionFailure(_), _) => BusError::FatalProvider(message),
        _ => BusError::TransientProvider(message),
    }
}

/// SNS subjects must be short printable ASCII without line breaks.
fn subject_for(channel: &str) -> Option<String> {
    let subject: String = channel
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(MAX_SUBJECT_LEN)
        .collect();
    if subject.is_empty() {
        None
    } else {
        Some(subject)
    }
}

/// `QueueFacade` over SNS and SQS.
pub struct AwsQueueFacade {
    sns: SnsClient,
    sqs: SqsClient,
    config: CloudConfig,
}

impl AwsQueueFacade {
    /// Load AWS settings and build clients.
    pub async fn new(config: CloudConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            "Connected to AWS SNS/SQS"
        );

        Self {
            sns: SnsClient::new(&aws_config),
            sqs: SqsClient::new(&aws_config),
            config,
        }
    }

    fn queue_policy(queue_arn: &str, topic_arn: &str) -> String {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "sns.amazonaws.com" },
                "Action": "sqs:SendMessage",
                "Resource": queue_arn,
                "Condition": { "ArnEquals": { "aws:SourceArn": topic_arn } }
            }]
        })
        .to_string()
    }
}

#[async_trait]
impl QueueFacade for AwsQueueFacade {
    fn is_configured(&self) -> bool {
        self.config.enabled
    }

    async fn create_or_retrieve_topic(&self, name: &str) -> Result<String> {
        // Idempotent: returns the existing topic if present.
        let result = self
            .sns
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|e| classify("create_topic", e))?;

        let arn = result
            .topic_arn()
            .ok_or_else(|| {
                BusError::TransientProvider("SNS create_topic returned no ARN".to_string())
            })?
            .to_string();
        debug!(topic = %name, arn = %arn, "Resolved SNS topic");
        Ok(arn)
    }

    async fn publish_message_to_topic(
        &self,
        topic_arn: &str,
        subject: &str,
        message: &str,
    ) -> Result<String> {
        let result = self
            .sns
            .publish()
            .topic_arn(topic_arn)
            .set_subject(subject_for(subject))
            .message(message)
            .send()
            .await
            .map_err(|e| classify("publish", e))?;

        Ok(result.message_id().unwrap_or_default().to_string())
    }

    async fn subscribe_queue_to_topic(&self, queue_arn: &str, topic_arn: &str) -> Result<String> {
        let result = self
            .sns
            .subscribe()
            .topic_arn(topic_arn)
            .protocol("sqs")
            .endpoint(queue_arn)
            .attributes("RawMessageDelivery", "true")
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| classify("subscribe", e))?;

        let arn = result
            .subscription_arn()
            .ok_or_else(|| {
                BusError::TransientProvider("SNS subscribe returned no ARN".to_string())
            })?
            .to_string();
        debug!(queue_arn = %queue_arn, topic_arn = %topic_arn, "Subscribed queue to topic");
        Ok(arn)
    }

    async fn unsubscribe_queue_from_topic(&self, subscription_arn: &str) -> Result<()> {
        self.sns
            .unsubscribe()
            .subscription_arn(subscription_arn)
            .send()
            .await
            .map_err(|e| classify("unsubscribe", e))?;
        Ok(())
    }

    async fn create_or_retrieve_queue(&self, name: &str) -> Result<String> {
        // Idempotent: returns the existing queue if present.
        let result = self
            .sqs
            .create_queue()
            .queue_name(name)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                self.config.visibility_timeout_secs.to_string(),
            )
            .send()
            .await
            .map_err(|e| classify("create_queue", e))?;

        let url = result
            .queue_url()
            .ok_or_else(|| {
                BusError::TransientProvider("SQS create_queue returned no URL".to_string())
            })?
            .to_string();
        debug!(queue = %name, url = %url, "Resolved SQS queue");
        Ok(url)
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let attrs = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| classify("get_queue_attributes", e))?;

        attrs
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| BusError::FatalProvider("Queue has no ARN attribute".to_string()))
    }

    async fn set_queue_policy_for_topic_publish(
        &self,
        queue_url: &str,
        queue_arn: &str,
        topic_arn: &str,
    ) -> Result<()> {
        self.sqs
            .set_queue_attributes()
            .queue_url(queue_url)
            .attributes(
                QueueAttributeName::Policy,
                Self::queue_policy(queue_arn, topic_arn),
            )
            .send()
            .await
            .map_err(|e| classify("set_queue_attributes", e))?;
        Ok(())
    }

    async fn read_queue(&self, queue_url: &str) -> Result<Vec<QueueMessage>> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(self.config.max_messages)
            .wait_time_seconds(self.config.wait_time_secs)
            .send()
            .await
            .map_err(|e| classify("receive_message", e))?;

        let mut messages = Vec::with_capacity(output.messages().len());
        for m in output.messages() {
            if let Some(message) = queue_message(m) {
                messages.push(message);
                continue;
            }
            warn!(
                url = %queue_url,
                message_id = m.message_id().unwrap_or("<none>"),
                has_receipt = m.receipt_handle().is_some(),
                has_body = m.body().is_some(),
                "Discarding incomplete SQS message"
            );
            // Without a receipt handle the message returns after the
            // visibility timeout.
            if let Some(receipt_handle) = m.receipt_handle() {
                if let Err(e) = self.delete_message(queue_url, receipt_handle).await {
                    warn!(url = %queue_url, error = %e, "Failed to delete incomplete SQS message");
                }
            }
        }
        Ok(messages)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.sqs
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| classify("delete_message", e))?;
        Ok(())
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        self.sqs
            .delete_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(|e| classify("delete_queue", e))?;
        info!(url = %queue_url, "Deleted SQS queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_sanitized() {
        assert_eq!(subject_for("orders"), Some("orders".to_string()));
        assert_eq!(subject_for("a\nb"), Some("ab".to_string()));
        assert_eq!(subject_for("ü"), None);
        assert_eq!(subject_for(&"x".repeat(200)).map(|s| s.len()), Some(99));
    }

    #[test]
    fn test_incomplete_messages_not_delivered() {
        let complete = Message::builder()
            .message_id("m-1")
            .receipt_handle("r-1")
            .body("{}")
            .build();
        let message = queue_message(&complete).unwrap();
        assert_eq!(message.id, "m-1");
        assert_eq!(message.receipt_handle, "r-1");
        assert_eq!(message.body, "{}");

        let no_body = Message::builder()
            .message_id("m-2")
            .receipt_handle("r-2")
            .build();
        assert!(queue_message(&no_body).is_none());

        let no_receipt = Message::builder().message_id("m-3").body("{}").build();
        assert!(queue_message(&no_receipt).is_none());
    }

    #[test]
    fn test_queue_policy_names_topic() {
        let policy = AwsQueueFacade::queue_policy("arn:q", "arn:t");
        let value: serde_json::Value = serde_json::from_str(&policy).unwrap();
        let statement = &value["Statement"][0];
        assert_eq!(statement["Resource"], "arn:q");
        assert_eq!(statement["Condition"]["ArnEquals"]["aws:SourceArn"], "arn:t");
    }
}
