//! Narrow contract over a cloud topic/queue provider.
//!
//! Implementations classify provider failures: anything worth retrying maps
//! to `BusError::TransientProvider`, authorization failures and missing
//! resources map to `BusError::FatalProvider`.

use async_trait::async_trait;

use crate::bus::Result;

/// One message pulled from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Provider message id.
    pub id: String,
    /// Handle that acknowledges this particular receipt.
    pub receipt_handle: String,
    pub body: String,
}

/// Topic/queue operations the subscription engine depends on.
#[async_trait]
pub trait QueueFacade: Send + Sync {
    /// Whether the provider has usable settings and credentials.
    fn is_configured(&self) -> bool;

    /// Create a topic, or look up the existing one. Returns its ARN.
    async fn create_or_retrieve_topic(&self, name: &str) -> Result<String>;

    /// Publish to a topic. Returns the provider message id.
    async fn publish_message_to_topic(
        &self,
        topic_arn: &str,
        subject: &str,
        message: &str,
    ) -> Result<String>;

    /// Bind a queue to a topic with raw delivery. Returns the subscription ARN.
    async fn subscribe_queue_to_topic(&self, queue_arn: &str, topic_arn: &str) -> Result<String>;

    async fn unsubscribe_queue_from_topic(&self, subscription_arn: &str) -> Result<()>;

    /// Create a queue, or look up the existing one. Returns its URL.
    async fn create_or_retrieve_queue(&self, name: &str) -> Result<String>;

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String>;

    /// Allow `topic_arn` to deliver into the queue.
    async fn set_queue_policy_for_topic_publish(
        &self,
        queue_url: &str,
        queue_arn: &str,
        topic_arn: &str,
    ) -> Result<()>;

    /// Pull available messages. May wait up to the provider's long-poll limit.
    async fn read_queue(&self, queue_url: &str) -> Result<Vec<QueueMessage>>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;

    async fn delete_queue(&self, queue_url: &str) -> Result<()>;
}
