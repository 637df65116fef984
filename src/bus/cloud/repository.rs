//! Topic and subscriber repositories.
//!
//! Both cache provider resources by name so each topic and each subscriber
//! queue is created at most once per process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use super::facade::QueueFacade;
use crate::bus::Result;
use crate::config::BusConfig;
use crate::identity::IdentityProvider;

/// Provider topic backing one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub channel: String,
    pub name: String,
    pub arn: String,
}

/// One physical receive queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub name: String,
    pub queue_url: String,
    pub queue_arn: String,
    /// Durable per-machine queue rather than a per-instance one.
    pub long_lived: bool,
}

/// Cache of topics by channel.
pub struct TopicRepository {
    facade: Arc<dyn QueueFacade>,
    config: Arc<BusConfig>,
    topics: RwLock<HashMap<String, Topic>>,
}

impl TopicRepository {
    pub fn new(facade: Arc<dyn QueueFacade>, config: Arc<BusConfig>) -> Self {
        Self {
            facade,
            config,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the topic for a channel.
    pub async fn get_topic(&self, channel: &str) -> Result<Topic> {
        if let Some(topic) = self.topics.read().await.get(channel) {
            return Ok(topic.clone());
        }

        let mut topics = self.topics.write().await;
        // Another caller may have created it while we waited for the lock.
        if let Some(topic) = topics.get(channel) {
            return Ok(topic.clone());
        }

        let name = self.config.topic_for_channel(channel);
        let arn = self.facade.create_or_retrieve_topic(&name).await?;
        info!(topic = %name, arn = %arn, "Created/found topic");

        let topic = Topic {
            channel: channel.to_string(),
            name,
            arn,
        };
        topics.insert(channel.to_string(), topic.clone());
        Ok(topic)
    }
}

/// Cache of subscriber queues by queue name.
pub struct SubscriberRepository {
    facade: Arc<dyn QueueFacade>,
    config: Arc<BusConfig>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
}

impl SubscriberRepository {
    pub fn new(facade: Arc<dyn QueueFacade>, config: Arc<BusConfig>) -> Self {
        Self {
            facade,
            config,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the subscriber queue for a channel and identity.
    ///
    /// Long-lived subscribers should be given a machine identity so the same
    /// queue is found again after a restart.
    pub async fn get_subscriber(
        &self,
        channel: &str,
        identity: &dyn IdentityProvider,
        long_lived: bool,
    ) -> Result<Subscriber> {
        let name = self
            .config
            .queue_for_subscriber(channel, identity.unique_id());

        let mut subscribers = self.subscribers.lock().await;
        if let Some(subscriber) = subscribers.get(&name) {
            return Ok(subscriber.clone());
        }

        let queue_url = self.facade.create_or_retrieve_queue(&name).await?;
        let queue_arn = self.facade.get_queue_arn(&queue_url).await?;
        info!(
            queue = %name,
            url = %queue_url,
            scope = %identity.scope(),
            long_lived,
            "Created/found subscriber queue"
        );

        let subscriber = Subscriber {
            name: name.clone(),
            queue_url,
            queue_arn,
            long_lived,
        };
        subscribers.insert(name, subscriber.clone());
        Ok(subscriber)
    }

    /// Drop a cached subscriber whose queue was deleted.
    pub async fn forget(&self, name: &str) {
        self.subscribers.lock().await.remove(name);
    }
}
