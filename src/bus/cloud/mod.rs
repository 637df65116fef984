//! Cloud topic/queue transport.
//!
//! Each channel maps to one provider topic. Listeners receive through
//! subscriber queues bound to those topics and drained by background
//! pollers. `CloudTransport` owns the per-process state (repositories and
//! the subscription registry) and hands out broadcasters and listeners that
//! share it.
//!
//! Queue naming: `{namespace}-{identity}-{channel}`, where identity is the
//! machine name for long-lived listeners and a random instance id otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::dispatch::{handler_set, Forward, HandlerSet};
use super::{validate_channel, Broadcaster, Envelope, Listener, MessageHandler, Result};
use crate::config::BusConfig;
use crate::identity::{IdentityProvider, InstanceIdentity, MachineIdentity};

#[cfg(feature = "sns-sqs")]
pub mod aws;
pub mod dedup;
pub mod facade;
pub mod memory;
pub mod poller;
pub mod registry;
pub mod repository;

#[cfg(feature = "sns-sqs")]
pub use aws::AwsQueueFacade;
pub use dedup::{fingerprint, RecentMessages};
pub use facade::{QueueFacade, QueueMessage};
pub use memory::{FacadeOp, MemoryQueueFacade};
pub use registry::{SubscriptionHandler, SubscriptionInfo, SubscriptionRegistry};
pub use repository::{Subscriber, SubscriberRepository, Topic, TopicRepository};

/// Shared cloud transport state for one process.
#[derive(Clone)]
pub struct CloudTransport {
    facade: Arc<dyn QueueFacade>,
    topics: Arc<TopicRepository>,
    subscribers: Arc<SubscriberRepository>,
    registry: Arc<SubscriptionRegistry>,
    machine: Arc<MachineIdentity>,
}

impl CloudTransport {
    pub fn new(
        facade: Arc<dyn QueueFacade>,
        config: Arc<BusConfig>,
        machine: MachineIdentity,
    ) -> Self {
        let topics = Arc::new(TopicRepository::new(facade.clone(), config.clone()));
        let subscribers = Arc::new(SubscriberRepository::new(facade.clone(), config.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(
            facade.clone(),
            subscribers.clone(),
            config.polling.clone(),
        ));
        Self {
            facade,
            topics,
            subscribers,
            registry,
            machine: Arc::new(machine),
        }
    }

    pub fn broadcaster(&self) -> CloudBroadcaster {
        CloudBroadcaster {
            facade: self.facade.clone(),
            topics: self.topics.clone(),
        }
    }

    /// Create a listener.
    ///
    /// Long-lived listeners share a durable queue per machine and channel;
    /// short-lived ones get their own queue, deleted when released.
    pub fn listener(&self, long_lived: bool) -> CloudListener {
        let identity: Arc<dyn IdentityProvider> = if long_lived {
            self.machine.clone()
        } else {
            Arc::new(InstanceIdentity::new())
        };
        CloudListener {
            transport: self.clone(),
            identity,
            long_lived,
            handlers: handler_set(),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn is_configured(&self) -> bool {
        self.facade.is_configured()
    }

    /// Delete a subscriber queue that never got bound and drop it from the cache.
    async fn discard_queue(&self, subscriber: &Subscriber) {
        if let Err(e) = self.facade.delete_queue(&subscriber.queue_url).await {
            warn!(queue = %subscriber.name, error = %e, "Failed to delete unbound queue");
        }
        self.subscribers.forget(&subscriber.name).await;
    }
}

/// Publishes envelopes to channel topics.
#[derive(Clone)]
pub struct CloudBroadcaster {
    facade: Arc<dyn QueueFacade>,
    topics: Arc<TopicRepository>,
}

#[async_trait]
impl Broadcaster for CloudBroadcaster {
    fn is_alive(&self) -> bool {
        self.facade.is_configured()
    }

    #[tracing::instrument(name = "bus.send", skip_all, fields(channel = %envelope.channel()))]
    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let topic = self.topics.get_topic(envelope.channel()).await?;
        let body = envelope.to_wire()?;
        let message_id = self
            .facade
            .publish_message_to_topic(&topic.arn, envelope.channel(), &body)
            .await?;

        debug!(topic = %topic.name, message_id = %message_id, "Published envelope to topic");
        Ok(())
    }
}

struct Registration {
    topic: Topic,
    subscriber: Subscriber,
    handler: SubscriptionHandler,
}

/// Receives channel messages through subscriber queues.
///
/// Dropping a listener without `dispose` leaves its subscriptions polling.
pub struct CloudListener {
    transport: CloudTransport,
    identity: Arc<dyn IdentityProvider>,
    long_lived: bool,
    handlers: HandlerSet,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl CloudListener {
    pub fn identity(&self) -> &str {
        self.identity.unique_id()
    }

    pub fn is_long_lived(&self) -> bool {
        self.long_lived
    }

    /// Channels currently registered.
    pub async fn channels(&self) -> Vec<String> {
        self.registrations.lock().await.keys().cloned().collect()
    }

    async fn release(&self, registration: &Registration) -> Result<()> {
        self.transport
            .registry
            .unsubscribe(
                &registration.topic,
                &registration.subscriber,
                &registration.handler,
            )
            .await
    }
}

#[async_trait]
impl Listener for CloudListener {
    fn is_alive(&self) -> bool {
        self.transport.is_configured()
    }

    async fn register_channel(&self, channel: &str) -> Result<()> {
        validate_channel(channel)?;

        let mut registrations = self.registrations.lock().await;
        if registrations.contains_key(channel) {
            return Ok(());
        }

        let topic = self.transport.topics.get_topic(channel).await?;
        let subscriber = self
            .transport
            .subscribers
            .get_subscriber(channel, self.identity.as_ref(), self.long_lived)
            .await?;
        let handler: SubscriptionHandler = Forward::new(self.handlers.clone());
        let subscription = match self
            .transport
            .registry
            .subscribe(&topic, &subscriber, handler.clone())
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                if !self.long_lived {
                    // Nobody else can reach this listener's queue.
                    self.transport.discard_queue(&subscriber).await;
                }
                return Err(e);
            }
        };

        registrations.insert(
            channel.to_string(),
            Registration {
                topic,
                subscriber: subscription.subscriber,
                handler,
            },
        );
        info!(channel = %channel, identity = %self.identity.unique_id(), "Registered channel");
        Ok(())
    }

    async fn unregister_channel(&self, channel: &str) -> Result<()> {
        let mut registrations = self.registrations.lock().await;
        let Some(registration) = registrations.remove(channel) else {
            return Ok(());
        };

        if let Err(e) = self.release(&registration).await {
            registrations.insert(channel.to_string(), registration);
            return Err(e);
        }
        info!(channel = %channel, "Unregistered channel");
        Ok(())
    }

    async fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.push(handler);
    }

    async fn dispose(&self) -> Result<()> {
        let mut registrations = self.registrations.lock().await;
        let mut first_error = None;

        let channels: Vec<String> = registrations.keys().cloned().collect();
        for channel in channels {
            let Some(registration) = registrations.remove(&channel) else {
                continue;
            };
            if let Err(e) = self.release(&registration).await {
                warn!(channel = %channel, error = %e, "Failed to release channel");
                registrations.insert(channel, registration);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
