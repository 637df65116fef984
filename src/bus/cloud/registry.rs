//! Reference-counted subscriptions.
//!
//! Logical listeners that share a subscriber queue share one physical
//! subscription and one poller. The first subscribe binds the queue to the
//! topic and starts the poller; the last unsubscribe stops the poller and
//! removes the binding. Operations on one subscriber are serialized by a
//! per-subscriber lock; different subscribers proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::facade::QueueFacade;
use super::poller::{PollTarget, Poller};
use super::repository::{Subscriber, SubscriberRepository, Topic};
use crate::bus::dispatch::{handler_set, HandlerSet};
use crate::bus::{MessageHandler, Result};
use crate::config::PollingConfig;

/// Handler attached to a physical subscription.
pub type SubscriptionHandler = Arc<dyn MessageHandler>;

/// Binding between a topic and a subscriber queue.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub channel: String,
    pub topic: Topic,
    pub subscriber: Subscriber,
    pub subscription_arn: Option<String>,
    /// Owns the poller lifetime. Cancelling it stops delivery.
    pub cancel_token: CancellationToken,
}

impl SubscriptionInfo {
    pub fn is_subscribed(&self) -> bool {
        self.subscription_arn.is_some()
    }
}

#[derive(Default)]
struct Slot {
    info: Option<SubscriptionInfo>,
    ref_count: usize,
    handlers: Option<HandlerSet>,
    poller: Option<Poller>,
}

/// Process-wide table of physical subscriptions.
pub struct SubscriptionRegistry {
    facade: Arc<dyn QueueFacade>,
    subscribers: Arc<SubscriberRepository>,
    polling: PollingConfig,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

fn same_handler(a: &SubscriptionHandler, b: &SubscriptionHandler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl SubscriptionRegistry {
    pub fn new(
        facade: Arc<dyn QueueFacade>,
        subscribers: Arc<SubscriberRepository>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            facade,
            subscribers,
            polling,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    async fn existing_slot(&self, key: &str) -> Option<Arc<Mutex<Slot>>> {
        self.slots.lock().await.get(key).cloned()
    }

    fn start_poller(&self, info: &SubscriptionInfo, handlers: HandlerSet) -> Poller {
        Poller::spawn(
            PollTarget {
                facade: self.facade.clone(),
                channel: info.channel.clone(),
                queue_url: info.subscriber.queue_url.clone(),
                handlers,
                polling: self.polling.clone(),
            },
            info.cancel_token.clone(),
        )
    }

    /// Attach `handler` to the subscription of `subscriber` to `topic`.
    ///
    /// The first call binds the queue and starts polling; later calls only
    /// add the handler and bump the reference count.
    #[tracing::instrument(
        name = "bus.subscribe",
        skip_all,
        fields(channel = %topic.channel, subscriber = %subscriber.name)
    )]
    pub async fn subscribe(
        &self,
        topic: &Topic,
        subscriber: &Subscriber,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionInfo> {
        let entry = self.slot(&subscriber.name).await;
        let mut slot = entry.lock().await;

        if let Some(info) = slot.info.clone().filter(SubscriptionInfo::is_subscribed) {
            let handlers = slot.handlers.get_or_insert_with(handler_set).clone();
            handlers.write().await.push(handler);
            slot.ref_count += 1;

            // Restart a poller ended by a fatal provider error.
            let info = if slot.poller.as_ref().is_some_and(Poller::is_finished) {
                let info = SubscriptionInfo {
                    cancel_token: CancellationToken::new(),
                    ..info
                };
                slot.poller = Some(self.start_poller(&info, handlers));
                slot.info = Some(info.clone());
                warn!("Restarted stopped queue poller");
                info
            } else {
                info
            };

            debug!(ref_count = slot.ref_count, "Joined existing subscription");
            return Ok(info);
        }

        let info = match self.bind(topic, subscriber).await {
            Ok(info) => info,
            Err(e) => {
                self.prune(&subscriber.name, &entry, &slot).await;
                return Err(e);
            }
        };

        let handlers = handler_set();
        handlers.write().await.push(handler);
        slot.poller = Some(self.start_poller(&info, handlers.clone()));
        slot.handlers = Some(handlers);
        slot.info = Some(info.clone());
        slot.ref_count = 1;

        info!(
            subscription_arn = ?info.subscription_arn,
            "Subscribed queue to topic"
        );
        Ok(info)
    }

    /// Ensure the queue exists, allow the topic to publish into it and bind it.
    async fn bind(&self, topic: &Topic, subscriber: &Subscriber) -> Result<SubscriptionInfo> {
        let queue_url = self
            .facade
            .create_or_retrieve_queue(&subscriber.name)
            .await?;
        let queue_arn = self.facade.get_queue_arn(&queue_url).await?;
        self.facade
            .set_queue_policy_for_topic_publish(&queue_url, &queue_arn, &topic.arn)
            .await?;
        let subscription_arn = self
            .facade
            .subscribe_queue_to_topic(&queue_arn, &topic.arn)
            .await?;

        Ok(SubscriptionInfo {
            channel: topic.channel.clone(),
            topic: topic.clone(),
            subscriber: Subscriber {
                queue_url,
                queue_arn,
                ..subscriber.clone()
            },
            subscription_arn: Some(subscription_arn),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Drop an unbound slot from the table unless another task still holds it.
    ///
    /// Called with the slot locked. Tasks never wait on a slot while holding
    /// the table lock, so taking it here cannot deadlock.
    async fn prune(&self, key: &str, entry: &Arc<Mutex<Slot>>, slot: &Slot) {
        if slot.ref_count > 0 || slot.info.is_some() {
            return;
        }
        let mut slots = self.slots.lock().await;
        // One reference in the table, one held by the caller.
        if Arc::strong_count(entry) == 2 {
            slots.remove(key);
        }
    }

    /// Detach `handler` and release one reference.
    ///
    /// The last release stops the poller, waits for it, unbinds the queue and
    /// deletes short-lived queues. Releasing an unbound subscriber is a no-op.
    #[tracing::instrument(
        name = "bus.unsubscribe",
        skip_all,
        fields(channel = %topic.channel, subscriber = %subscriber.name)
    )]
    pub async fn unsubscribe(
        &self,
        topic: &Topic,
        subscriber: &Subscriber,
        handler: &SubscriptionHandler,
    ) -> Result<()> {
        let Some(entry) = self.existing_slot(&subscriber.name).await else {
            return Ok(());
        };
        let mut slot = entry.lock().await;

        let Some(info) = slot.info.clone() else {
            debug!("Subscriber not bound, nothing to release");
            return Ok(());
        };

        if slot.ref_count > 1 {
            slot.ref_count -= 1;
            self.detach(&slot, handler).await;
            debug!(ref_count = slot.ref_count, "Released shared subscription");
            return Ok(());
        }

        if let Some(poller) = slot.poller.take() {
            poller.stop().await;
        }

        if let Some(arn) = &info.subscription_arn {
            if let Err(e) = self.facade.unsubscribe_queue_from_topic(arn).await {
                // Still bound at the provider; resume delivery.
                let token = CancellationToken::new();
                let info = SubscriptionInfo {
                    cancel_token: token,
                    ..info
                };
                if let Some(handlers) = slot.handlers.clone() {
                    slot.poller = Some(self.start_poller(&info, handlers));
                }
                slot.info = Some(info);
                return Err(e);
            }
        }

        slot.info = None;
        slot.handlers = None;
        slot.ref_count = 0;

        if !info.subscriber.long_lived {
            if let Err(e) = self.facade.delete_queue(&info.subscriber.queue_url).await {
                warn!(error = %e, "Failed to delete short-lived queue");
            }
            self.subscribers.forget(&info.subscriber.name).await;
        }
        self.prune(&subscriber.name, &entry, &slot).await;

        info!("Unsubscribed queue from topic");
        Ok(())
    }

    async fn detach(&self, slot: &Slot, handler: &SubscriptionHandler) {
        if let Some(handlers) = &slot.handlers {
            let mut handlers = handlers.write().await;
            if let Some(pos) = handlers.iter().position(|h| same_handler(h, handler)) {
                handlers.remove(pos);
            }
        }
    }

    /// Number of subscribers with a tracked slot.
    pub async fn tracked_subscribers(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Logical listeners sharing the named subscriber.
    pub async fn ref_count(&self, subscriber_name: &str) -> usize {
        match self.existing_slot(subscriber_name).await {
            Some(slot) => slot.lock().await.ref_count,
            None => 0,
        }
    }

    /// Current binding for the named subscriber, if any.
    pub async fn info(&self, subscriber_name: &str) -> Option<SubscriptionInfo> {
        match self.existing_slot(subscriber_name).await {
            Some(slot) => slot.lock().await.info.clone(),
            None => None,
        }
    }

    /// Whether the named subscriber's poller is still running.
    pub async fn is_polling(&self, subscriber_name: &str) -> bool {
        match self.existing_slot(subscriber_name).await {
            Some(slot) => slot
                .lock()
                .await
                .poller
                .as_ref()
                .is_some_and(|p| !p.is_finished()),
            None => false,
        }
    }
}
