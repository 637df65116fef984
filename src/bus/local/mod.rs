//! In-process transport.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Channel filtering happens on the listener side.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::dispatch::{dispatch_to_handlers, handler_set, report_fault, HandlerSet};
use super::{
    validate_channel, Broadcaster, Envelope, FaultKind, Listener, ListenerFault, MessageHandler,
    MessageReceived, Result,
};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// Shared fan-out point for every in-process broadcaster and listener.
#[derive(Clone)]
pub struct LocalHub {
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn broadcaster(&self) -> LocalBroadcaster {
        LocalBroadcaster { hub: self.clone() }
    }

    pub fn listener(&self) -> LocalListener {
        LocalListener::new(self.clone())
    }

    /// Number of listeners currently attached.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcaster publishing into a `LocalHub`.
#[derive(Clone)]
pub struct LocalBroadcaster {
    hub: LocalHub,
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    fn is_alive(&self) -> bool {
        true
    }

    #[tracing::instrument(name = "bus.send", skip_all, fields(channel = %envelope.channel()))]
    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        match self.hub.sender.send(Arc::new(envelope)) {
            Ok(receivers) => debug!(receivers, "Published envelope to local hub"),
            // No listeners attached; nothing to deliver.
            Err(_) => debug!("Published envelope (no receivers)"),
        }
        Ok(())
    }
}

/// Listener reading from a `LocalHub`.
pub struct LocalListener {
    hub: LocalHub,
    /// Receiver taken by the consumer task when it starts.
    pending: Mutex<Option<broadcast::Receiver<Arc<Envelope>>>>,
    channels: Arc<RwLock<HashSet<String>>>,
    handlers: HandlerSet,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl LocalListener {
    pub fn new(hub: LocalHub) -> Self {
        // Subscribe immediately so nothing sent after construction is missed.
        let receiver = hub.sender.subscribe();
        Self {
            hub,
            pending: Mutex::new(Some(receiver)),
            channels: Arc::new(RwLock::new(HashSet::new())),
            handlers: handler_set(),
            consumer: Mutex::new(None),
        }
    }

    /// Channels currently registered.
    pub async fn channels(&self) -> Vec<String> {
        self.channels.read().await.iter().cloned().collect()
    }

    fn ensure_consuming(&self) {
        let mut consumer = match self.consumer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if consumer.is_some() {
            return;
        }

        let mut receiver = match self.pending.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .unwrap_or_else(|| self.hub.sender.subscribe());

        let channels = self.channels.clone();
        let handlers = self.handlers.clone();

        *consumer = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if !channels.read().await.contains(envelope.channel()) {
                            continue;
                        }
                        debug!(channel = %envelope.channel(), "Received envelope via local hub");
                        let message = Arc::new(MessageReceived::new(envelope));
                        dispatch_to_handlers(&handlers, &message).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        report_fault(
                            &handlers,
                            ListenerFault::new(
                                FaultKind::Lagged,
                                None,
                                format!("local listener lagged, skipped {} messages", n),
                            ),
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Local hub closed, stopping consumer");
                        break;
                    }
                }
            }
        }));

        info!("Local consumer started");
    }

    fn stop_consuming(&self) {
        let handle = match self.consumer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Listener for LocalListener {
    fn is_alive(&self) -> bool {
        true
    }

    async fn register_channel(&self, channel: &str) -> Result<()> {
        validate_channel(channel)?;
        let added = self.channels.write().await.insert(channel.to_string());
        if added {
            debug!(channel = %channel, "Registered local channel");
        }
        self.ensure_consuming();
        Ok(())
    }

    async fn unregister_channel(&self, channel: &str) -> Result<()> {
        if self.channels.write().await.remove(channel) {
            debug!(channel = %channel, "Unregistered local channel");
        }
        Ok(())
    }

    async fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        let count = {
            let mut handlers = self.handlers.write().await;
            handlers.push(handler);
            handlers.len()
        };
        debug!(handler_count = count, "Handler added to local listener");
    }

    async fn dispose(&self) -> Result<()> {
        self.channels.write().await.clear();
        self.stop_consuming();
        Ok(())
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.stop_consuming();
    }
}
