//! Network relay for bridging a local transport across machines.
//!
//! `RelayBroadcaster` delivers locally, then wraps the envelope in a
//! `NetworkRelayMessage` and publishes it on the mode's relay channel through
//! a remote broadcaster. `RelayListener` hears both: local deliveries go
//! straight to its handlers, remote relay messages are unwrapped and delivered
//! only when they originated on another machine.
//!
//! Each relaying client carries a `RelayOrigin`: the machine name, kept as
//! metadata, and a process id that is the loop guard. A relay message whose
//! process id matches the local origin is never delivered again. Other
//! processes on the same host still receive it, since the local transport
//! does not reach them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::dispatch::{dispatch_to_handlers, handler_set, spawn_forward_fault, Forward, HandlerSet};
use super::serializer::{Marker, Payload, SerializerStrategy};
use crate::identity::{IdentityProvider, InstanceIdentity};

use super::{
    validate_channel, Broadcaster, BroadcasterExt, Envelope, Listener, ListenerFault,
    MessageHandler, MessageReceived, Result, TransportMode,
};

/// Channel carrying relay traffic for a transport mode.
pub fn relay_channel(mode: TransportMode) -> String {
    format!("network-relay-{}", mode)
}

/// Sender identity stamped on relayed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOrigin {
    machine_name: String,
    process_id: String,
}

impl RelayOrigin {
    /// Origin for this process on `machine_name`, with a fresh process id.
    pub fn new(machine_name: impl Into<String>) -> Self {
        Self::with_process_id(machine_name, InstanceIdentity::new().unique_id())
    }

    pub fn with_process_id(
        machine_name: impl Into<String>,
        process_id: impl Into<String>,
    ) -> Self {
        Self {
            machine_name: machine_name.into(),
            process_id: process_id.into(),
        }
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }
}

/// Envelope payload wrapped for transit to other machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRelayMessage {
    /// Machine that performed the original send.
    pub machine_name: String,
    /// Process that performed the original send.
    pub process_id: String,
    /// Transport the original send targeted.
    pub mode: TransportMode,
    pub channel: String,
    pub message: String,
    /// Type tag of the original envelope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
}

impl Payload for NetworkRelayMessage {
    const TYPE_TAG: &'static str = "crossbus.NetworkRelayMessage";

    fn marker() -> Marker<Self> {
        Marker::contract()
    }
}

impl NetworkRelayMessage {
    fn wrap(envelope: &Envelope, origin: &RelayOrigin, mode: TransportMode) -> Self {
        Self {
            machine_name: origin.machine_name.clone(),
            process_id: origin.process_id.clone(),
            mode,
            channel: envelope.channel().to_string(),
            message: envelope.message().to_string(),
            type_tag: envelope.type_tag().ok().flatten().map(str::to_string),
        }
    }

    fn unwrap_envelope(self) -> Result<Envelope> {
        Envelope::with_type_tag(self.channel, self.message, self.type_tag)
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Sends locally and mirrors every send to other machines.
pub struct RelayBroadcaster {
    local: Arc<dyn Broadcaster>,
    remote: Arc<dyn Broadcaster>,
    origin: RelayOrigin,
    mode: TransportMode,
    serializer: SerializerStrategy,
}

impl RelayBroadcaster {
    pub fn new(
        local: Arc<dyn Broadcaster>,
        remote: Arc<dyn Broadcaster>,
        origin: RelayOrigin,
        mode: TransportMode,
    ) -> Self {
        Self {
            local,
            remote,
            origin,
            mode,
            serializer: SerializerStrategy::new(),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }
}

#[async_trait]
impl Broadcaster for RelayBroadcaster {
    fn is_alive(&self) -> bool {
        self.local.is_alive()
    }

    #[tracing::instrument(
        name = "bus.relay.send",
        skip_all,
        fields(channel = %envelope.channel(), mode = %self.mode)
    )]
    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let relay = NetworkRelayMessage::wrap(&envelope, &self.origin, self.mode);

        self.local.send_envelope(envelope).await?;
        self.remote
            .send_payload(&relay_channel(self.mode), &relay, &self.serializer)
            .await?;

        debug!(machine = %self.origin.machine_name, "Relayed envelope to network");
        Ok(())
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Decides whether a relay message belongs to this listener.
struct RelayFilter {
    channels: Arc<RwLock<HashSet<String>>>,
    process_id: String,
    mode: TransportMode,
}

impl RelayFilter {
    async fn accepts(&self, relay: &NetworkRelayMessage) -> bool {
        if relay.process_id == self.process_id {
            debug!(channel = %relay.channel, "Ignoring relay message from this process");
            return false;
        }
        if relay.mode != self.mode {
            debug!(mode = %relay.mode, "Ignoring relay message for another mode");
            return false;
        }
        self.channels.read().await.contains(&relay.channel)
    }
}

/// Unwraps relay messages from other machines.
struct RemoteForward {
    handlers: HandlerSet,
    filter: Arc<RelayFilter>,
    serializer: SerializerStrategy,
}

impl MessageHandler for RemoteForward {
    fn handle(&self, message: Arc<MessageReceived>) -> BoxFuture<'static, Result<()>> {
        let Some(relay) = message
            .typed::<NetworkRelayMessage>(self.serializer)
            .message()
        else {
            debug!(channel = %message.channel, "Dropping undecodable relay message");
            return Box::pin(async { Ok(()) });
        };

        let handlers = self.handlers.clone();
        let filter = self.filter.clone();
        Box::pin(async move {
            if !filter.accepts(&relay).await {
                return Ok(());
            }
            let envelope = relay.unwrap_envelope()?;
            let received = Arc::new(MessageReceived::new(Arc::new(envelope)));
            dispatch_to_handlers(&handlers, &received).await;
            Ok(())
        })
    }

    fn on_fault(&self, fault: &ListenerFault) {
        spawn_forward_fault(self.handlers.clone(), fault.clone());
    }
}

/// Listener that merges local deliveries with relayed remote ones.
pub struct RelayListener {
    local: Arc<dyn Listener>,
    remote: Arc<dyn Listener>,
    origin: RelayOrigin,
    mode: TransportMode,
    channels: Arc<RwLock<HashSet<String>>>,
    handlers: HandlerSet,
    relay_registered: Mutex<bool>,
}

impl RelayListener {
    /// Wire forwarding handlers into both underlying listeners.
    pub async fn new(
        local: Arc<dyn Listener>,
        remote: Arc<dyn Listener>,
        origin: RelayOrigin,
        mode: TransportMode,
    ) -> Self {
        let handlers = handler_set();
        let channels = Arc::new(RwLock::new(HashSet::new()));

        local
            .add_handler(Forward::new(handlers.clone()))
            .await;
        remote
            .add_handler(Arc::new(RemoteForward {
                handlers: handlers.clone(),
                filter: Arc::new(RelayFilter {
                    channels: channels.clone(),
                    process_id: origin.process_id.clone(),
                    mode,
                }),
                serializer: SerializerStrategy::new(),
            }))
            .await;

        Self {
            local,
            remote,
            origin,
            mode,
            channels,
            handlers,
            relay_registered: Mutex::new(false),
        }
    }

    pub fn origin(&self) -> &RelayOrigin {
        &self.origin
    }

    async fn ensure_relay_registered(&self) -> Result<()> {
        let mut registered = self.relay_registered.lock().await;
        if !*registered {
            self.remote.register_channel(&relay_channel(self.mode)).await?;
            *registered = true;
            info!(mode = %self.mode, "Listening for relayed messages");
        }
        Ok(())
    }
}

#[async_trait]
impl Listener for RelayListener {
    fn is_alive(&self) -> bool {
        self.local.is_alive()
    }

    async fn register_channel(&self, channel: &str) -> Result<()> {
        validate_channel(channel)?;
        self.ensure_relay_registered().await?;
        self.local.register_channel(channel).await?;
        self.channels.write().await.insert(channel.to_string());
        Ok(())
    }

    async fn unregister_channel(&self, channel: &str) -> Result<()> {
        self.channels.write().await.remove(channel);
        self.local.unregister_channel(channel).await
    }

    async fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.push(handler);
    }

    async fn dispose(&self) -> Result<()> {
        self.channels.write().await.clear();
        let local = self.local.dispose().await;

        let mut registered = self.relay_registered.lock().await;
        let remote = self.remote.dispose().await;
        *registered = false;

        local.and(remote)
    }
}

#[cfg(test)]
mod tests;
