//! Message bus for cross-process delivery.
//!
//! This module contains:
//! - `Broadcaster` / `Listener` traits: the capability pair every transport implements
//! - `MessageHandler` trait: for processing received messages
//! - Error taxonomy shared by all transports
//! - Implementations: in-process (`local`), cloud queue (`cloud`), mock
//! - Composition: `MulticastBroadcaster`, `RelayBroadcaster`, `RelayListener`

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub mod cloud;
pub mod dispatch;
pub mod envelope;
pub mod local;
pub mod mock;
pub mod multicast;
pub mod relay;
pub mod serializer;

// Re-exports
pub use dispatch::{dispatch_to_handlers, forward_fault, handler_set, report_fault, HandlerSet};
pub use envelope::{Envelope, TypedEnvelope, LEGACY_VERSION, PROTOCOL_VERSION};
pub use local::{LocalBroadcaster, LocalHub, LocalListener};
pub use mock::MockBroadcaster;
pub use multicast::MulticastBroadcaster;
pub use relay::{relay_channel, NetworkRelayMessage, RelayBroadcaster, RelayListener, RelayOrigin};
pub use serializer::{Marker, Payload, SerializerStrategy};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Type '{0}' carries no serialization marker")]
    NotSerializable(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    #[error("Fatal provider error: {0}")]
    FatalProvider(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("All {count} broadcasters failed, last error: {last}")]
    AllBroadcastsFailed { count: usize, last: String },

    /// Returned by a `MessageHandler` that could not process a message.
    /// Dispatch reports it to the listener's handlers as a `Handler` fault.
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl BusError {
    /// Fatal errors stop the poller that observed them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalProvider(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// ============================================================================
// Transport modes
// ============================================================================

/// Selects which delivery mechanism backs a broadcaster or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Fan-out inside the current process.
    InProcess,
    /// Cloud topic/queue delivery across machines.
    RemoteNetwork,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::RemoteNetwork => "remote_network",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Delivered messages and faults
// ============================================================================

/// A message surfaced to handlers by a listener.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    /// Channel the message arrived on.
    pub channel: String,
    /// The envelope as sent.
    pub envelope: Arc<Envelope>,
    /// When the listener observed the message.
    pub received_at: DateTime<Utc>,
}

impl MessageReceived {
    pub fn new(envelope: Arc<Envelope>) -> Self {
        Self {
            channel: envelope.channel().to_string(),
            envelope,
            received_at: Utc::now(),
        }
    }

    /// Typed view of the payload.
    pub fn typed<T: Payload>(&self, serializer: SerializerStrategy) -> TypedEnvelope<T> {
        TypedEnvelope::new(Arc::clone(&self.envelope), serializer)
    }
}

/// Category of a steady-state delivery fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Recoverable provider error; delivery continues.
    Transient,
    /// Unrecoverable provider error; the affected poller has stopped.
    Fatal,
    /// A payload that could not be decoded into an envelope.
    Decode,
    /// A handler returned an error.
    Handler,
    /// The listener fell behind and messages were skipped.
    Lagged,
}

/// Fault reported through `MessageHandler::on_fault`.
#[derive(Debug, Clone)]
pub struct ListenerFault {
    pub kind: FaultKind,
    pub channel: Option<String>,
    pub message: String,
}

impl ListenerFault {
    pub fn new(kind: FaultKind, channel: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            channel: channel.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == FaultKind::Fatal
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Handler for processing messages from a listener.
pub trait MessageHandler: Send + Sync {
    /// Process a received message.
    ///
    /// Errors are reported as faults; they never reach the transport. Return
    /// `BusError::Handler` for failures of the handler's own work.
    ///
    /// Do not unregister the delivering channel or dispose its listener from
    /// inside this call (including the returned future). Releasing the last
    /// subscription waits for the queue poller, and the poller is waiting on
    /// this handler, so the release never completes. Hand such work to a
    /// spawned task instead.
    fn handle(&self, message: Arc<MessageReceived>) -> BoxFuture<'static, Result<()>>;

    /// Observe a delivery fault. Default: ignore.
    fn on_fault(&self, _fault: &ListenerFault) {}
}

struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<MessageReceived>) + Send + Sync + 'static,
{
    fn handle(&self, message: Arc<MessageReceived>) -> BoxFuture<'static, Result<()>> {
        (self.0)(message);
        Box::pin(async { Ok(()) })
    }
}

/// Adapt a synchronous closure into a `MessageHandler`.
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<MessageReceived>) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Sending half of a transport.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Whether this transport can currently deliver, independent of channel.
    fn is_alive(&self) -> bool;

    /// Deliver a prepared envelope.
    async fn send_envelope(&self, envelope: Envelope) -> Result<()>;

    /// Broadcast a raw message on a channel.
    async fn send(&self, channel: &str, message: &str) -> Result<()> {
        let envelope = Envelope::new(channel, message)?;
        self.send_envelope(envelope).await
    }
}

/// Typed sends for any broadcaster, including trait objects.
#[async_trait]
pub trait BroadcasterExt: Broadcaster {
    /// Serialize `payload` and broadcast it with its type tag.
    async fn send_payload<P>(
        &self,
        channel: &str,
        payload: &P,
        serializer: &SerializerStrategy,
    ) -> Result<()>
    where
        P: Payload + Sync,
    {
        let envelope = Envelope::typed(channel, payload, serializer)?;
        self.send_envelope(envelope).await
    }
}

impl<B: Broadcaster + ?Sized> BroadcasterExt for B {}

/// Receiving half of a transport.
///
/// Dropping a listener without calling `dispose` leaves provider-side
/// subscriptions in place until the process exits.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Whether this transport can currently receive.
    fn is_alive(&self) -> bool;

    /// Start receiving messages for a channel. Registering twice is a no-op.
    async fn register_channel(&self, channel: &str) -> Result<()>;

    /// Stop receiving messages for a channel. Unknown channels are a no-op.
    async fn unregister_channel(&self, channel: &str) -> Result<()>;

    /// Attach a handler to the MessageReceived stream.
    async fn add_handler(&self, handler: Arc<dyn MessageHandler>);

    /// Unregister every channel and stop all background work. Idempotent.
    async fn dispose(&self) -> Result<()>;
}

/// Reject empty channel names before they reach a transport.
pub(crate) fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(BusError::InvalidArgument(
            "channel name must not be empty".to_string(),
        ));
    }
    Ok(())
}
