//! The unit exchanged between every transport.
//!
//! Wire format is compact JSON with fields in a fixed order:
//! `{"ver":"1.1","channel":"...","message":"...","type":"..."}`.
//! `type` is omitted for untyped envelopes. Envelopes at version `1.0`
//! predate the type tag and refuse to expose one.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::serializer::{Payload, SerializerStrategy};
use super::{validate_channel, BusError, Result};

/// Envelope revision written by this crate.
pub const PROTOCOL_VERSION: &str = "1.1";

/// Legacy revision without a type tag.
pub const LEGACY_VERSION: &str = "1.0";

/// Channel/message pair with protocol metadata. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "ver")]
    version: String,
    channel: String,
    message: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    type_tag: Option<String>,
}

impl Envelope {
    /// Build an untyped envelope.
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Result<Self> {
        Self::build(PROTOCOL_VERSION, channel.into(), message.into(), None)
    }

    /// Build a legacy `1.0` envelope.
    pub fn legacy(channel: impl Into<String>, message: impl Into<String>) -> Result<Self> {
        Self::build(LEGACY_VERSION, channel.into(), message.into(), None)
    }

    /// Serialize `payload` and tag the envelope with its type.
    pub fn typed<P: Payload>(
        channel: impl Into<String>,
        payload: &P,
        serializer: &SerializerStrategy,
    ) -> Result<Self> {
        let message = serializer.serialize(payload)?;
        Self::build(
            PROTOCOL_VERSION,
            channel.into(),
            message,
            Some(P::TYPE_TAG.to_string()),
        )
    }

    /// Rebuild an envelope that crossed another transport with its tag intact.
    pub(crate) fn with_type_tag(
        channel: String,
        message: String,
        type_tag: Option<String>,
    ) -> Result<Self> {
        Self::build(PROTOCOL_VERSION, channel, message, type_tag)
    }

    fn build(
        version: &str,
        channel: String,
        message: String,
        type_tag: Option<String>,
    ) -> Result<Self> {
        validate_channel(&channel)?;
        if message.is_empty() {
            return Err(BusError::InvalidArgument(
                "message must not be empty".to_string(),
            ));
        }
        Ok(Self {
            version: version.to_string(),
            channel,
            message,
            type_tag,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_legacy(&self) -> bool {
        self.version == LEGACY_VERSION
    }

    /// Payload type tag. Fails with `NotSupported` on legacy envelopes.
    pub fn type_tag(&self) -> Result<Option<&str>> {
        if self.is_legacy() {
            return Err(BusError::NotSupported(format!(
                "envelope version {} carries no type information",
                LEGACY_VERSION
            )));
        }
        Ok(self.type_tag.as_deref())
    }

    /// Encode for transport.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from transport, enforcing the same invariants as construction.
    pub fn from_wire(raw: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        Self::build(
            &envelope.version,
            envelope.channel,
            envelope.message,
            envelope.type_tag,
        )
    }
}

/// Typed projection over a shared envelope.
///
/// Holds the original envelope by reference count; converting back and forth
/// never copies or alters it.
pub struct TypedEnvelope<T> {
    envelope: Arc<Envelope>,
    serializer: SerializerStrategy,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Payload> TypedEnvelope<T> {
    pub fn new(envelope: Arc<Envelope>, serializer: SerializerStrategy) -> Self {
        Self {
            envelope,
            serializer,
            _payload: PhantomData,
        }
    }

    pub fn channel(&self) -> &str {
        self.envelope.channel()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn into_inner(self) -> Arc<Envelope> {
        self.envelope
    }

    /// Decode the payload on demand.
    ///
    /// Returns `None` when the payload is corrupt or tagged as another type.
    pub fn message(&self) -> Option<T> {
        match self.envelope.type_tag() {
            Ok(Some(tag)) if tag != T::TYPE_TAG => {
                debug!(
                    expected = T::TYPE_TAG,
                    actual = tag,
                    "Envelope carries a different payload type"
                );
                None
            }
            _ => self.serializer.deserialize(self.envelope.message()),
        }
    }
}

impl<T: Payload> From<Envelope> for TypedEnvelope<T> {
    fn from(envelope: Envelope) -> Self {
        Self::new(Arc::new(envelope), SerializerStrategy::default())
    }
}

impl<T: Payload> From<Arc<Envelope>> for TypedEnvelope<T> {
    fn from(envelope: Arc<Envelope>) -> Self {
        Self::new(envelope, SerializerStrategy::default())
    }
}

impl<T: Payload> From<TypedEnvelope<T>> for Arc<Envelope> {
    fn from(typed: TypedEnvelope<T>) -> Self {
        typed.into_inner()
    }
}
