//! Payload codec selection.
//!
//! A payload type declares how it travels through its `Marker`:
//! - `Contract`: structured type, encoded as JSON text
//! - `Packed`: protobuf message, encoded as base64 for text transports
//! - `Unmarked`: no codec; serialization fails with `NotSerializable`
//!
//! Decoding never fails loudly. A transport that receives a bad packet gets
//! `None` back and keeps running.

use base64::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{BusError, Result};

/// Codec declaration for a payload type.
pub enum Marker<T> {
    Contract {
        encode: fn(&T) -> serde_json::Result<String>,
        decode: fn(&str) -> serde_json::Result<T>,
    },
    Packed {
        encode: fn(&T) -> Vec<u8>,
        decode: fn(&[u8]) -> std::result::Result<T, prost::DecodeError>,
    },
    Unmarked,
}

impl<T: Serialize + DeserializeOwned> Marker<T> {
    /// Structured contract marker (JSON codec).
    pub fn contract() -> Self {
        Marker::Contract {
            encode: |value: &T| serde_json::to_string(value),
            decode: |raw: &str| serde_json::from_str(raw),
        }
    }
}

impl<T: prost::Message + Default> Marker<T> {
    /// Binary marker (protobuf codec, base64 on the wire).
    pub fn packed() -> Self {
        Marker::Packed {
            encode: |value: &T| value.encode_to_vec(),
            decode: |bytes: &[u8]| T::decode(bytes),
        }
    }
}

/// A type that can ride inside an envelope.
pub trait Payload: Sized + Send + 'static {
    /// Stable name written to the envelope `type` field.
    const TYPE_TAG: &'static str;

    /// How values of this type are encoded. Default: no codec.
    fn marker() -> Marker<Self> {
        Marker::Unmarked
    }
}

/// Stateless codec dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializerStrategy;

impl SerializerStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Encode a payload as envelope text.
    pub fn serialize<T: Payload>(&self, value: &T) -> Result<String> {
        match T::marker() {
            Marker::Contract { encode, .. } => encode(value).map_err(BusError::from),
            Marker::Packed { encode, .. } => Ok(BASE64_STANDARD.encode(encode(value))),
            Marker::Unmarked => Err(BusError::NotSerializable(T::TYPE_TAG.to_string())),
        }
    }

    /// Decode envelope text. Corrupt input yields `None`.
    pub fn deserialize<T: Payload>(&self, raw: &str) -> Option<T> {
        match T::marker() {
            Marker::Contract { decode, .. } => match decode(raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(type_tag = T::TYPE_TAG, error = %e, "Discarding undecodable contract payload");
                    None
                }
            },
            Marker::Packed { decode, .. } => {
                let bytes = match BASE64_STANDARD.decode(raw) {
                    Ok(b) => b,
                    Err(e) => {
                        debug!(type_tag = T::TYPE_TAG, error = %e, "Discarding payload with invalid base64");
                        return None;
                    }
                };
                match decode(&bytes) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        debug!(type_tag = T::TYPE_TAG, error = %e, "Discarding undecodable packed payload");
                        None
                    }
                }
            }
            Marker::Unmarked => None,
        }
    }
}
