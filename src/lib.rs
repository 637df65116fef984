//! crossbus - cross-process publish/subscribe messaging
//!
//! Senders broadcast named-channel messages and independent listeners
//! receive them, whether they live in the same process or on other machines
//! reached through a cloud topic/queue provider.

pub mod bus;
pub mod client;
pub mod config;
pub mod identity;
pub mod utils;

pub use bus::{
    handler_fn, Broadcaster, BroadcasterExt, BusError, Envelope, Listener, MessageHandler,
    MessageReceived, Payload, Result, SerializerStrategy, TransportMode, TypedEnvelope,
};
pub use client::{MessagingClient, MessagingClientBuilder};
pub use config::BusConfig;
