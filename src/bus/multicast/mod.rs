//! Multicast broadcaster wrapper.
//!
//! Wraps any number of `Broadcaster` implementations and fans each send out
//! to all of them. One failing transport never stops delivery through the
//! others.
//!
//! # Example
//!
//! ```ignore
//! use crossbus::bus::{LocalHub, MulticastBroadcaster};
//!
//! let hub = LocalHub::new();
//! let multicast = MulticastBroadcaster::new(vec![
//!     Arc::new(hub.broadcaster()),
//!     remote_broadcaster,
//! ]);
//! multicast.send("orders", "created:42").await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Broadcaster, BusError, Envelope, Result};

/// Broadcaster that sends through every wrapped broadcaster in turn.
pub struct MulticastBroadcaster {
    inner: Vec<Arc<dyn Broadcaster>>,
}

impl MulticastBroadcaster {
    pub fn new(inner: Vec<Arc<dyn Broadcaster>>) -> Self {
        Self { inner }
    }

    /// Number of wrapped broadcasters.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl Broadcaster for MulticastBroadcaster {
    fn is_alive(&self) -> bool {
        self.inner.iter().any(|b| b.is_alive())
    }

    /// Send through each wrapped broadcaster.
    ///
    /// Partial failures are logged. The call fails only when every wrapped
    /// broadcaster failed.
    #[tracing::instrument(name = "bus.multicast", skip_all, fields(channel = %envelope.channel()))]
    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let mut failures = 0;
        let mut last_error = None;

        for (index, broadcaster) in self.inner.iter().enumerate() {
            if let Err(e) = broadcaster.send_envelope(envelope.clone()).await {
                warn!(index, error = %e, "Multicast member failed to send");
                failures += 1;
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) if failures == self.inner.len() => Err(BusError::AllBroadcastsFailed {
                count: failures,
                last: e.to_string(),
            }),
            _ => {
                debug!(
                    delivered = self.inner.len() - failures,
                    failed = failures,
                    "Multicast send complete"
                );
                Ok(())
            }
        }
    }
}
