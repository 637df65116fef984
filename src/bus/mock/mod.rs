//! Mock broadcaster implementation for testing.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Broadcaster, BusError, Envelope, Result};

/// Mock broadcaster for testing.
pub struct MockBroadcaster {
    sent: RwLock<Vec<Envelope>>,
    fail_on_send: RwLock<bool>,
    alive: AtomicBool,
}

impl Default for MockBroadcaster {
    fn default() -> Self {
        Self {
            sent: RwLock::new(Vec::new()),
            fail_on_send: RwLock::new(false),
            alive: AtomicBool::new(true),
        }
    }
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        *self.fail_on_send.write().await = fail;
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }

    pub async fn take_sent(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.write().await)
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        if *self.fail_on_send.read().await {
            return Err(BusError::TransientProvider(
                "Mock send failure".to_string(),
            ));
        }
        self.sent.write().await.push(envelope);
        Ok(())
    }
}
