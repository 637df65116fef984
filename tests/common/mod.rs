//! Shared utilities for integration tests.
//!
//! Provides clients wired to a shared in-memory queue provider so several
//! simulated machines can exchange messages in one test process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbus::bus::cloud::MemoryQueueFacade;
use crossbus::bus::{FaultKind, ListenerFault, MessageHandler, MessageReceived};
use crossbus::identity::MachineIdentity;
use crossbus::{BusConfig, MessagingClient, Result};
use futures::future::BoxFuture;

/// Creates a client for `machine` backed by the shared provider.
pub fn cloud_client(machine: &str, facade: &Arc<MemoryQueueFacade>) -> MessagingClient {
    MessagingClient::builder(BusConfig::for_test())
        .with_machine(MachineIdentity::new(machine))
        .with_cloud(facade.clone())
        .build()
}

/// Creates a client with no network transport.
pub fn local_client(machine: &str) -> MessagingClient {
    MessagingClient::builder(BusConfig::for_test())
        .with_machine(MachineIdentity::new(machine))
        .build()
}

/// Handler that records deliveries and faults.
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<(String, String)>>,
    faults: Mutex<Vec<ListenerFault>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn has_fault(&self, kind: FaultKind) -> bool {
        self.faults.lock().unwrap().iter().any(|f| f.kind == kind)
    }
}

impl MessageHandler for Recorder {
    fn handle(&self, message: Arc<MessageReceived>) -> BoxFuture<'static, Result<()>> {
        self.messages.lock().unwrap().push((
            message.channel.clone(),
            message.envelope.message().to_string(),
        ));
        Box::pin(async { Ok(()) })
    }

    fn on_fault(&self, fault: &ListenerFault) {
        self.faults.lock().unwrap().push(fault.clone());
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Gives in-flight deliveries time to land before asserting absence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
