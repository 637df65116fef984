//! Handler dispatch utilities.
//!
//! Provides common patterns for dispatching received messages and faults to
//! registered handlers.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{error, warn};

use super::{FaultKind, ListenerFault, MessageHandler, MessageReceived, Result};

/// Shared, growable handler list owned by a listener.
pub type HandlerSet = Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>;

/// Create an empty handler set.
pub fn handler_set() -> HandlerSet {
    Arc::new(RwLock::new(Vec::new()))
}

/// Dispatch a message to all registered handlers.
///
/// Calls each handler in sequence. A failing handler is logged and reported
/// to every handler's `on_fault`, then dispatch continues. Returns `true` if
/// all handlers succeeded.
pub async fn dispatch_to_handlers(handlers: &HandlerSet, message: &Arc<MessageReceived>) -> bool {
    // Snapshot under the read lock, then release before awaiting handlers.
    let snapshot: Vec<_> = handlers.read().await.iter().cloned().collect();
    let mut all_succeeded = true;

    for handler in &snapshot {
        if let Err(e) = handler.handle(Arc::clone(message)).await {
            error!(channel = %message.channel, error = %e, "Handler failed");
            all_succeeded = false;
            let fault = ListenerFault::new(
                FaultKind::Handler,
                Some(&message.channel),
                e.to_string(),
            );
            for observer in &snapshot {
                observer.on_fault(&fault);
            }
        }
    }

    all_succeeded
}

/// Report a fault to all registered handlers.
pub async fn report_fault(handlers: &HandlerSet, fault: ListenerFault) {
    if fault.is_fatal() {
        error!(channel = ?fault.channel, kind = ?fault.kind, error = %fault.message, "Listener fault");
    } else {
        warn!(channel = ?fault.channel, kind = ?fault.kind, error = %fault.message, "Listener fault");
    }

    forward_fault(handlers, &fault).await;
}

/// Hand a fault to every handler without logging it again.
pub async fn forward_fault(handlers: &HandlerSet, fault: &ListenerFault) {
    for handler in handlers.read().await.iter() {
        handler.on_fault(fault);
    }
}

/// Spawn a task handing `fault` to every handler.
///
/// For use from the synchronous `on_fault` hook.
pub(crate) fn spawn_forward_fault(handlers: HandlerSet, fault: ListenerFault) {
    tokio::spawn(async move {
        forward_fault(&handlers, &fault).await;
    });
}

/// Handler that re-dispatches everything it receives into another set.
///
/// Composite listeners attach one of these to each listener they wrap.
pub(crate) struct Forward {
    handlers: HandlerSet,
}

impl Forward {
    pub(crate) fn new(handlers: HandlerSet) -> Arc<Self> {
        Arc::new(Self { handlers })
    }
}

impl MessageHandler for Forward {
    fn handle(&self, message: Arc<MessageReceived>) -> BoxFuture<'static, Result<()>> {
        let handlers = self.handlers.clone();
        Box::pin(async move {
            dispatch_to_handlers(&handlers, &message).await;
            Ok(())
        })
    }

    fn on_fault(&self, fault: &ListenerFault) {
        spawn_forward_fault(self.handlers.clone(), fault.clone());
    }
}
