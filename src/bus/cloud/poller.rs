//! Background queue poller.
//!
//! One poller runs per physical subscription. It reads the subscriber queue
//! until its cancellation token fires, suppresses recently seen messages,
//! hands new envelopes to the subscription's handlers and deletes every
//! message it has read.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dedup::{fingerprint, RecentMessages};
use super::facade::{QueueFacade, QueueMessage};
use crate::bus::dispatch::{dispatch_to_handlers, report_fault, HandlerSet};
use crate::bus::{Envelope, FaultKind, ListenerFault, MessageReceived};
use crate::config::PollingConfig;
use crate::utils::retry::{error_backoff, idle_backoff, Pacer};

/// Everything a poller needs, owned by its task.
pub struct PollTarget {
    pub facade: Arc<dyn QueueFacade>,
    pub channel: String,
    pub queue_url: String,
    pub handlers: HandlerSet,
    pub polling: PollingConfig,
}

/// Handle on a running poller.
pub struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Start polling under `token`.
    pub fn spawn(target: PollTarget, token: CancellationToken) -> Self {
        let handle = tokio::spawn(run(target, token.clone()));
        Self { token, handle }
    }

    /// Whether the task has exited, e.g. after a fatal provider error.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the poller and wait until its task has exited.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Queue poller task ended abnormally");
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run(target: PollTarget, token: CancellationToken) {
    let polling = &target.polling;
    let mut seen = RecentMessages::new(polling.dedup_capacity);
    let mut idle = Pacer::new(
        idle_backoff(polling),
        Duration::from_millis(polling.idle_max_ms.max(polling.idle_min_ms)),
    );
    let mut errors = Pacer::new(
        error_backoff(polling),
        Duration::from_millis(polling.error_backoff_ms),
    );

    info!(channel = %target.channel, queue_url = %target.queue_url, "Starting queue poller");

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = target.facade.read_queue(&target.queue_url) => read,
        };

        match read {
            Ok(messages) if messages.is_empty() => {
                errors.reset();
                if !pause(&token, idle.next_delay()).await {
                    break;
                }
            }
            Ok(messages) => {
                idle.reset();
                errors.reset();
                for message in messages {
                    if token.is_cancelled() {
                        // Undeleted messages become visible again after the
                        // provider's visibility timeout.
                        break;
                    }
                    process(&target, &mut seen, message).await;
                }
            }
            Err(e) if e.is_fatal() => {
                let fault = ListenerFault::new(
                    FaultKind::Fatal,
                    Some(&target.channel),
                    e.to_string(),
                );
                report_fault(&target.handlers, fault).await;
                break;
            }
            Err(e) => {
                let fault = ListenerFault::new(
                    FaultKind::Transient,
                    Some(&target.channel),
                    e.to_string(),
                );
                report_fault(&target.handlers, fault).await;
                if !pause(&token, errors.next_delay()).await {
                    break;
                }
            }
        }
    }

    info!(channel = %target.channel, queue_url = %target.queue_url, "Queue poller stopped");
}

/// Deliver one message unless recently seen, then acknowledge it.
async fn process(target: &PollTarget, seen: &mut RecentMessages, message: QueueMessage) {
    if !seen.insert(fingerprint(&message)) {
        debug!(message_id = %message.id, "Suppressed duplicate message");
        acknowledge(target, &message).await;
        return;
    }

    match Envelope::from_wire(&message.body) {
        Ok(envelope) if envelope.channel() == target.channel => {
            debug!(message_id = %message.id, "Delivering message");
            let received = Arc::new(MessageReceived::new(Arc::new(envelope)));
            dispatch_to_handlers(&target.handlers, &received).await;
        }
        Ok(envelope) => {
            debug!(
                message_id = %message.id,
                channel = %envelope.channel(),
                "Skipping message for another channel"
            );
        }
        Err(e) => {
            let fault = ListenerFault::new(
                FaultKind::Decode,
                Some(&target.channel),
                format!("message {}: {}", message.id, e),
            );
            report_fault(&target.handlers, fault).await;
        }
    }

    acknowledge(target, &message).await;
}

async fn acknowledge(target: &PollTarget, message: &QueueMessage) {
    if let Err(e) = target
        .facade
        .delete_message(&target.queue_url, &message.receipt_handle)
        .await
    {
        // The next read decides whether the queue is still usable.
        let fault = ListenerFault::new(
            FaultKind::Transient,
            Some(&target.channel),
            format!("failed to delete message {}: {}", message.id, e),
        );
        report_fault(&target.handlers, fault).await;
    }
}
