//! Cloud transport, polling and relay configuration sections.

use serde::Deserialize;

/// Cloud topic/queue transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Register the cloud transport for `RemoteNetwork`.
    pub enabled: bool,
    /// Provider region. Uses the default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
    /// Max number of messages to receive in one poll.
    pub max_messages: i32,
    /// Wait time seconds for long polling.
    pub wait_time_secs: i32,
    /// Visibility timeout in seconds for received messages.
    pub visibility_timeout_secs: i32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: None,
            endpoint_url: None,
            max_messages: 10,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
        }
    }
}

/// Poller pacing and duplicate suppression.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// First idle wait after an empty read.
    pub idle_min_ms: u64,
    /// Ceiling for the idle wait.
    pub idle_max_ms: u64,
    /// Ceiling for the wait after a transient provider error.
    pub error_backoff_ms: u64,
    /// Fingerprints remembered per subscriber.
    pub dedup_capacity: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            idle_min_ms: 100,
            idle_max_ms: 5000,
            error_backoff_ms: 1000,
            dedup_capacity: 1000,
        }
    }
}

/// Relay pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay listeners keep a durable per-machine queue instead of a
    /// per-instance one.
    pub long_lived_queues: bool,
}
