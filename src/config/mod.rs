//! Bus configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! `BusConfig`. Also owns the provider naming rules for topics and queues.

mod messaging;

pub use messaging::{CloudConfig, PollingConfig, RelayConfig};

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "crossbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CROSSBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CROSSBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CROSSBUS_LOG";

/// Longest queue name the provider accepts.
pub const MAX_QUEUE_NAME_LEN: usize = 80;
/// Longest topic name the provider accepts.
pub const MAX_TOPIC_NAME_LEN: usize = 256;

/// Main bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Prefix for every topic and queue this process creates.
    pub namespace: String,
    /// Overrides the detected machine identity.
    pub machine_name: Option<String>,
    pub cloud: CloudConfig,
    pub polling: PollingConfig,
    pub relay: RelayConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            namespace: "crossbus".to_string(),
            machine_name: None,
            cloud: CloudConfig::default(),
            polling: PollingConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `crossbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BusConfig = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            namespace: "crossbus-test".to_string(),
            polling: PollingConfig {
                idle_min_ms: 5,
                idle_max_ms: 20,
                error_backoff_ms: 20,
                ..PollingConfig::default()
            },
            ..Self::default()
        }
    }

    /// Provider topic name for a channel.
    pub fn topic_for_channel(&self, channel: &str) -> String {
        bounded_name(
            &format!("{}-{}", self.namespace, channel),
            MAX_TOPIC_NAME_LEN,
        )
    }

    /// Provider queue name for a subscriber identity on a channel.
    pub fn queue_for_subscriber(&self, channel: &str, identity: &str) -> String {
        bounded_name(
            &format!("{}-{}-{}", self.namespace, identity, channel),
            MAX_QUEUE_NAME_LEN,
        )
    }
}

/// Replace provider-illegal characters and cap the length.
///
/// Names that must be shortened keep a hash suffix of the full name so two
/// long names sharing a prefix stay distinct.
fn bounded_name(raw: &str, max_len: usize) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if sanitized.len() <= max_len {
        return sanitized;
    }

    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    let suffix = &digest[..8];
    format!("{}-{}", &sanitized[..max_len - suffix.len() - 1], suffix)
}
