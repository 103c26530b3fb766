//! relayq configuration: TOML files with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Root configuration for a relayq node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub destination: DestinationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            queue: QueueConfig::default(),
            engine: EngineConfig::default(),
            destination: DestinationConfig::default(),
        }
    }
}

/// Identity and storage location of this queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of this queue system; also its transport address.
    pub name: String,
    /// Directory for the SQLite queue databases.
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "relayq-node".to_string(),
            data_dir: "./data".to_string(),
        }
    }
}

/// Queue sizing and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of items admitted to the in-queue; None = unbounded.
    pub in_queue_max_length: Option<u64>,
    /// Keep completed out-items in the out-queue instead of removing them.
    pub retain_completed_out_items: bool,
    /// Keep completed in-items in the in-queue instead of removing them.
    pub retain_completed_in_items: bool,
    /// Storage backend: "sqlite" or "none".
    pub storage: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            in_queue_max_length: Some(1000),
            retain_completed_out_items: false,
            retain_completed_in_items: false,
            storage: "sqlite".to_string(),
        }
    }
}

/// Queue manager maintenance and recovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between maintenance passes.
    pub check_interval_ms: u64,
    /// Unsent completion responses older than this are discarded.
    pub unsent_response_max_age_hours: u64,
    /// How long successfully sent completion responses are remembered for
    /// resynchronizing peers.
    pub recent_response_retention_secs: u64,
    /// A DISPATCHING out-item whose peer has been gone longer than this is
    /// treated as transfer-failed.
    pub dead_peer_grace_secs: u64,
    /// A DISPATCHING out-item stuck longer than this is treated as
    /// transfer-failed even if the peer is present.
    pub dispatch_stuck_timeout_secs: u64,
    /// Base age after which a DISPATCHED out-item gets a warning; each
    /// warning multiplies the next threshold.
    pub dispatched_age_warning_secs: u64,
    /// How long startup waits for peers to synchronize before resuming
    /// normal traffic anyway.
    pub startup_sync_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            unsent_response_max_age_hours: 24,
            recent_response_retention_secs: 600,
            dead_peer_grace_secs: 60,
            dispatch_stuck_timeout_secs: 1800,
            dispatched_age_warning_secs: 3600,
            startup_sync_timeout_ms: 15_000,
        }
    }
}

/// Per-destination worker and back-pressure tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Capacity of each sequential worker's command channel.
    pub command_queue_capacity: usize,
    /// Poll interval for draining the local redispatch queue.
    pub redispatch_poll_interval_ms: u64,
    /// After the remote in-queue filled up, dispatch resumes only once the
    /// estimated length drops below max_length - refill_delta.
    pub refill_delta: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: 1000,
            redispatch_poll_interval_ms: 250,
            refill_delta: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::Validation("node.name must not be empty".into()));
        }
        if self.destination.command_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "destination.command_queue_capacity must be > 0".into(),
            ));
        }
        if self.engine.check_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.check_interval_ms must be > 0".into(),
            ));
        }
        if self.destination.redispatch_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "destination.redispatch_poll_interval_ms must be > 0".into(),
            ));
        }
        match self.queue.storage.as_str() {
            "sqlite" | "none" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "queue.storage must be \"sqlite\" or \"none\", got \"{}\"",
                    other
                )));
            }
        }
        if let Some(max) = self.queue.in_queue_max_length {
            if max == 0 {
                return Err(ConfigError::Validation(
                    "queue.in_queue_max_length must be > 0 when set".into(),
                ));
            }
        }
        Ok(())
    }
}
