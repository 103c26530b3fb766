//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "relayq.toml",
    "config.toml",
    "./config/relayq.toml",
    "/etc/relayq/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAYQ_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply RELAYQ_* environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(name) = env::var("RELAYQ_NODE_NAME") {
            config.node.name = name;
        }
        if let Ok(dir) = env::var("RELAYQ_DATA_DIR") {
            config.node.data_dir = dir;
        }
        if let Ok(storage) = env::var("RELAYQ_QUEUE_STORAGE") {
            config.queue.storage = storage;
        }
        if let Ok(value) = env::var("RELAYQ_IN_QUEUE_MAX_LENGTH") {
            if let Ok(max) = value.parse::<u64>() {
                config.queue.in_queue_max_length = if max == 0 { None } else { Some(max) };
            }
        }
        if let Ok(value) = env::var("RELAYQ_RETAIN_COMPLETED_OUT_ITEMS") {
            config.queue.retain_completed_out_items = parse_bool(&value);
        }
        if let Ok(value) = env::var("RELAYQ_RETAIN_COMPLETED_IN_ITEMS") {
            config.queue.retain_completed_in_items = parse_bool(&value);
        }
        if let Ok(value) = env::var("RELAYQ_CHECK_INTERVAL_MS") {
            if let Ok(ms) = value.parse() {
                config.engine.check_interval_ms = ms;
            }
        }
        if let Ok(value) = env::var("RELAYQ_STARTUP_SYNC_TIMEOUT_MS") {
            if let Ok(ms) = value.parse() {
                config.engine.startup_sync_timeout_ms = ms;
            }
        }
        if let Ok(value) = env::var("RELAYQ_COMMAND_QUEUE_CAPACITY") {
            if let Ok(capacity) = value.parse() {
                config.destination.command_queue_capacity = capacity;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
