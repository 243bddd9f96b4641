//! Engine configuration and its TOML loading.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Engine configuration.
///
/// Every field has a default, so a config file only needs the values it
/// changes:
///
/// ```toml
/// target = "quotes.internal:50051"
/// write_budget = 1048576
/// reconnect_backoff_ms = 2000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Endpoint address handed to the connector.
    pub target: String,
    /// Per-call write pump budget in bytes.
    pub write_budget: usize,
    /// Per-batching-queue budget in bytes.
    pub batch_budget: usize,
    /// How long the supervisor waits for a fresh channel to become ready.
    pub connect_timeout_ms: u64,
    /// Deadline of each connectivity watch. Only bounds how long a stop
    /// request can go unnoticed; it is not an application timeout.
    pub watch_interval_ms: u64,
    /// Pause between a channel going down and the next rebuild.
    pub reconnect_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: String::from("127.0.0.1:50051"),
            write_budget: 32 * 1024 * 1024,
            batch_budget: 64 * 1024 * 1024,
            connect_timeout_ms: 5_000,
            watch_interval_ms: 24 * 60 * 60 * 1000,
            reconnect_backoff_ms: 10_000,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(Error::InvalidConfig("target must not be empty".into()));
        }
        if self.write_budget == 0 {
            return Err(Error::InvalidConfig("write_budget must be > 0".into()));
        }
        if self.batch_budget == 0 {
            return Err(Error::InvalidConfig("batch_budget must be > 0".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig("connect_timeout_ms must be > 0".into()));
        }
        if self.watch_interval_ms == 0 {
            return Err(Error::InvalidConfig("watch_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}
