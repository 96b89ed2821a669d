//! Configuration loading and management
//!
//! Handles parsing of `taskpulse.toml` configuration files. Everything has a
//! default, so a missing file yields a fully usable config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broadcast and connection tuning
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Metrics defaults
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast: BroadcastConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Broadcast-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Per-connection outbound channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Per-send timeout in milliseconds; a slower consumer is dropped
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_channel_capacity() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    250
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl BroadcastConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Metrics-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Default trailing window for velocity reports, in days
    #[serde(default = "default_velocity_window_days")]
    pub velocity_window_days: u32,
}

fn default_velocity_window_days() -> u32 {
    30
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            velocity_window_days: default_velocity_window_days(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML content.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.broadcast.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "broadcast.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.broadcast.send_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "broadcast.send_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.metrics.velocity_window_days == 0 {
            return Err(Error::InvalidConfig(
                "metrics.velocity_window_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
