//! Coordinator configuration
//!
//! This module contains the options for the coordinator and the per-transfer
//! settings handed to the transfer engine.

use crate::error::{MultiplexError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the multiplex coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexConfig {
    /// Maximum sessions alive at once (registered and not yet deleted)
    pub max_sessions: usize,

    /// Per-transfer settings
    pub transfer: TransferConfig,
}

/// Per-transfer settings applied by the transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// User agent sent with every request
    pub user_agent: String,

    /// Connection timeout in seconds (0 = engine default)
    pub connect_timeout_secs: u64,

    /// Abort when the rate stays below this many bytes/sec...
    pub low_speed_limit: u32,

    /// ...for this many seconds
    pub low_speed_time_secs: u64,

    /// Follow HTTP redirects
    pub follow_redirects: bool,

    /// Maximum redirects to follow
    pub max_redirects: u32,

    /// Engine-level protocol tracing to stderr
    pub verbose: bool,
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("multifetch/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            low_speed_limit: 10,
            low_speed_time_secs: 3,
            follow_redirects: false,
            max_redirects: 10,
            verbose: false,
        }
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn low_speed_time(&self) -> Duration {
        Duration::from_secs(self.low_speed_time_secs)
    }
}

impl MultiplexConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MultiplexError::invalid_config("path", format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Set the session limit
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.transfer.user_agent = ua.into();
        self
    }

    /// Set the connect timeout in seconds
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.transfer.connect_timeout_secs = secs;
        self
    }

    /// Set the low-speed abort threshold
    pub fn low_speed(mut self, bytes_per_sec: u32, secs: u64) -> Self {
        self.transfer.low_speed_limit = bytes_per_sec;
        self.transfer.low_speed_time_secs = secs;
        self
    }

    /// Enable or disable redirect following
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.transfer.follow_redirects = follow;
        self
    }

    /// Enable or disable engine-level verbose output
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.transfer.verbose = verbose;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(MultiplexError::invalid_config(
                "max_sessions",
                "Must be at least 1",
            ));
        }

        if self.max_sessions > u32::MAX as usize {
            return Err(MultiplexError::invalid_config(
                "max_sessions",
                format!("Must be at most {}", u32::MAX),
            ));
        }

        if self.transfer.user_agent.trim().is_empty() {
            return Err(MultiplexError::invalid_config(
                "user_agent",
                "Must not be empty",
            ));
        }

        if self.transfer.low_speed_limit > 0 && self.transfer.low_speed_time_secs == 0 {
            return Err(MultiplexError::invalid_config(
                "low_speed_time_secs",
                "Must be at least 1 when low_speed_limit is set",
            ));
        }

        if self.transfer.follow_redirects && self.transfer.max_redirects == 0 {
            return Err(MultiplexError::invalid_config(
                "max_redirects",
                "Must be at least 1 when follow_redirects is enabled",
            ));
        }

        Ok(())
    }
}
