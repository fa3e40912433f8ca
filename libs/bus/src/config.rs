//! Bus Configuration
//!
//! Timeouts and defaults for one bus instance. Loaded from an optional TOML
//! file, then overridden by `BUS_*` environment variables.

use crate::error::{BusError, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration of one bus instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Label used in logs
    pub name: String,
    /// Bridge handshake timeout
    pub handshake_timeout_ms: u64,
    /// Control-message acknowledgement timeout
    pub request_timeout_ms: u64,
    /// Local P2P ask timeout
    pub call_timeout_ms: u64,
    /// How long a leaving node may drain in-flight calls
    pub leave_timeout_ms: u64,
    /// Whether broadcasts reach the publishing node when loopback is unset
    pub default_loopback: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            handshake_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            call_timeout_ms: 30_000,
            leave_timeout_ms: 5_000,
            default_loopback: true,
        }
    }
}

impl BusConfig {
    /// Default configuration with a custom log label
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading bus config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (BUS_ prefix)
        builder = builder.add_source(Environment::with_prefix("BUS").try_parsing(true));

        let config: BusConfig = builder
            .build()
            .map_err(|e| BusError::configuration(format!("failed to build configuration: {e}"), None))?
            .try_deserialize()
            .map_err(|e| {
                BusError::configuration(format!("failed to deserialize configuration: {e}"), None)
            })?;

        config.validate()?;
        debug!(bus = %config.name, "Bus configuration loaded");
        Ok(config)
    }

    /// Reject values the bus cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BusError::configuration("name must not be empty", Some("name")));
        }

        let timeouts = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("leave_timeout_ms", self.leave_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(BusError::configuration(
                    format!("{field} must be greater than zero"),
                    Some(field),
                ));
            }
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}
