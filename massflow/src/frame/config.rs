//! Configuration of an analysis frame.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`FrameConfig::ipc_root`].
pub const ENV_IPC_ROOT: &str = "MASSFLOW_IPC_ROOT";
/// Environment variable overriding [`FrameConfig::poll_interval_ms`].
pub const ENV_POLL_INTERVAL_MS: &str = "MASSFLOW_POLL_INTERVAL_MS";
/// Environment variable overriding [`FrameConfig::shutdown_timeout_ms`].
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "MASSFLOW_SHUTDOWN_TIMEOUT_MS";
/// Environment variable overriding [`FrameConfig::default_queue_size`].
pub const ENV_QUEUE_SIZE: &str = "MASSFLOW_QUEUE_SIZE";

/// Settings shared by every stage of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Root of the channel address namespace.
    #[serde(default = "default_ipc_root")]
    pub ipc_root: String,
    /// Liveness poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long shutdown waits for threads, in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Frontend queue capacity of stages that do not set one.
    #[serde(default = "default_queue_size")]
    pub default_queue_size: usize,
}

fn default_ipc_root() -> String {
    "/tmp/mass_pipeline".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_queue_size() -> usize {
    100
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            ipc_root: default_ipc_root(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            default_queue_size: default_queue_size(),
        }
    }
}

impl FrameConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads overrides through `lookup`, starting from the defaults.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(root) = lookup(ENV_IPC_ROOT) {
            config.ipc_root = root;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval_ms = parse_env(ENV_POLL_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            config.shutdown_timeout_ms = parse_env(ENV_SHUTDOWN_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_QUEUE_SIZE) {
            config.default_queue_size = parse_env(ENV_QUEUE_SIZE, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets the address namespace root.
    #[must_use]
    pub fn with_ipc_root(mut self, root: impl Into<String>) -> Self {
        self.ipc_root = root.into();
        self
    }

    /// Sets the liveness poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the default frontend queue capacity.
    #[must_use]
    pub fn with_default_queue_size(mut self, size: usize) -> Self {
        self.default_queue_size = size;
        self
    }

    /// The liveness poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipc_root.trim().is_empty() {
            return Err(ConfigError::invalid("ipc_root", "must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be positive"));
        }
        if self.default_queue_size == 0 {
            return Err(ConfigError::invalid("default_queue_size", "must be at least 1"));
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
