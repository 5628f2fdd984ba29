//! Rebalancer configuration
//!
//! Configuration loaded from defaults, environment variables or a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How migration work is cut into tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceStrategy {
    /// One task per partition move, dispatched by the node-exclusive scheduler
    StealerBased,
    /// One task per donor, carrying all of that donor's moves
    DonorBased,
}

impl std::str::FromStr for RebalanceStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stealer-based" | "stealer" => Ok(Self::StealerBased),
            "donor-based" | "donor" => Ok(Self::DonorBased),
            other => Err(ConfigError::InvalidValue(
                "strategy".to_string(),
                other.to_string(),
            )),
        }
    }
}

/// Rebalancer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Ceiling on in-flight tasks; `None` lets node exclusivity be the only limit
    pub max_parallel: Option<usize>,

    /// Attempts per partition move before a task gives up
    pub max_tries: u32,

    /// Task construction strategy
    pub strategy: RebalanceStrategy,

    /// Pause between the topology commit and read-write data movement, in seconds
    pub proxy_pause_secs: u64,

    /// Delay between attempts of the same move, in milliseconds
    pub retry_delay_ms: u64,

    /// Maximum tasks the worker pool accepts at once; `None` for unbounded
    pub worker_capacity: Option<usize>,

    /// On-disk format version every read-only store must be at
    pub read_only_format: u32,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            max_tries: 2,
            strategy: RebalanceStrategy::StealerBased,
            proxy_pause_secs: 5 * 60,
            retry_delay_ms: 1000,
            worker_capacity: None,
            read_only_format: 2,
        }
    }
}

impl RebalanceConfig {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_parallel = optional_env("PARTKV_REBALANCE_MAX_PARALLEL")?;
        let max_tries = optional_env("PARTKV_REBALANCE_MAX_TRIES")?.unwrap_or(defaults.max_tries);
        let strategy =
            optional_env("PARTKV_REBALANCE_STRATEGY")?.unwrap_or(defaults.strategy);
        let proxy_pause_secs = optional_env("PARTKV_REBALANCE_PROXY_PAUSE_SECS")?
            .unwrap_or(defaults.proxy_pause_secs);
        let retry_delay_ms = optional_env("PARTKV_REBALANCE_RETRY_DELAY_MS")?
            .unwrap_or(defaults.retry_delay_ms);
        let worker_capacity = optional_env("PARTKV_REBALANCE_WORKER_CAPACITY")?;
        let read_only_format = optional_env("PARTKV_REBALANCE_READ_ONLY_FORMAT")?
            .unwrap_or(defaults.read_only_format);

        let config = Self {
            max_parallel,
            max_tries,
            strategy,
            proxy_pause_secs,
            retry_delay_ms,
            worker_capacity,
            read_only_format,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RebalanceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == Some(0) {
            return Err(ConfigError::InvalidValue(
                "max_parallel".to_string(),
                "0".to_string(),
            ));
        }
        if self.max_tries == 0 {
            return Err(ConfigError::InvalidValue(
                "max_tries".to_string(),
                "0".to_string(),
            ));
        }
        if self.worker_capacity == Some(0) {
            return Err(ConfigError::InvalidValue(
                "worker_capacity".to_string(),
                "0".to_string(),
            ));
        }
        if self.read_only_format == 0 {
            return Err(ConfigError::InvalidValue(
                "read_only_format".to_string(),
                "0".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective in-flight ceiling
    pub fn parallelism(&self) -> usize {
        self.max_parallel.unwrap_or(usize::MAX)
    }

    /// Get proxy pause as Duration
    pub fn proxy_pause(&self) -> Duration {
        Duration::from_secs(self.proxy_pause_secs)
    }

    /// Get retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn optional_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), value)),
        Err(_) => Ok(None),
    }
}
