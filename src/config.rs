// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for a `DownloadManager`. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Size of the worker pool. Fixed for the manager's lifetime.
    pub max_concurrent_downloads: usize,
    /// Pause between two progress steps of a worker, in milliseconds.
    pub tick_interval_ms: u64,
    /// Upper bound of a simulated progress step, in percent.
    pub max_increment: u8,
    /// Probability that a simulated step fails.
    pub failure_rate: f64,
    /// Seed for reproducible simulated transfers.
    pub seed: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            tick_interval_ms: 500,
            max_increment: 40,
            failure_rate: 0.0,
            seed: None,
        }
    }
}

impl ManagerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.max_increment) {
            return Err(ConfigError::Invalid(format!(
                "max_increment must be within 1..=100, got {}",
                self.max_increment
            )));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::Invalid(format!(
                "failure_rate must be within 0.0..=1.0, got {}",
                self.failure_rate
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
