//! Configuration for the queue-facing pipeline processes.
//!
//! `QueueConfig` carries the broker connection and consumer timing shared by
//! every process that blocks on a queue; `WorkerConfig` and
//! `ConsolidatorConfig` add the per-role settings. All three follow the same
//! builder pattern: `Default`, `with_*` setters and `validate()`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::queue::{DEFAULT_POLL_INTERVAL, DEFAULT_RECEIVE_WAIT};

/// Default number of position variants per pixel.
pub const DEFAULT_VARIANTS: u32 = 7;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML configuration file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Broker connection and consumer timing.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Broker host or URL.
    pub address: String,
    /// Idle time after which a consumer stops.
    pub idle_timeout: Duration,
    /// How often the idle supervisor samples activity.
    pub poll_interval: Duration,
    /// How long one receive blocks before re-checking for a stop.
    pub receive_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            idle_timeout: Duration::from_secs(30),
            poll_interval: DEFAULT_POLL_INTERVAL,
            receive_wait: DEFAULT_RECEIVE_WAIT,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "address cannot be empty".to_string(),
            ));
        }

        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "idle_timeout must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.receive_wait.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "receive_wait must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }
}

/// Settings for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue jobs are consumed from.
    pub in_queue: String,
    /// Queue results are published to.
    pub out_queue: String,
    /// Artificial delay after each reconstruction.
    pub sleep: Duration,
    pub queue: QueueConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            in_queue: "inqueue".to_string(),
            out_queue: "outqueue".to_string(),
            sleep: Duration::ZERO,
            queue: QueueConfig::default().with_idle_timeout(Duration::from_secs(10)),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;

        if self.in_queue.is_empty() || self.out_queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "in_queue and out_queue cannot be empty".to_string(),
            ));
        }

        if self.in_queue == self.out_queue {
            return Err(ConfigError::ValidationFailed(
                "in_queue and out_queue must differ".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_in_queue(mut self, queue: impl Into<String>) -> Self {
        self.in_queue = queue.into();
        self
    }

    pub fn with_out_queue(mut self, queue: impl Into<String>) -> Self {
        self.out_queue = queue.into();
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Settings for the consolidator process.
#[derive(Debug, Clone)]
pub struct ConsolidatorConfig {
    /// Queue results are consumed from.
    pub queue_name: String,
    /// Distinct variants required before a pixel is complete.
    pub variants: u32,
    /// Root directory of the result sink.
    pub output_dir: PathBuf,
    pub queue: QueueConfig,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            queue_name: "outqueue".to_string(),
            variants: DEFAULT_VARIANTS,
            output_dir: PathBuf::from("./results"),
            queue: QueueConfig::default(),
        }
    }
}

impl ConsolidatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.variants == 0 {
            return Err(ConfigError::ValidationFailed(
                "variants must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_queue_name(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = queue.into();
        self
    }

    pub fn with_variants(mut self, variants: u32) -> Self {
        self.variants = variants;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_queue_config() {
        let config = QueueConfig::default();
        assert_eq!(config.address, "localhost");
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::new()
            .with_address("10.0.0.5")
            .with_idle_timeout(Duration::from_secs(600))
            .with_poll_interval(Duration::from_millis(250))
            .with_receive_wait(Duration::from_secs(2));

        assert_eq!(config.address, "10.0.0.5");
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.receive_wait, Duration::from_secs(2));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let config = QueueConfig::default().with_idle_timeout(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("idle_timeout"));
    }

    #[test]
    fn test_validation_empty_address() {
        let config = QueueConfig::default().with_address("  ");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("address"));
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.sleep, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_rejects_same_queue() {
        let config = WorkerConfig::new()
            .with_in_queue("jobs")
            .with_out_queue("jobs");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_consolidator_builder_and_validation() {
        let config = ConsolidatorConfig::new()
            .with_queue_name("results")
            .with_variants(3)
            .with_output_dir("/tmp/out");
        assert_eq!(config.variants, 3);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert!(config.validate().is_ok());

        let err = config.with_variants(0).validate().unwrap_err();
        assert!(err.to_string().contains("variants"));
    }
}
