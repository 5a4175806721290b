//! Fleet configuration.
//!
//! A fleet run is described by a YAML file. Every field has a default so an
//! empty file is a valid (if small) fleet; CLI flags override the few values
//! that change from run to run.
//!
//! ```yaml
//! lease_hours: 2
//! num_workers: 40
//! monitoring:
//!   url: https://monitoring.example.org/reconfig
//!   token_file: /etc/skyscan/monitoring.token
//! nodes:
//!   worker:
//!     image: registry.example.org/skyscan-worker:latest
//!     cpus: 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::NodeRole;
use crate::pipeline::{ConfigError, DEFAULT_VARIANTS};

/// Longest accepted lease, one year.
pub const MAX_LEASE_HOURS: f64 = 8760.0;

/// Polling cadence and limits used while bringing nodes up and watching them.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionTiming {
    /// Interval between request status checks.
    pub request_poll: Duration,
    /// Interval between checks for an instance address or pool size.
    pub address_poll: Duration,
    /// Interval between liveness checks of a watched node.
    pub monitor_poll: Duration,
    /// Upper bound on the whole acquisition of one node.
    pub startup_timeout: Duration,
}

impl Default for ProvisionTiming {
    fn default() -> Self {
        Self {
            request_poll: Duration::from_secs(10),
            address_poll: Duration::from_secs(5),
            monitor_poll: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl ProvisionTiming {
    pub fn with_request_poll(mut self, interval: Duration) -> Self {
        self.request_poll = interval;
        self
    }

    pub fn with_address_poll(mut self, interval: Duration) -> Self {
        self.address_poll = interval;
        self
    }

    pub fn with_monitor_poll(mut self, interval: Duration) -> Self {
        self.monitor_poll = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

/// Launch template for the nodes of one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTemplate {
    pub image: String,
    pub cpus: f64,
    pub memory_mb: u64,
    pub public: bool,
    /// Port the monitoring node scrapes on this node.
    pub metrics_port: u16,
    /// Replaces the built-in startup script template for this role.
    pub user_data: Option<String>,
}

impl Default for NodeTemplate {
    fn default() -> Self {
        Self {
            image: "skyscan:latest".to_string(),
            cpus: 2.0,
            memory_mb: 4096,
            public: false,
            metrics_port: 9100,
            user_data: None,
        }
    }
}

impl NodeTemplate {
    fn validate(&self, role: NodeRole) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(format!(
                "nodes.{role}.image cannot be empty"
            )));
        }
        if !(self.cpus.is_finite() && self.cpus > 0.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "nodes.{role}.cpus must be greater than 0"
            )));
        }
        if self.memory_mb == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "nodes.{role}.memory_mb must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Templates for every role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTemplates {
    pub monitoring: NodeTemplate,
    pub broker: NodeTemplate,
    pub producer: NodeTemplate,
    pub consumer: NodeTemplate,
    pub worker: NodeTemplate,
}

impl Default for NodeTemplates {
    fn default() -> Self {
        Self {
            monitoring: NodeTemplate {
                image: "prom/prometheus:latest".to_string(),
                memory_mb: 8192,
                public: true,
                metrics_port: 9090,
                ..NodeTemplate::default()
            },
            broker: NodeTemplate {
                image: "redis:7".to_string(),
                cpus: 4.0,
                metrics_port: 9121,
                ..NodeTemplate::default()
            },
            producer: NodeTemplate {
                public: true,
                ..NodeTemplate::default()
            },
            consumer: NodeTemplate::default(),
            worker: NodeTemplate {
                cpus: 4.0,
                memory_mb: 8192,
                ..NodeTemplate::default()
            },
        }
    }
}

impl NodeTemplates {
    pub fn for_role(&self, role: NodeRole) -> &NodeTemplate {
        match role {
            NodeRole::Monitoring => &self.monitoring,
            NodeRole::Broker => &self.broker,
            NodeRole::Producer => &self.producer,
            NodeRole::Consumer => &self.consumer,
            NodeRole::WorkerPool => &self.worker,
        }
    }
}

/// Where nodes are registered for scraping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    /// Base URL of the target registration service.
    pub url: String,
    /// File holding the bearer token.
    pub token_file: Option<PathBuf>,
    /// Service names are `<prefix>-<role>`.
    pub service_prefix: String,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            token_file: None,
            service_prefix: "skyscan".to_string(),
        }
    }
}

/// Settings passed to the pipeline processes through their startup scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub in_queue: String,
    pub out_queue: String,
    pub variants: u32,
    pub nside: u32,
    /// Idle timeout of the worker processes.
    pub worker_timeout_secs: u64,
    /// Idle timeout of the consolidator.
    pub consumer_timeout_secs: u64,
    /// Artificial per-job delay on workers.
    pub worker_sleep_secs: u64,
    /// Event file the producer node publishes.
    pub event_url: Option<String>,
    /// Reconstruction program run by each worker.
    pub reconstruct_command: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            in_queue: "inqueue".to_string(),
            out_queue: "outqueue".to_string(),
            variants: DEFAULT_VARIANTS,
            nside: 8,
            worker_timeout_secs: 360,
            consumer_timeout_secs: 180,
            worker_sleep_secs: 0,
            event_url: None,
            reconstruct_command: "skyscan-fit".to_string(),
        }
    }
}

/// Serialized form of [`ProvisionTiming`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub request_poll_secs: u64,
    pub address_poll_secs: u64,
    pub monitor_poll_secs: u64,
    pub startup_timeout_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        let timing = ProvisionTiming::default();
        Self {
            request_poll_secs: timing.request_poll.as_secs(),
            address_poll_secs: timing.address_poll.as_secs(),
            monitor_poll_secs: timing.monitor_poll.as_secs(),
            startup_timeout_secs: timing.startup_timeout.as_secs(),
        }
    }
}

/// Complete description of one fleet run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Hard deadline of the run, in hours.
    pub lease_hours: f64,
    /// Target size of the worker pool.
    pub num_workers: u32,
    pub pipeline: PipelineSection,
    pub monitoring: MonitoringSection,
    pub timing: TimingSection,
    pub nodes: NodeTemplates,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            lease_hours: 0.5,
            num_workers: 1,
            pipeline: PipelineSection::default(),
            monitoring: MonitoringSection::default(),
            timing: TimingSection::default(),
            nodes: NodeTemplates::default(),
        }
    }
}

impl FleetConfig {
    /// Loads and validates a fleet file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty map
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_num_workers(mut self, num: u32) -> Self {
        self.num_workers = num;
        self
    }

    pub fn with_lease_hours(mut self, hours: f64) -> Self {
        self.lease_hours = hours;
        self
    }

    pub fn with_monitoring_url(mut self, url: impl Into<String>) -> Self {
        self.monitoring.url = url.into();
        self
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs_f64(self.lease_hours * 3600.0)
    }

    pub fn timing(&self) -> ProvisionTiming {
        ProvisionTiming {
            request_poll: Duration::from_secs(self.timing.request_poll_secs),
            address_poll: Duration::from_secs(self.timing.address_poll_secs),
            monitor_poll: Duration::from_secs(self.timing.monitor_poll_secs),
            startup_timeout: Duration::from_secs(self.timing.startup_timeout_secs),
        }
    }

    /// Monitoring service name for nodes of `role`.
    pub fn service_name(&self, role: NodeRole) -> String {
        format!("{}-{}", self.monitoring.service_prefix, role)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.lease_hours.is_finite() && self.lease_hours > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "lease_hours must be greater than 0".to_string(),
            ));
        }
        if self.lease_hours > MAX_LEASE_HOURS {
            return Err(ConfigError::ValidationFailed(format!(
                "lease_hours must be at most {MAX_LEASE_HOURS}"
            )));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        let pipeline = &self.pipeline;
        if pipeline.in_queue.is_empty() || pipeline.out_queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue names cannot be empty".to_string(),
            ));
        }
        if pipeline.in_queue == pipeline.out_queue {
            return Err(ConfigError::ValidationFailed(
                "in_queue and out_queue must differ".to_string(),
            ));
        }
        if pipeline.reconstruct_command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "reconstruct_command cannot be empty".to_string(),
            ));
        }
        if pipeline.variants == 0 {
            return Err(ConfigError::ValidationFailed(
                "variants must be greater than 0".to_string(),
            ));
        }
        if pipeline.worker_timeout_secs == 0 || pipeline.consumer_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "idle timeouts must be greater than 0".to_string(),
            ));
        }

        if self.monitoring.url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "monitoring.url cannot be empty".to_string(),
            ));
        }

        let timing = &self.timing;
        if timing.request_poll_secs == 0
            || timing.address_poll_secs == 0
            || timing.monitor_poll_secs == 0
        {
            return Err(ConfigError::ValidationFailed(
                "poll intervals must be greater than 0".to_string(),
            ));
        }
        if timing.startup_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "startup_timeout_secs must be greater than 0".to_string(),
            ));
        }

        for role in NodeRole::ALL {
            self.nodes.for_role(role).validate(role)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FleetConfig::from_yaml("").expect("parse");
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.lease(), Duration::from_secs(1800));
        assert_eq!(config.timing(), ProvisionTiming::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let yaml = r#"
lease_hours: 2
num_workers: 40
monitoring:
  service_prefix: scan42
nodes:
  worker:
    image: example/worker:1.2
    cpus: 8
timing:
  monitor_poll_secs: 30
"#;
        let config = FleetConfig::from_yaml(yaml).expect("parse");
        assert_eq!(config.num_workers, 40);
        assert_eq!(config.lease(), Duration::from_secs(7200));
        assert_eq!(config.nodes.worker.image, "example/worker:1.2");
        assert_eq!(config.nodes.worker.cpus, 8.0);
        assert_eq!(config.nodes.worker.memory_mb, 4096);
        assert_eq!(config.nodes.broker.image, "redis:7");
        assert_eq!(config.timing().monitor_poll, Duration::from_secs(30));
        assert_eq!(config.timing().request_poll, Duration::from_secs(10));
        assert_eq!(config.service_name(NodeRole::Broker), "scan42-broker");
    }

    #[test]
    fn test_validation_errors() {
        assert!(FleetConfig::default().with_num_workers(0).validate().is_err());
        assert!(FleetConfig::default().with_lease_hours(0.0).validate().is_err());
        assert!(FleetConfig::default().with_lease_hours(1e9).validate().is_err());
        assert!(FleetConfig::default()
            .with_lease_hours(f64::NAN)
            .validate()
            .is_err());
        assert!(FleetConfig::default().with_monitoring_url("").validate().is_err());

        let mut config = FleetConfig::default();
        config.pipeline.out_queue = config.pipeline.in_queue.clone();
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.nodes.consumer.image.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nodes.consumer.image"));
    }

    #[test]
    fn test_unknown_yaml_is_rejected_cleanly() {
        let err = FleetConfig::from_yaml("num_workers: many").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleet.yaml");
        std::fs::write(&path, "num_workers: 3\n").expect("write");

        let config = FleetConfig::load(&path).expect("load");
        assert_eq!(config.num_workers, 3);
        assert!(FleetConfig::load(&dir.path().join("missing.yaml")).is_err());
    }
}
