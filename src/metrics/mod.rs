//! Prometheus-based metrics.
//!
//! Counters and gauges for queue traffic, reconstructions, emitted pixels and
//! fleet node readiness. Processes without an HTTP surface dump the registry
//! to a textfile with `write_metrics_file`.
//!
//! # Example
//!
//! ```ignore
//! use skyscan::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_published("inqueue", 12);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};

pub use prometheus::{
    DELIVERIES_TOTAL, FLEET_NODES_READY, PIXELS_EMITTED_TOTAL, PUBLISHED_TOTAL, QUEUE_DEPTH,
    REGISTRY, RECONSTRUCTION_DURATION,
};
