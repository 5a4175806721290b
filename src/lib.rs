//! skyscan: distributed pixel-scan dispatch.
//!
//! An event is split into independent per-pixel reconstruction jobs that
//! workers consume from a queue. Each pixel is reconstructed several times
//! from different starting positions; the consolidator waits for every
//! variant and keeps the best fit. The fleet module provisions and tears
//! down the machines that run it all.

// Core modules
pub mod cli;
pub mod error;
pub mod fleet;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod queue;

// Re-export commonly used error types
pub use error::{
    DataError, FleetError, MonitoringError, ProvisionError, ReconstructError, SinkError,
};
pub use pipeline::ConfigError;
pub use queue::QueueError;
