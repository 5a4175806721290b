//! Error types for skyscan operations.
//!
//! Defines the error taxonomy shared across subsystems:
//! - Message decoding (data errors, never retried)
//! - Reconstruction (failed fits vs. crashed invocations)
//! - Result sinks
//! - Instance provisioning and monitoring registration
//! - Fleet runs
//!
//! Queue transport errors live next to the transport in `queue::transport`.

use thiserror::Error;

use crate::fleet::NodeRole;

/// Malformed or wrong-typed message bodies.
///
/// The consume loop rejects a body with a data error without requeue, so it
/// lands on the dead-letter list and is never retried.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Malformed message body: {0}")]
    Malformed(String),

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Unsupported envelope version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Variant index {variant} out of range for {expected} expected variants")]
    VariantOutOfRange { variant: u32, expected: u32 },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the external reconstruction collaborator.
#[derive(Debug, Error)]
pub enum ReconstructError {
    /// The fit ran but did not converge. The worker still publishes a result
    /// carrying an undefined score.
    #[error("Fit failed: {0}")]
    FitFailed(String),

    /// The reconstruction could not run at all. The job is requeued.
    #[error("Reconstruction crashed: {0}")]
    Crashed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while handing a selected result to durable storage.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to write result for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the provisioning backend or while waiting on it.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Provisioning request failed: {0}")]
    RequestFailed(String),

    #[error("Request '{0}' not found")]
    RequestNotFound(String),

    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Pool '{0}' not found")]
    PoolNotFound(String),

    #[error("{name} never became {waiting_for} within {seconds} seconds")]
    Timeout {
        name: String,
        waiting_for: String,
        seconds: u64,
    },

    #[error("{name} entered state '{state}' while starting")]
    StartupFailed { name: String, state: String },

    #[error("Provisioning of {0} was cancelled")]
    Cancelled(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("User data rendering failed: {0}")]
    UserData(#[from] tera::Error),
}

/// Errors raised by the monitoring registration endpoint.
#[derive(Debug, Error)]
pub enum MonitoringError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Monitoring endpoint returned {status} for service '{service}'")]
    Rejected { service: String, status: u16 },
}

/// Fatal errors of a fleet run.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Provisioning {role} failed: {source}")]
    Provision {
        role: NodeRole,
        #[source]
        source: ProvisionError,
    },

    #[error("Monitoring registration for {role} failed: {source}")]
    Monitoring {
        role: NodeRole,
        #[source]
        source: MonitoringError,
    },

    #[error("{0} instance terminated unexpectedly")]
    InstanceLost(NodeRole),

    #[error("Watcher task failed: {0}")]
    Watcher(String),

    #[error("Teardown left {} release step(s) failing: {}", .0.len(), .0.join("; "))]
    Teardown(Vec<String>),
}
