//! Elastic fleet lifecycle.
//!
//! Stands up the nodes of one run (monitoring, broker, producer, consumer and
//! a worker pool) through a [`ProvisioningApi`], registers each with a
//! [`MonitoringRegistry`], watches the ones that matter and tears everything
//! down in reverse order however the run ends.

pub mod config;
pub mod docker;
pub mod instance;
pub mod manager;
pub mod monitoring;
pub mod provider;
pub mod release;
pub mod user_data;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use config::{FleetConfig, NodeTemplate, ProvisionTiming};
pub use docker::DockerProvisioner;
pub use instance::{watch_instance, ManagedInstance, ManagedPool, NodeState, WatchOutcome};
pub use manager::{FleetManager, FleetOutcome};
pub use monitoring::{load_token, scrape_target, HttpMonitoringRegistry, MonitoringRegistry};
pub use provider::{
    InstanceDescription, InstanceId, InstanceSpec, InstanceState, PoolDescription, PoolId,
    PoolSpec, PoolState, ProvisioningApi, RequestId, RequestStatus,
};
pub use release::{MonitoringRegistration, Releasable, ReleaseError, ReleaseStack};
pub use user_data::{encode_user_data, UserDataContext, UserDataRenderer};

/// The kinds of node a fleet run provisions, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Monitoring,
    Broker,
    Producer,
    Consumer,
    WorkerPool,
}

impl NodeRole {
    pub const ALL: [NodeRole; 5] = [
        NodeRole::Monitoring,
        NodeRole::Broker,
        NodeRole::Producer,
        NodeRole::Consumer,
        NodeRole::WorkerPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Monitoring => "monitoring",
            NodeRole::Broker => "broker",
            NodeRole::Producer => "producer",
            NodeRole::Consumer => "consumer",
            NodeRole::WorkerPool => "worker-pool",
        }
    }

    /// How the manager reacts when a node of this role stops running.
    pub fn watch_policy(&self) -> WatchPolicy {
        match self {
            NodeRole::Monitoring | NodeRole::Broker => WatchPolicy::Critical,
            NodeRole::Consumer => WatchPolicy::CompletesRun,
            NodeRole::Producer | NodeRole::WorkerPool => WatchPolicy::Unwatched,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness policy of a node during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPolicy {
    /// Losing the node is a fatal run error.
    Critical,
    /// The node exiting means the run's work is done.
    CompletesRun,
    /// The node is expected to exit on its own and is not polled.
    Unwatched,
}
