//! Contract with the compute backend that hosts fleet nodes.
//!
//! A node is obtained by placing a request, waiting for the request to be
//! fulfilled with an instance, then waiting for the instance to report an
//! address. Pools are requested as a whole and sized by the backend.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeRole;
use crate::error::ProvisionError;

macro_rules! backend_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

backend_id!(
    /// Identifier of a pending provisioning request.
    RequestId
);
backend_id!(
    /// Identifier of a running (or once running) instance.
    InstanceId
);
backend_id!(
    /// Identifier of an elastic pool.
    PoolId
);

/// What to launch for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub role: NodeRole,
    pub image: String,
    pub cpus: f64,
    pub memory_mb: u64,
    /// Base64-encoded startup script.
    pub user_data: String,
    /// Whether the node needs a publicly reachable address.
    pub public: bool,
    pub labels: BTreeMap<String, String>,
}

/// What to launch for an elastic pool: `target_capacity` copies of `template`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub template: InstanceSpec,
    pub target_capacity: u32,
    /// The backend terminates pool members after this time.
    pub valid_until: DateTime<Utc>,
}

/// Progress of a provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Not fulfilled yet; the backend may say why.
    Open { message: Option<String> },
    Fulfilled(InstanceId),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Terminated,
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Terminated => "terminated",
            InstanceState::Unknown => "unknown",
        }
    }

    /// True once the instance can no longer come (back) up.
    pub fn is_gone(&self) -> bool {
        matches!(self, InstanceState::Stopping | InstanceState::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub id: InstanceId,
    pub state: InstanceState,
    /// Address other nodes use to reach this one, once assigned.
    pub address: Option<String>,
    /// Externally resolvable name, if the backend assigns one.
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolState {
    Active,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDescription {
    pub id: PoolId,
    pub target_capacity: u32,
    /// Members currently running.
    pub running: u32,
    pub state: PoolState,
    pub addresses: Vec<String>,
}

impl PoolDescription {
    pub fn is_at_capacity(&self) -> bool {
        self.running >= self.target_capacity
    }
}

/// Compute backend used by the fleet manager.
///
/// Lookups of unknown ids return the matching `*NotFound` error so callers
/// can tell "gone" from "backend unreachable".
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    async fn request_instance(&self, spec: &InstanceSpec) -> Result<RequestId, ProvisionError>;

    async fn describe_request(&self, id: &RequestId) -> Result<RequestStatus, ProvisionError>;

    async fn describe_instance(&self, id: &InstanceId)
        -> Result<InstanceDescription, ProvisionError>;

    async fn terminate_instance(&self, id: &InstanceId) -> Result<(), ProvisionError>;

    async fn cancel_request(&self, id: &RequestId) -> Result<(), ProvisionError>;

    async fn request_pool(&self, spec: &PoolSpec) -> Result<PoolId, ProvisionError>;

    async fn describe_pool(&self, id: &PoolId) -> Result<PoolDescription, ProvisionError>;

    /// Cancels the pool request, terminating its members if `terminate_instances`.
    async fn cancel_pool(&self, id: &PoolId, terminate_instances: bool)
        -> Result<(), ProvisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(InstanceId::new("i-123").to_string(), "i-123");
        assert_eq!(RequestId::new("sir-9").as_str(), "sir-9");
    }

    #[test]
    fn test_instance_state() {
        assert!(InstanceState::Terminated.is_gone());
        assert!(InstanceState::Stopping.is_gone());
        assert!(!InstanceState::Pending.is_gone());
        assert_eq!(InstanceState::Running.to_string(), "running");
    }

    #[test]
    fn test_pool_capacity() {
        let pool = PoolDescription {
            id: PoolId::new("sfr-1"),
            target_capacity: 5,
            running: 4,
            state: PoolState::Active,
            addresses: Vec::new(),
        };
        assert!(!pool.is_at_capacity());
        assert!(PoolDescription { running: 5, ..pool }.is_at_capacity());
    }
}
