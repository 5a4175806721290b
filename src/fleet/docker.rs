//! Docker-backed provisioning.
//!
//! Every node is a container started from the role's image. The startup
//! script travels base64-encoded in `SKYSCAN_USER_DATA` and is decoded and
//! run by a small bootstrap entrypoint, the way a cloud image runs user data
//! on first boot. Pools are sets of containers sharing a `skyscan.pool`
//! label.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::Docker;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::provider::{
    InstanceDescription, InstanceId, InstanceSpec, InstanceState, PoolDescription, PoolId,
    PoolSpec, PoolState, ProvisioningApi, RequestId, RequestStatus,
};
use crate::error::ProvisionError;

const BOOTSTRAP: &str =
    r#"printf %s "$SKYSCAN_USER_DATA" | base64 -d > /tmp/user-data && exec sh /tmp/user-data"#;

const POOL_LABEL: &str = "skyscan.pool";

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_state(status: &str) -> InstanceState {
    match status {
        "created" | "restarting" => InstanceState::Pending,
        "running" => InstanceState::Running,
        "removing" => InstanceState::Stopping,
        "exited" | "dead" => InstanceState::Terminated,
        _ => InstanceState::Unknown,
    }
}

/// First usable address among a container's network endpoints.
fn endpoint_address<'a, I>(endpoints: I) -> Option<String>
where
    I: IntoIterator<Item = &'a EndpointSettings>,
{
    let endpoints: Vec<_> = endpoints.into_iter().collect();
    endpoints
        .iter()
        .filter_map(|e| e.ip_address.as_deref())
        .chain(endpoints.iter().filter_map(|e| e.global_ipv6_address.as_deref()))
        .find(|a| !a.is_empty())
        .map(str::to_string)
}

fn container_config(
    spec: &InstanceSpec,
    network: Option<&str>,
    extra_labels: &[(&str, String)],
) -> Config<String> {
    let mut labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
    for (key, value) in extra_labels {
        labels.insert((*key).to_string(), value.clone());
    }

    let host_config = HostConfig {
        memory: Some((spec.memory_mb * 1024 * 1024) as i64),
        nano_cpus: Some((spec.cpus * 1e9) as i64),
        network_mode: network.map(str::to_string),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        entrypoint: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            BOOTSTRAP.to_string(),
        ]),
        env: Some(vec![format!("SKYSCAN_USER_DATA={}", spec.user_data)]),
        hostname: Some(spec.name.clone()),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Provisions fleet nodes as containers on one Docker daemon.
pub struct DockerProvisioner {
    docker: Docker,
    network: Option<String>,
    pools: Mutex<HashMap<PoolId, u32>>,
}

impl DockerProvisioner {
    /// Connects to the local Docker daemon.
    pub fn connect() -> Result<Self, ProvisionError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProvisionError::Backend(format!("Failed to connect: {e}")))?;
        Ok(Self::from_docker(docker))
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker,
            network: None,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches every container to `network` so nodes can reach each other.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    async fn launch(
        &self,
        name: &str,
        spec: &InstanceSpec,
        extra_labels: &[(&str, String)],
    ) -> Result<String, ProvisionError> {
        let config = container_config(spec, self.network.as_deref(), extra_labels);
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ProvisionError::RequestFailed(format!("Failed to create {name}: {e}")))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&response.id).await.ok();
            return Err(ProvisionError::RequestFailed(format!(
                "Failed to start {name}: {e}"
            )));
        }

        debug!(name = name, container = %response.id, image = %spec.image, "Container started");
        Ok(response.id)
    }

    async fn remove(&self, id: &str) -> Result<(), BollardError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await
    }

    async fn pool_members(&self, id: &PoolId) -> Result<Vec<bollard::models::ContainerSummary>, ProvisionError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{POOL_LABEL}={id}")],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        self.docker
            .list_containers(Some(options))
            .await
            .map_err(|e| ProvisionError::Backend(format!("Failed to list pool {id}: {e}")))
    }

    async fn remove_members(&self, id: &PoolId) -> Result<usize, ProvisionError> {
        let containers: Vec<String> = self
            .pool_members(id)
            .await?
            .into_iter()
            .filter_map(|member| member.id)
            .collect();

        let results = join_all(containers.iter().map(|c| self.remove(c))).await;

        let mut first_error = None;
        let mut removed = 0;
        for (container, result) in containers.iter().zip(results) {
            match result {
                Ok(()) => removed += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    warn!(pool = %id, container = %container, error = %e, "Failed to remove pool member");
                    first_error.get_or_insert(ProvisionError::Backend(e.to_string()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    fn known_pool(&self, id: &PoolId) -> Result<u32, ProvisionError> {
        let pools = self
            .pools
            .lock()
            .map_err(|_| ProvisionError::Backend("pool registry poisoned".to_string()))?;
        pools
            .get(id)
            .copied()
            .ok_or_else(|| ProvisionError::PoolNotFound(id.to_string()))
    }
}

#[async_trait]
impl ProvisioningApi for DockerProvisioner {
    async fn request_instance(&self, spec: &InstanceSpec) -> Result<RequestId, ProvisionError> {
        let id = self.launch(&spec.name, spec, &[]).await?;
        Ok(RequestId::new(id))
    }

    /// Containers start as part of the request, so an existing request is
    /// always fulfilled by the container of the same id.
    async fn describe_request(&self, id: &RequestId) -> Result<RequestStatus, ProvisionError> {
        match self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(RequestStatus::Fulfilled(InstanceId::new(id.as_str()))),
            Err(e) if is_not_found(&e) => Err(ProvisionError::RequestNotFound(id.to_string())),
            Err(e) => Err(ProvisionError::Backend(e.to_string())),
        }
    }

    async fn describe_instance(
        &self,
        id: &InstanceId,
    ) -> Result<InstanceDescription, ProvisionError> {
        let info = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ProvisionError::InstanceNotFound(id.to_string())
                } else {
                    ProvisionError::Backend(format!("Failed to inspect {id}: {e}"))
                }
            })?;

        let state = info
            .state
            .and_then(|s| s.status)
            .map(|s| map_state(&s.to_string()))
            .unwrap_or(InstanceState::Unknown);

        let address = info.network_settings.and_then(|ns| {
            let top_level = [ns.ip_address, ns.global_ipv6_address]
                .into_iter()
                .flatten()
                .find(|a| !a.is_empty());
            top_level.or_else(|| ns.networks.as_ref().and_then(|n| endpoint_address(n.values())))
        });

        Ok(InstanceDescription {
            id: id.clone(),
            state,
            address,
            hostname: info.config.and_then(|c| c.hostname),
        })
    }

    async fn terminate_instance(&self, id: &InstanceId) -> Result<(), ProvisionError> {
        match self.remove(id.as_str()).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(ProvisionError::InstanceNotFound(id.to_string())),
            Err(e) => Err(ProvisionError::Backend(format!("Failed to remove {id}: {e}"))),
        }
    }

    async fn cancel_request(&self, id: &RequestId) -> Result<(), ProvisionError> {
        debug!(request = %id, "Container requests complete on creation, nothing to cancel");
        Ok(())
    }

    async fn request_pool(&self, spec: &PoolSpec) -> Result<PoolId, ProvisionError> {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = PoolId::new(format!("{}-{}", spec.name, &short[..8]));
        let labels = [
            (POOL_LABEL, id.to_string()),
            ("skyscan.valid-until", spec.valid_until.to_rfc3339()),
        ];

        self.pools
            .lock()
            .map_err(|_| ProvisionError::Backend("pool registry poisoned".to_string()))?
            .insert(id.clone(), spec.target_capacity);

        for index in 0..spec.target_capacity {
            let name = format!("{}-{}", id, index);
            if let Err(e) = self.launch(&name, &spec.template, &labels).await {
                warn!(pool = %id, member = index, error = %e, "Pool member failed to launch");
                if let Ok(mut pools) = self.pools.lock() {
                    pools.remove(&id);
                }
                self.remove_members(&id).await.ok();
                return Err(e);
            }
        }

        info!(pool = %id, members = spec.target_capacity, "Pool launched");
        Ok(id)
    }

    async fn describe_pool(&self, id: &PoolId) -> Result<PoolDescription, ProvisionError> {
        let target_capacity = self.known_pool(id)?;
        let members = self.pool_members(id).await?;

        let mut running = 0;
        let mut addresses = Vec::new();
        let mut failed = None;
        for member in &members {
            match member.state.as_deref().map(map_state) {
                Some(InstanceState::Running) => {
                    running += 1;
                    let address = member
                        .network_settings
                        .as_ref()
                        .and_then(|ns| ns.networks.as_ref())
                        .and_then(|n| endpoint_address(n.values()));
                    addresses.extend(address);
                }
                Some(InstanceState::Terminated) => {
                    let name = member
                        .names
                        .as_ref()
                        .and_then(|n| n.first().cloned())
                        .or_else(|| member.id.clone())
                        .unwrap_or_default();
                    failed.get_or_insert(format!("member {} exited", name.trim_start_matches('/')));
                }
                _ => {}
            }
        }

        Ok(PoolDescription {
            id: id.clone(),
            target_capacity,
            running,
            state: failed.map_or(PoolState::Active, PoolState::Failed),
            addresses,
        })
    }

    async fn cancel_pool(&self, id: &PoolId, terminate_instances: bool) -> Result<(), ProvisionError> {
        self.known_pool(id)?;
        if let Ok(mut pools) = self.pools.lock() {
            pools.remove(id);
        }

        if terminate_instances {
            let removed = self.remove_members(id).await?;
            info!(pool = %id, removed = removed, "Pool members removed");
        }
        Ok(())
    }
}
