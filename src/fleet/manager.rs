//! Orchestration of a complete fleet run.
//!
//! # Run sequence
//!
//! 1. Monitoring node, registered under its own service
//! 2. Broker node, started with the monitoring address
//! 3. Producer and consumer nodes, started with both addresses
//! 4. Worker pool sized to `num_workers`
//! 5. Wait until a watched node exits, the lease runs out or the caller
//!    cancels
//! 6. Release everything in reverse order
//!
//! Monitoring and broker nodes are liveness-critical: losing one fails the
//! run. The consumer exits on its own once the result queue goes idle, which
//! completes the run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::{FleetConfig, ProvisionTiming};
use super::instance::{watch_instance, ManagedInstance, ManagedPool, WatchOutcome};
use super::monitoring::{scrape_target, MonitoringRegistry};
use super::provider::{InstanceSpec, PoolSpec, ProvisioningApi};
use super::release::{MonitoringRegistration, ReleaseStack};
use super::user_data::{UserDataContext, UserDataRenderer};
use super::{NodeRole, WatchPolicy};
use crate::error::{FleetError, ProvisionError};
use crate::metrics::MetricsCollector;

/// How a run that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetOutcome {
    /// The consumer finished and exited.
    Completed,
    /// The caller cancelled the run.
    Interrupted,
    /// The lease ran out.
    LeaseExpired,
}

impl fmt::Display for FleetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FleetOutcome::Completed => "completed",
            FleetOutcome::Interrupted => "interrupted",
            FleetOutcome::LeaseExpired => "lease expired",
        })
    }
}

type Watchers = JoinSet<(NodeRole, WatchOutcome)>;

/// Runs one fleet from provisioning to teardown.
pub struct FleetManager {
    config: FleetConfig,
    provider: Arc<dyn ProvisioningApi>,
    registry: Arc<dyn MonitoringRegistry>,
    renderer: UserDataRenderer,
    timing: ProvisionTiming,
    run_id: String,
    metrics: MetricsCollector,
}

impl FleetManager {
    pub fn new(
        config: FleetConfig,
        provider: Arc<dyn ProvisioningApi>,
        registry: Arc<dyn MonitoringRegistry>,
    ) -> Self {
        let renderer = UserDataRenderer::from_config(&config);
        let timing = config.timing();
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            config,
            provider,
            registry,
            renderer,
            timing,
            run_id,
            metrics: MetricsCollector::new(),
        }
    }

    /// Overrides the polling cadence taken from the configuration.
    pub fn with_timing(mut self, timing: ProvisionTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Provisions the fleet, waits for the run to end and tears it down.
    ///
    /// Everything acquired is released before this returns, whatever the
    /// outcome. Teardown failures on an otherwise clean run are reported as
    /// `FleetError::Teardown`; on a failed run they are logged and the run
    /// error is returned.
    pub async fn run(&self, token: &CancellationToken) -> Result<FleetOutcome, FleetError> {
        let run_token = token.child_token();
        let lease_expired = Arc::new(AtomicBool::new(false));
        let lease_timer = {
            let run_token = run_token.clone();
            let lease_expired = Arc::clone(&lease_expired);
            let lease = self.config.lease();
            tokio::spawn(async move {
                tokio::select! {
                    _ = run_token.cancelled() => {}
                    _ = tokio::time::sleep(lease) => {
                        info!(lease_secs = lease.as_secs(), "Fleet lease expired");
                        lease_expired.store(true, Ordering::SeqCst);
                        run_token.cancel();
                    }
                }
            })
        };

        info!(
            run = %self.run_id,
            workers = self.config.num_workers,
            lease_hours = self.config.lease_hours,
            "Starting fleet"
        );

        let mut stack = ReleaseStack::new();
        let mut watchers = Watchers::new();
        let provisioned = self.provision(&mut stack, &mut watchers, &run_token).await;
        if provisioned.is_ok() {
            info!(run = %self.run_id, resources = stack.len(), "Fleet is up");
            run_token.cancelled().await;
        }

        run_token.cancel();
        let _ = lease_timer.await;
        let (exited, watcher_error) = drain_watchers(&mut watchers).await;

        info!(run = %self.run_id, resources = stack.len(), "Tearing down fleet");
        let failures = stack.release_all().await;
        for role in NodeRole::ALL {
            self.metrics.update_node_ready(role.as_str(), false);
        }

        let result = match (provisioned, exited, watcher_error) {
            (Err(e), _, _) if !is_cancellation(&e) => Err(e),
            (_, Some(role), _) if role.watch_policy() == WatchPolicy::CompletesRun => {
                Ok(FleetOutcome::Completed)
            }
            (_, Some(role), _) => Err(FleetError::InstanceLost(role)),
            (_, None, Some(e)) => Err(e),
            _ if lease_expired.load(Ordering::SeqCst) => Ok(FleetOutcome::LeaseExpired),
            _ => Ok(FleetOutcome::Interrupted),
        };

        match result {
            Ok(outcome) if failures.is_empty() => {
                info!(run = %self.run_id, outcome = %outcome, "Fleet run finished");
                Ok(outcome)
            }
            Ok(_) => Err(FleetError::Teardown(failures)),
            Err(e) => {
                if !failures.is_empty() {
                    error!(run = %self.run_id, failures = ?failures, "Teardown incomplete");
                }
                error!(run = %self.run_id, error = %e, "Fleet run failed");
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        stack: &mut ReleaseStack,
        watchers: &mut Watchers,
        token: &CancellationToken,
    ) -> Result<(), FleetError> {
        let monitoring = self
            .start_node(NodeRole::Monitoring, self.context(NodeRole::Monitoring), stack, watchers, token)
            .await?;

        let broker_context = self
            .context(NodeRole::Broker)
            .with_monitoring_address(&monitoring);
        let broker = self
            .start_node(NodeRole::Broker, broker_context, stack, watchers, token)
            .await?;

        let pipeline_context = |role| {
            self.context(role)
                .with_monitoring_address(&monitoring)
                .with_broker(&broker)
        };
        self.start_node(NodeRole::Producer, pipeline_context(NodeRole::Producer), stack, watchers, token)
            .await?;
        self.start_node(NodeRole::Consumer, pipeline_context(NodeRole::Consumer), stack, watchers, token)
            .await?;
        self.start_pool(pipeline_context(NodeRole::WorkerPool), stack, token)
            .await?;

        Ok(())
    }

    fn context(&self, role: NodeRole) -> UserDataContext {
        UserDataContext::new(&self.config, role)
    }

    fn instance_spec(&self, role: NodeRole, context: &UserDataContext) -> Result<InstanceSpec, FleetError> {
        let template = self.config.nodes.for_role(role);
        let user_data = self
            .renderer
            .render_encoded(role, context)
            .map_err(|source| FleetError::Provision { role, source })?;

        let mut labels = BTreeMap::new();
        labels.insert("skyscan.role".to_string(), role.to_string());
        labels.insert("skyscan.run".to_string(), self.run_id.clone());

        Ok(InstanceSpec {
            name: format!("{}-{}", self.config.service_name(role), self.run_id),
            role,
            image: template.image.clone(),
            cpus: template.cpus,
            memory_mb: template.memory_mb,
            user_data,
            public: template.public,
            labels,
        })
    }

    /// Acquires one node, registers it for monitoring and starts its watcher.
    ///
    /// Returns the node's address.
    async fn start_node(
        &self,
        role: NodeRole,
        context: UserDataContext,
        stack: &mut ReleaseStack,
        watchers: &mut Watchers,
        token: &CancellationToken,
    ) -> Result<String, FleetError> {
        let spec = self.instance_spec(role, &context)?;
        let mut node = ManagedInstance::acquire(Arc::clone(&self.provider), &spec, &self.timing, token)
            .await
            .map_err(|source| FleetError::Provision { role, source })?;
        self.metrics.update_node_ready(role.as_str(), true);

        let address = node.address().unwrap_or_default().to_string();
        if let Some(instance_id) = node.instance_id().cloned() {
            if role.watch_policy() != WatchPolicy::Unwatched {
                let provider = Arc::clone(&self.provider);
                let name = node.name().to_string();
                let poll = self.timing.monitor_poll;
                let token = token.clone();
                watchers.spawn(async move {
                    let outcome = watch_instance(provider, name, instance_id, poll, token.clone()).await;
                    if outcome == WatchOutcome::Exited {
                        token.cancel();
                    }
                    (role, outcome)
                });
            }
        }

        let port = self.config.nodes.for_role(role).metrics_port;
        let targets = [scrape_target(&address, port)];
        let registration =
            MonitoringRegistration::new(Arc::clone(&self.registry), self.config.service_name(role));
        let registered = registration.register(&targets).await;
        if registered.is_ok() {
            node.mark_monitored();
        }
        stack.push(node);
        stack.push(registration);

        registered
            .map(|()| address)
            .map_err(|source| FleetError::Monitoring { role, source })
    }

    async fn start_pool(
        &self,
        context: UserDataContext,
        stack: &mut ReleaseStack,
        token: &CancellationToken,
    ) -> Result<(), FleetError> {
        let role = NodeRole::WorkerPool;
        let template = self.instance_spec(role, &context)?;
        let spec = PoolSpec {
            name: template.name.clone(),
            template,
            target_capacity: self.config.num_workers,
            valid_until: lease_end(Utc::now(), self.config.lease()),
        };

        let pool = ManagedPool::acquire(Arc::clone(&self.provider), &spec, &self.timing, token)
            .await
            .map_err(|source| FleetError::Provision { role, source })?;
        self.metrics.update_node_ready(role.as_str(), true);

        let port = self.config.nodes.for_role(role).metrics_port;
        let targets: Vec<String> = pool
            .addresses()
            .iter()
            .map(|a| scrape_target(a, port))
            .collect();
        stack.push(pool);

        let registration =
            MonitoringRegistration::new(Arc::clone(&self.registry), self.config.service_name(role));
        let registered = registration.register(&targets).await;
        stack.push(registration);
        registered.map_err(|source| FleetError::Monitoring { role, source })
    }
}

fn is_cancellation(error: &FleetError) -> bool {
    matches!(
        error,
        FleetError::Provision {
            source: ProvisionError::Cancelled(_),
            ..
        }
    )
}

fn lease_end(now: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Waits for every watcher and returns the first node that exited.
async fn drain_watchers(watchers: &mut Watchers) -> (Option<NodeRole>, Option<FleetError>) {
    let mut exited = None;
    let mut failure = None;
    while let Some(joined) = watchers.join_next().await {
        match joined {
            Ok((role, WatchOutcome::Exited)) => {
                if exited.is_none() {
                    warn!(role = %role, "Watched node exited");
                    exited = Some(role);
                }
            }
            Ok((_, WatchOutcome::Cancelled)) => {}
            Err(e) => {
                failure.get_or_insert(FleetError::Watcher(e.to_string()));
            }
        }
    }
    (exited, failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_end() {
        let now = Utc::now();
        let end = lease_end(now, std::time::Duration::from_secs(1800));
        assert_eq!((end - now).num_minutes(), 30);
        assert_eq!(
            lease_end(now, std::time::Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_cancellation_classification() {
        let cancelled = FleetError::Provision {
            role: NodeRole::Producer,
            source: ProvisionError::Cancelled("producer".to_string()),
        };
        assert!(is_cancellation(&cancelled));
        assert!(!is_cancellation(&FleetError::InstanceLost(NodeRole::Broker)));
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(FleetOutcome::LeaseExpired.to_string(), "lease expired");
    }
}
