//! Acquisition, release and liveness of individual fleet resources.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ProvisionTiming;
use super::provider::{
    InstanceId, InstanceSpec, InstanceState, PoolId, PoolSpec, PoolState, ProvisioningApi,
    RequestId, RequestStatus,
};
use super::NodeRole;
use crate::error::ProvisionError;

/// Lifecycle of a fleet node as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Requested,
    Pending,
    Running,
    Monitored,
    Terminating,
    Terminated,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Requested => "requested",
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Monitored => "monitored",
            NodeState::Terminating => "terminating",
            NodeState::Terminated => "terminated",
            NodeState::Failed => "failed",
        }
    }

    /// What a node in this state is still waiting for during startup.
    fn waiting_for(&self) -> &'static str {
        match self {
            NodeState::Requested => "fulfilled",
            _ => "reachable",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs `wait` under the startup timeout and the cancellation token.
async fn bounded<F>(
    name: &str,
    waiting_for: &str,
    timing: &ProvisionTiming,
    token: &CancellationToken,
    wait: F,
) -> Result<(), ProvisionError>
where
    F: std::future::Future<Output = Result<(), ProvisionError>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(ProvisionError::Cancelled(name.to_string())),
        outcome = tokio::time::timeout(timing.startup_timeout, wait) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::Timeout {
                name: name.to_string(),
                waiting_for: waiting_for.to_string(),
                seconds: timing.startup_timeout.as_secs(),
            }),
        },
    }
}

/// A single provisioned node.
///
/// Created by [`ManagedInstance::acquire`], which either returns a running,
/// reachable node or cleans up after itself. The caller owns the release.
pub struct ManagedInstance {
    provider: Arc<dyn ProvisioningApi>,
    name: String,
    role: NodeRole,
    request_id: Option<RequestId>,
    instance_id: Option<InstanceId>,
    address: Option<String>,
    hostname: Option<String>,
    state: NodeState,
}

impl ManagedInstance {
    /// Requests a node and waits until it is running with an address.
    ///
    /// On any error, timeout or cancellation the pending request is cancelled
    /// and a partially started instance terminated before the error is
    /// returned.
    pub async fn acquire(
        provider: Arc<dyn ProvisioningApi>,
        spec: &InstanceSpec,
        timing: &ProvisionTiming,
        token: &CancellationToken,
    ) -> Result<Self, ProvisionError> {
        if token.is_cancelled() {
            return Err(ProvisionError::Cancelled(spec.name.clone()));
        }

        let request_id = provider.request_instance(spec).await?;
        info!(name = %spec.name, request = %request_id, "Instance requested");

        let mut node = Self {
            provider,
            name: spec.name.clone(),
            role: spec.role,
            request_id: Some(request_id),
            instance_id: None,
            address: None,
            hostname: None,
            state: NodeState::Requested,
        };

        let name = node.name.clone();
        let result = bounded(&name, "reachable", timing, token, node.wait_until_reachable(timing)).await;

        if let Err(e) = result {
            let e = match e {
                ProvisionError::Timeout {
                    name, seconds, ..
                } => ProvisionError::Timeout {
                    name,
                    waiting_for: node.state.waiting_for().to_string(),
                    seconds,
                },
                other => other,
            };
            warn!(name = %node.name, state = %node.state, error = %e, "Instance startup failed, cleaning up");
            node.state = NodeState::Failed;
            if let Err(cleanup) = node.release().await {
                warn!(name = %node.name, error = %cleanup, "Cleanup after failed startup incomplete");
            }
            return Err(e);
        }

        info!(
            name = %node.name,
            instance = %node.instance_id.as_ref().map(|i| i.as_str()).unwrap_or_default(),
            address = %node.address.as_deref().unwrap_or_default(),
            "Instance started"
        );
        Ok(node)
    }

    async fn wait_until_reachable(&mut self, timing: &ProvisionTiming) -> Result<(), ProvisionError> {
        let request_id = match &self.request_id {
            Some(id) => id.clone(),
            None => return Err(ProvisionError::RequestNotFound(self.name.clone())),
        };

        let instance_id = loop {
            match self.provider.describe_request(&request_id).await? {
                RequestStatus::Fulfilled(id) => break id,
                RequestStatus::Open { message } => {
                    debug!(name = %self.name, status = ?message, "Waiting for instance creation");
                }
                RequestStatus::Failed(reason) => {
                    return Err(ProvisionError::RequestFailed(format!("{}: {}", self.name, reason)));
                }
                RequestStatus::Cancelled => {
                    return Err(ProvisionError::RequestFailed(format!(
                        "{}: request cancelled by the backend",
                        self.name
                    )));
                }
            }
            tokio::time::sleep(timing.request_poll).await;
        };
        self.instance_id = Some(instance_id.clone());
        self.state = NodeState::Pending;

        loop {
            let description = self.provider.describe_instance(&instance_id).await?;
            if description.state.is_gone() {
                return Err(ProvisionError::StartupFailed {
                    name: self.name.clone(),
                    state: description.state.to_string(),
                });
            }
            if description.state == InstanceState::Running {
                if let Some(address) = description.address {
                    self.address = Some(address);
                    self.hostname = description.hostname;
                    self.state = NodeState::Running;
                    return Ok(());
                }
            }
            debug!(name = %self.name, state = %description.state, "Waiting for instance startup");
            tokio::time::sleep(timing.address_poll).await;
        }
    }

    /// Cancels the request and terminates the instance.
    ///
    /// Both steps are attempted; the first failure is returned. An instance
    /// the backend no longer knows counts as terminated.
    pub async fn release(&mut self) -> Result<(), ProvisionError> {
        self.state = NodeState::Terminating;
        let mut first_error = None;

        if let Some(request_id) = self.request_id.take() {
            if let Err(e) = self.provider.cancel_request(&request_id).await {
                warn!(name = %self.name, request = %request_id, error = %e, "Failed to cancel request");
                first_error.get_or_insert(e);
            }
        }

        if let Some(instance_id) = self.instance_id.take() {
            match self.provider.terminate_instance(&instance_id).await {
                Ok(()) => info!(name = %self.name, instance = %instance_id, "Instance terminated"),
                Err(ProvisionError::InstanceNotFound(_)) => {
                    debug!(name = %self.name, instance = %instance_id, "Instance already gone");
                }
                Err(e) => {
                    warn!(name = %self.name, instance = %instance_id, error = %e, "Failed to terminate instance");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                self.state = NodeState::Failed;
                Err(e)
            }
            None => {
                self.state = NodeState::Terminated;
                Ok(())
            }
        }
    }

    pub fn mark_monitored(&mut self) {
        if self.state == NodeState::Running {
            self.state = NodeState::Monitored;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.instance_id.as_ref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }
}

/// An elastic pool of identical worker nodes.
pub struct ManagedPool {
    provider: Arc<dyn ProvisioningApi>,
    name: String,
    pool_id: Option<PoolId>,
    target_capacity: u32,
    addresses: Vec<String>,
    state: NodeState,
}

impl ManagedPool {
    /// Requests a pool and waits until it reaches its target capacity.
    ///
    /// A pool the backend reports as failed, a timeout or a cancellation
    /// cancels the pool with its members terminated before returning.
    pub async fn acquire(
        provider: Arc<dyn ProvisioningApi>,
        spec: &PoolSpec,
        timing: &ProvisionTiming,
        token: &CancellationToken,
    ) -> Result<Self, ProvisionError> {
        if token.is_cancelled() {
            return Err(ProvisionError::Cancelled(spec.name.clone()));
        }

        let pool_id = provider.request_pool(spec).await?;
        info!(name = %spec.name, pool = %pool_id, target = spec.target_capacity, "Pool requested");

        let mut pool = Self {
            provider,
            name: spec.name.clone(),
            pool_id: Some(pool_id.clone()),
            target_capacity: spec.target_capacity,
            addresses: Vec::new(),
            state: NodeState::Requested,
        };

        let name = pool.name.clone();
        let result = bounded(
            &name,
            "at capacity",
            timing,
            token,
            pool.wait_for_capacity(&pool_id, timing),
        )
        .await;

        if let Err(e) = result {
            warn!(name = %pool.name, error = %e, "Pool startup failed, cleaning up");
            pool.state = NodeState::Failed;
            if let Err(cleanup) = pool.release().await {
                warn!(name = %pool.name, error = %cleanup, "Cleanup after failed pool startup incomplete");
            }
            return Err(e);
        }

        info!(name = %pool.name, pool = %pool_id, members = pool.addresses.len(), "Pool at capacity");
        Ok(pool)
    }

    async fn wait_for_capacity(
        &mut self,
        pool_id: &PoolId,
        timing: &ProvisionTiming,
    ) -> Result<(), ProvisionError> {
        loop {
            let description = self.provider.describe_pool(pool_id).await?;
            match description.state {
                PoolState::Failed(reason) => {
                    return Err(ProvisionError::StartupFailed {
                        name: self.name.clone(),
                        state: format!(
                            "failed with {} of {} running: {}",
                            description.running, description.target_capacity, reason
                        ),
                    });
                }
                PoolState::Cancelled => {
                    return Err(ProvisionError::StartupFailed {
                        name: self.name.clone(),
                        state: "cancelled".to_string(),
                    });
                }
                PoolState::Active => {}
            }

            self.state = NodeState::Pending;
            if description.is_at_capacity() {
                self.addresses = description.addresses;
                self.state = NodeState::Running;
                return Ok(());
            }

            debug!(
                name = %self.name,
                running = description.running,
                target = description.target_capacity,
                "Waiting for pool capacity"
            );
            tokio::time::sleep(timing.address_poll).await;
        }
    }

    /// Cancels the pool and terminates all of its members.
    pub async fn release(&mut self) -> Result<(), ProvisionError> {
        let Some(pool_id) = self.pool_id.take() else {
            return Ok(());
        };
        self.state = NodeState::Terminating;

        match self.provider.cancel_pool(&pool_id, true).await {
            Ok(()) | Err(ProvisionError::PoolNotFound(_)) => {
                info!(name = %self.name, pool = %pool_id, "Pool terminated");
                self.state = NodeState::Terminated;
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.name, pool = %pool_id, error = %e, "Failed to cancel pool");
                self.state = NodeState::Failed;
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn pool_id(&self) -> Option<&PoolId> {
        self.pool_id.as_ref()
    }

    pub fn target_capacity(&self) -> u32 {
        self.target_capacity
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}

/// Result of watching one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The node stopped running or disappeared.
    Exited,
    /// The watch was cancelled while the node was still running.
    Cancelled,
}

/// Polls `instance_id` until it leaves the running state or `token` fires.
///
/// Lookup errors other than "not found" are logged and retried on the next
/// poll.
pub async fn watch_instance(
    provider: Arc<dyn ProvisioningApi>,
    name: String,
    instance_id: InstanceId,
    poll: Duration,
    token: CancellationToken,
) -> WatchOutcome {
    loop {
        let description = tokio::select! {
            _ = token.cancelled() => return WatchOutcome::Cancelled,
            d = provider.describe_instance(&instance_id) => d,
        };

        match description {
            Ok(d) if d.state == InstanceState::Running => {}
            Ok(d) => {
                warn!(name = %name, instance = %instance_id, state = %d.state, "Instance no longer running");
                return WatchOutcome::Exited;
            }
            Err(ProvisionError::InstanceNotFound(_)) => {
                warn!(name = %name, instance = %instance_id, "Instance disappeared");
                return WatchOutcome::Exited;
            }
            Err(e) => {
                warn!(name = %name, instance = %instance_id, error = %e, "Liveness check failed, retrying");
            }
        }

        tokio::select! {
            _ = token.cancelled() => return WatchOutcome::Cancelled,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::provider::{InstanceDescription, PoolDescription};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    /// Provider that replays scripted answers and counts cleanup calls.
    #[derive(Default)]
    struct ScriptedProvider {
        requests: Mutex<VecDeque<RequestStatus>>,
        instances: Mutex<VecDeque<(InstanceState, Option<&'static str>)>>,
        pools: Mutex<VecDeque<(PoolState, u32)>>,
        cancelled_requests: Mutex<Vec<RequestId>>,
        terminated: Mutex<Vec<InstanceId>>,
        cancelled_pools: Mutex<Vec<(PoolId, bool)>>,
    }

    impl ScriptedProvider {
        fn with_requests(self, statuses: Vec<RequestStatus>) -> Self {
            *self.requests.lock().unwrap() = statuses.into();
            self
        }

        fn with_instances(self, states: Vec<(InstanceState, Option<&'static str>)>) -> Self {
            *self.instances.lock().unwrap() = states.into();
            self
        }

        fn with_pools(self, states: Vec<(PoolState, u32)>) -> Self {
            *self.pools.lock().unwrap() = states.into();
            self
        }

        fn cancelled_requests(&self) -> usize {
            self.cancelled_requests.lock().unwrap().len()
        }

        fn terminated(&self) -> usize {
            self.terminated.lock().unwrap().len()
        }
    }

    /// Pops the next scripted answer, repeating the last one forever.
    fn next<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    #[async_trait]
    impl ProvisioningApi for ScriptedProvider {
        async fn request_instance(&self, spec: &InstanceSpec) -> Result<RequestId, ProvisionError> {
            Ok(RequestId::new(format!("req-{}", spec.name)))
        }

        async fn describe_request(&self, id: &RequestId) -> Result<RequestStatus, ProvisionError> {
            next(&self.requests).ok_or_else(|| ProvisionError::RequestNotFound(id.to_string()))
        }

        async fn describe_instance(
            &self,
            id: &InstanceId,
        ) -> Result<InstanceDescription, ProvisionError> {
            let (state, address) = next(&self.instances)
                .ok_or_else(|| ProvisionError::InstanceNotFound(id.to_string()))?;
            Ok(InstanceDescription {
                id: id.clone(),
                state,
                address: address.map(str::to_string),
                hostname: None,
            })
        }

        async fn terminate_instance(&self, id: &InstanceId) -> Result<(), ProvisionError> {
            self.terminated.lock().unwrap().push(id.clone());
            Ok(())
        }

        async fn cancel_request(&self, id: &RequestId) -> Result<(), ProvisionError> {
            self.cancelled_requests.lock().unwrap().push(id.clone());
            Ok(())
        }

        async fn request_pool(&self, spec: &PoolSpec) -> Result<PoolId, ProvisionError> {
            Ok(PoolId::new(format!("pool-{}", spec.name)))
        }

        async fn describe_pool(&self, id: &PoolId) -> Result<PoolDescription, ProvisionError> {
            let (state, running) =
                next(&self.pools).ok_or_else(|| ProvisionError::PoolNotFound(id.to_string()))?;
            Ok(PoolDescription {
                id: id.clone(),
                target_capacity: 5,
                running,
                state,
                addresses: (0..running).map(|i| format!("10.1.0.{i}")).collect(),
            })
        }

        async fn cancel_pool(&self, id: &PoolId, terminate: bool) -> Result<(), ProvisionError> {
            self.cancelled_pools.lock().unwrap().push((id.clone(), terminate));
            Ok(())
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "broker".to_string(),
            role: NodeRole::Broker,
            image: "redis:7".to_string(),
            cpus: 1.0,
            memory_mb: 512,
            user_data: String::new(),
            public: false,
            labels: BTreeMap::new(),
        }
    }

    fn pool_spec() -> PoolSpec {
        PoolSpec {
            name: "workers".to_string(),
            template: spec(),
            target_capacity: 5,
            valid_until: chrono::Utc::now(),
        }
    }

    fn fulfilled() -> RequestStatus {
        RequestStatus::Fulfilled(InstanceId::new("i-1"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_address() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .with_requests(vec![
                    RequestStatus::Open {
                        message: Some("capacity-not-available".to_string()),
                    },
                    fulfilled(),
                ])
                .with_instances(vec![
                    (InstanceState::Pending, None),
                    (InstanceState::Running, None),
                    (InstanceState::Running, Some("10.0.0.3")),
                ]),
        );

        let node = ManagedInstance::acquire(
            provider.clone(),
            &spec(),
            &ProvisionTiming::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("acquire");

        assert_eq!(node.state(), NodeState::Running);
        assert_eq!(node.address(), Some("10.0.0.3"));
        assert_eq!(node.instance_id(), Some(&InstanceId::new("i-1")));
        assert_eq!(provider.terminated(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_is_cancelled() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .with_requests(vec![RequestStatus::Failed("price-too-low".to_string())]),
        );

        let result = ManagedInstance::acquire(
            provider.clone(),
            &spec(),
            &ProvisionTiming::default(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ProvisionError::RequestFailed(ref m)) if m.contains("price-too-low")));
        assert_eq!(provider.cancelled_requests(), 1);
        assert_eq!(provider.terminated(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_dying_during_startup_is_terminated() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .with_requests(vec![fulfilled()])
                .with_instances(vec![
                    (InstanceState::Pending, None),
                    (InstanceState::Terminated, None),
                ]),
        );

        let result = ManagedInstance::acquire(
            provider.clone(),
            &spec(),
            &ProvisionTiming::default(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ProvisionError::StartupFailed { .. })));
        assert_eq!(provider.cancelled_requests(), 1);
        assert_eq!(provider.terminated(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_cleans_up() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .with_requests(vec![fulfilled()])
                .with_instances(vec![(InstanceState::Pending, None)]),
        );
        let timing = ProvisionTiming::default().with_startup_timeout(Duration::from_secs(120));

        let result =
            ManagedInstance::acquire(provider.clone(), &spec(), &timing, &CancellationToken::new())
                .await;

        match result {
            Err(ProvisionError::Timeout {
                waiting_for,
                seconds,
                ..
            }) => {
                assert_eq!(waiting_for, "reachable");
                assert_eq!(seconds, 120);
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert_eq!(provider.terminated(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_startup_cleans_up() {
        let provider = Arc::new(
            ScriptedProvider::default().with_requests(vec![RequestStatus::Open { message: None }]),
        );
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            canceller.cancel();
        });

        let result =
            ManagedInstance::acquire(provider.clone(), &spec(), &ProvisionTiming::default(), &token)
                .await;

        assert!(matches!(result, Err(ProvisionError::Cancelled(_))));
        assert_eq!(provider.cancelled_requests(), 1);
    }

    #[tokio::test]
    async fn test_release_attempts_both_steps() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .with_requests(vec![fulfilled()])
                .with_instances(vec![(InstanceState::Running, Some("10.0.0.9"))]),
        );
        let mut node = ManagedInstance::acquire(
            provider.clone(),
            &spec(),
            &ProvisionTiming::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("acquire");

        node.release().await.expect("release");
        assert_eq!(node.state(), NodeState::Terminated);
        assert_eq!(provider.cancelled_requests(), 1);
        assert_eq!(provider.terminated(), 1);

        // A second release has nothing left to do
        node.release().await.expect("release again");
        assert_eq!(provider.terminated(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_reaches_capacity() {
        let provider = Arc::new(ScriptedProvider::default().with_pools(vec![
            (PoolState::Active, 0),
            (PoolState::Active, 3),
            (PoolState::Active, 5),
        ]));

        let pool = ManagedPool::acquire(
            provider.clone(),
            &pool_spec(),
            &ProvisionTiming::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("acquire");

        assert_eq!(pool.state(), NodeState::Running);
        assert_eq!(pool.addresses().len(), 5);
        assert!(provider.cancelled_pools.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pool_is_cancelled_with_members() {
        let provider = Arc::new(ScriptedProvider::default().with_pools(vec![
            (PoolState::Active, 1),
            (PoolState::Active, 2),
            (PoolState::Failed("instance 3 failed to launch".to_string()), 2),
        ]));

        let result = ManagedPool::acquire(
            provider.clone(),
            &pool_spec(),
            &ProvisionTiming::default(),
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(ProvisionError::StartupFailed { state, .. }) => {
                assert!(state.contains("2 of 5"));
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
        let cancelled = provider.cancelled_pools.lock().unwrap();
        assert_eq!(cancelled.as_slice(), [(PoolId::new("pool-workers"), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_detects_exit() {
        let provider = Arc::new(ScriptedProvider::default().with_instances(vec![
            (InstanceState::Running, Some("10.0.0.3")),
            (InstanceState::Running, Some("10.0.0.3")),
            (InstanceState::Stopping, None),
        ]));

        let outcome = watch_instance(
            provider,
            "broker".to_string(),
            InstanceId::new("i-1"),
            Duration::from_secs(60),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, WatchOutcome::Exited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_stops_on_cancel() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .with_instances(vec![(InstanceState::Running, Some("10.0.0.3"))]),
        );
        let token = CancellationToken::new();
        let watcher = tokio::spawn(watch_instance(
            provider,
            "broker".to_string(),
            InstanceId::new("i-1"),
            Duration::from_secs(60),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(600)).await;
        token.cancel();
        assert_eq!(watcher.await.expect("join"), WatchOutcome::Cancelled);
    }
}
