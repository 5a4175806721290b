//! Ordered teardown of everything a fleet run acquired.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::instance::{ManagedInstance, ManagedPool};
use super::monitoring::MonitoringRegistry;
use crate::error::{MonitoringError, ProvisionError};

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Monitoring(#[from] MonitoringError),
}

/// A resource that must be given back when the run ends.
#[async_trait]
pub trait Releasable: Send {
    /// Short label used in logs and teardown reports.
    fn label(&self) -> String;

    async fn release(&mut self) -> Result<(), ReleaseError>;
}

#[async_trait]
impl Releasable for ManagedInstance {
    fn label(&self) -> String {
        format!("instance {}", self.name())
    }

    async fn release(&mut self) -> Result<(), ReleaseError> {
        Ok(ManagedInstance::release(self).await?)
    }
}

#[async_trait]
impl Releasable for ManagedPool {
    fn label(&self) -> String {
        format!("pool {}", self.name())
    }

    async fn release(&mut self) -> Result<(), ReleaseError> {
        Ok(ManagedPool::release(self).await?)
    }
}

/// Targets registered under a monitoring service; releasing clears them.
///
/// Release clears the service even when registration reported an error, since
/// the registry may have applied the targets before failing.
pub struct MonitoringRegistration {
    registry: Arc<dyn MonitoringRegistry>,
    service: String,
}

impl MonitoringRegistration {
    pub fn new(registry: Arc<dyn MonitoringRegistry>, service: impl Into<String>) -> Self {
        Self {
            registry,
            service: service.into(),
        }
    }

    /// Registers `targets` under this service.
    pub async fn register(&self, targets: &[String]) -> Result<(), MonitoringError> {
        self.registry.register_targets(&self.service, targets).await
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

#[async_trait]
impl Releasable for MonitoringRegistration {
    fn label(&self) -> String {
        format!("monitoring {}", self.service)
    }

    async fn release(&mut self) -> Result<(), ReleaseError> {
        Ok(self.registry.clear_targets(&self.service).await?)
    }
}

/// Resources in acquisition order, released last-in first-out.
#[derive(Default)]
pub struct ReleaseStack {
    entries: Vec<Box<dyn Releasable>>,
}

impl ReleaseStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: impl Releasable + 'static) {
        self.entries.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases every resource in reverse order.
    ///
    /// A failing release does not stop the unwind. Returns one message per
    /// failed release, in the order they were attempted.
    pub async fn release_all(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some(mut resource) = self.entries.pop() {
            let label = resource.label();
            match resource.release().await {
                Ok(()) => info!(resource = %label, "Released"),
                Err(e) => {
                    warn!(resource = %label, error = %e, "Release failed");
                    failures.push(format!("{label}: {e}"));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorded {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Releasable for Recorded {
        fn label(&self) -> String {
            self.name.to_string()
        }

        async fn release(&mut self) -> Result<(), ReleaseError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(ProvisionError::Backend("api unavailable".to_string()).into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_release_is_reverse_order_and_continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ReleaseStack::new();
        for (name, fail) in [("monitoring", false), ("broker", true), ("consumer", false)] {
            stack.push(Recorded {
                name,
                fail,
                log: log.clone(),
            });
        }
        assert_eq!(stack.len(), 3);

        let failures = stack.release_all().await;

        assert_eq!(*log.lock().unwrap(), ["consumer", "broker", "monitoring"]);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("broker: "));
        assert!(stack.is_empty());
    }

    #[derive(Default)]
    struct CountingRegistry {
        calls: Mutex<Vec<(String, usize)>>,
        fail_register: bool,
    }

    #[async_trait]
    impl MonitoringRegistry for CountingRegistry {
        async fn register_targets(
            &self,
            service: &str,
            targets: &[String],
        ) -> Result<(), MonitoringError> {
            self.calls
                .lock()
                .unwrap()
                .push((service.to_string(), targets.len()));
            if self.fail_register {
                return Err(MonitoringError::RequestFailed("response timed out".to_string()));
            }
            Ok(())
        }

        async fn clear_targets(&self, service: &str) -> Result<(), MonitoringError> {
            self.calls.lock().unwrap().push((service.to_string(), 0));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registration_is_cleared_on_release() {
        let registry = Arc::new(CountingRegistry::default());
        let registration = MonitoringRegistration::new(registry.clone(), "skyscan-broker");
        registration
            .register(&["10.0.0.3:9121".to_string()])
            .await
            .expect("register");
        assert_eq!(registration.service(), "skyscan-broker");

        let mut stack = ReleaseStack::new();
        stack.push(registration);
        assert!(stack.release_all().await.is_empty());

        let calls = registry.calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            [
                ("skyscan-broker".to_string(), 1),
                ("skyscan-broker".to_string(), 0)
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_registration_is_still_cleared_on_release() {
        let registry = Arc::new(CountingRegistry {
            fail_register: true,
            ..Default::default()
        });
        let registration = MonitoringRegistration::new(registry.clone(), "skyscan-broker");
        assert!(registration
            .register(&["10.0.0.3:9121".to_string()])
            .await
            .is_err());

        let mut stack = ReleaseStack::new();
        stack.push(registration);
        assert!(stack.release_all().await.is_empty());

        let calls = registry.calls.lock().unwrap();
        assert_eq!(calls.last(), Some(&("skyscan-broker".to_string(), 0)));
    }
}
