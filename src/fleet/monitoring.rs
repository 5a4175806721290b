//! Registration of fleet nodes with the monitoring service.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::MonitoringError;
use crate::pipeline::ConfigError;

/// Target registry of the monitoring service.
///
/// A service name maps to the full list of its scrape targets; registering
/// replaces the list and clearing empties it.
#[async_trait]
pub trait MonitoringRegistry: Send + Sync {
    async fn register_targets(&self, service: &str, targets: &[String])
        -> Result<(), MonitoringError>;

    async fn clear_targets(&self, service: &str) -> Result<(), MonitoringError>;
}

#[derive(Serialize)]
struct TargetList<'a> {
    targets: &'a [String],
}

/// Registry reached over HTTP: `PUT {base}/{service}` with `{"targets": [...]}`.
pub struct HttpMonitoringRegistry {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpMonitoringRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn service_url(&self, service: &str) -> String {
        format!("{}/{}", self.base_url, service)
    }

    async fn put_targets(&self, service: &str, targets: &[String]) -> Result<(), MonitoringError> {
        let mut request = self
            .client
            .put(self.service_url(service))
            .json(&TargetList { targets });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MonitoringError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitoringError::Rejected {
                service: service.to_string(),
                status: status.as_u16(),
            });
        }

        debug!(service = service, targets = targets.len(), "Monitoring targets updated");
        Ok(())
    }
}

#[async_trait]
impl MonitoringRegistry for HttpMonitoringRegistry {
    async fn register_targets(
        &self,
        service: &str,
        targets: &[String],
    ) -> Result<(), MonitoringError> {
        self.put_targets(service, targets).await?;
        info!(service = service, targets = ?targets, "Monitoring enabled");
        Ok(())
    }

    async fn clear_targets(&self, service: &str) -> Result<(), MonitoringError> {
        self.put_targets(service, &[]).await?;
        info!(service = service, "Monitoring disabled");
        Ok(())
    }
}

/// Reads a bearer token from `path`, ignoring surrounding whitespace.
pub fn load_token(path: &Path) -> Result<String, ConfigError> {
    let token = std::fs::read_to_string(path)?.trim().to_string();
    if token.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: path.display().to_string(),
            message: "token file is empty".to_string(),
        });
    }
    Ok(token)
}

/// Scrape target for a node address; IPv6 literals are bracketed.
pub fn scrape_target(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}
