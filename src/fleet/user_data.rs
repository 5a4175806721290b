//! Startup scripts handed to each node.
//!
//! Scripts are tera templates rendered with the addresses known at the time
//! the node is requested, then base64-encoded for the backend.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use super::config::FleetConfig;
use super::NodeRole;
use crate::error::ProvisionError;

const MONITORING_TEMPLATE: &str = r#"#!/bin/sh
set -e
mkdir -p /etc/prometheus/targets
cat > /etc/prometheus/prometheus.yml <<EOF
global:
  scrape_interval: 15s
scrape_configs:
  - job_name: skyscan
    file_sd_configs:
      - files:
          - /etc/prometheus/targets/*.json
EOF
echo '[]' > /etc/prometheus/targets/empty.json
exec prometheus --config.file=/etc/prometheus/prometheus.yml --web.listen-address=:{{ metrics_port }}
"#;

const BROKER_TEMPLATE: &str = r#"#!/bin/sh
set -e
exec redis-server --protected-mode no --appendonly yes
"#;

const WAIT_FOR_BROKER: &str = r#"until nc -z {{ broker_host }} {{ broker_port }}; do
  sleep 1
done
"#;

const PRODUCER_TEMPLATE: &str = r#"#!/bin/sh
set -e
{{ wait_for_broker }}
mkdir -p /data
{% if event_url %}wget -q -O /data/event "{{ event_url }}"
{% endif %}exec skyscan --address {{ broker_address }} produce --queue {{ in_queue }} --nside {{ nside }} --variants {{ variants }} /data/event
"#;

const CONSUMER_TEMPLATE: &str = r#"#!/bin/sh
set -e
{{ wait_for_broker }}
mkdir -p /data/results
exec skyscan --address {{ broker_address }} --metrics-file /data/metrics.prom consolidate --queue {{ out_queue }} --timeout {{ consumer_timeout }} --variants {{ variants }} --output /data/results
"#;

const WORKER_TEMPLATE: &str = r#"#!/bin/sh
set -e
{{ wait_for_broker }}
exec skyscan --address {{ broker_address }} work --in-queue {{ in_queue }} --out-queue {{ out_queue }} --timeout {{ worker_timeout }} --sleep {{ worker_sleep }} --command {{ reconstruct_command }}
"#;

/// Values available to every startup template.
#[derive(Debug, Clone, Serialize)]
pub struct UserDataContext {
    pub role: String,
    pub monitoring_address: Option<String>,
    pub broker_address: Option<String>,
    pub broker_host: Option<String>,
    pub broker_port: u16,
    pub metrics_port: u16,
    pub in_queue: String,
    pub out_queue: String,
    pub variants: u32,
    pub nside: u32,
    pub worker_timeout: u64,
    pub consumer_timeout: u64,
    pub worker_sleep: u64,
    pub event_url: Option<String>,
    pub reconstruct_command: String,
}

impl UserDataContext {
    /// Context for a node of `role`, before any address is known.
    pub fn new(config: &FleetConfig, role: NodeRole) -> Self {
        let pipeline = &config.pipeline;
        Self {
            role: role.to_string(),
            monitoring_address: None,
            broker_address: None,
            broker_host: None,
            broker_port: crate::queue::DEFAULT_REDIS_PORT,
            metrics_port: config.nodes.for_role(role).metrics_port,
            in_queue: pipeline.in_queue.clone(),
            out_queue: pipeline.out_queue.clone(),
            variants: pipeline.variants,
            nside: pipeline.nside,
            worker_timeout: pipeline.worker_timeout_secs,
            consumer_timeout: pipeline.consumer_timeout_secs,
            worker_sleep: pipeline.worker_sleep_secs,
            event_url: pipeline.event_url.clone(),
            reconstruct_command: pipeline.reconstruct_command.clone(),
        }
    }

    pub fn with_monitoring_address(mut self, address: impl Into<String>) -> Self {
        self.monitoring_address = Some(address.into());
        self
    }

    /// Sets the broker host. IPv6 literals are bracketed in the address.
    pub fn with_broker(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        let address = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.clone()
        };
        self.broker_host = Some(host);
        self.broker_address = Some(address);
        self
    }
}

/// Renders role startup scripts from built-in or configured templates.
#[derive(Debug, Clone, Default)]
pub struct UserDataRenderer {
    overrides: HashMap<NodeRole, String>,
}

impl UserDataRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renderer honouring the `user_data` overrides of `config`.
    pub fn from_config(config: &FleetConfig) -> Self {
        let overrides = NodeRole::ALL
            .iter()
            .filter_map(|role| {
                config
                    .nodes
                    .for_role(*role)
                    .user_data
                    .clone()
                    .map(|t| (*role, t))
            })
            .collect();
        Self { overrides }
    }

    pub fn with_template(mut self, role: NodeRole, template: impl Into<String>) -> Self {
        self.overrides.insert(role, template.into());
        self
    }

    fn template(&self, role: NodeRole) -> &str {
        if let Some(template) = self.overrides.get(&role) {
            return template;
        }
        match role {
            NodeRole::Monitoring => MONITORING_TEMPLATE,
            NodeRole::Broker => BROKER_TEMPLATE,
            NodeRole::Producer => PRODUCER_TEMPLATE,
            NodeRole::Consumer => CONSUMER_TEMPLATE,
            NodeRole::WorkerPool => WORKER_TEMPLATE,
        }
    }

    /// Renders the startup script of `role` as plain text.
    pub fn render(&self, role: NodeRole, ctx: &UserDataContext) -> Result<String, ProvisionError> {
        let mut context = tera::Context::from_serialize(ctx)?;
        let wait = tera::Tera::one_off(WAIT_FOR_BROKER, &context, false)?;
        context.insert("wait_for_broker", &wait);
        Ok(tera::Tera::one_off(self.template(role), &context, false)?)
    }

    /// Renders and base64-encodes the startup script of `role`.
    pub fn render_encoded(
        &self,
        role: NodeRole,
        ctx: &UserDataContext,
    ) -> Result<String, ProvisionError> {
        Ok(encode_user_data(&self.render(role, ctx)?))
    }
}

pub fn encode_user_data(script: &str) -> String {
    STANDARD.encode(script.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(role: NodeRole) -> UserDataContext {
        UserDataContext::new(&FleetConfig::default(), role)
            .with_monitoring_address("10.0.0.2")
            .with_broker("10.0.0.3")
    }

    #[test]
    fn test_worker_script_carries_pipeline_settings() {
        let script = UserDataRenderer::new()
            .render(NodeRole::WorkerPool, &context(NodeRole::WorkerPool))
            .expect("render");

        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("until nc -z 10.0.0.3 6379"));
        assert!(script.contains("--address 10.0.0.3 work"));
        assert!(script.contains("--in-queue inqueue --out-queue outqueue"));
        assert!(script.contains("--timeout 360"));
        assert!(script.contains("--command skyscan-fit"));
    }

    #[test]
    fn test_producer_downloads_event_only_when_configured() {
        let renderer = UserDataRenderer::new();
        let ctx = context(NodeRole::Producer);
        let script = renderer.render(NodeRole::Producer, &ctx).expect("render");
        assert!(!script.contains("wget"));

        let mut ctx = ctx;
        ctx.event_url = Some("https://data.example.org/run1.evt".to_string());
        let script = renderer.render(NodeRole::Producer, &ctx).expect("render");
        assert!(script.contains(r#"wget -q -O /data/event "https://data.example.org/run1.evt""#));
    }

    #[test]
    fn test_ipv6_broker_is_bracketed() {
        let ctx = UserDataContext::new(&FleetConfig::default(), NodeRole::Consumer)
            .with_broker("2600:1f18::5");
        let script = UserDataRenderer::new()
            .render(NodeRole::Consumer, &ctx)
            .expect("render");

        assert!(script.contains("--address [2600:1f18::5] "));
        assert!(script.contains("nc -z 2600:1f18::5 6379"));
    }

    #[test]
    fn test_override_and_encoding() {
        let renderer =
            UserDataRenderer::new().with_template(NodeRole::Broker, "echo {{ role }} {{ metrics_port }}");
        let encoded = renderer
            .render_encoded(NodeRole::Broker, &context(NodeRole::Broker))
            .expect("render");

        let decoded = STANDARD.decode(encoded).expect("base64");
        assert_eq!(decoded, b"echo broker 9121");
    }

    #[test]
    fn test_bad_template_is_error() {
        let renderer = UserDataRenderer::new().with_template(NodeRole::Broker, "{{ unclosed");
        let err = renderer
            .render(NodeRole::Broker, &context(NodeRole::Broker))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::UserData(_)));
    }

    #[test]
    fn test_config_overrides_are_used() {
        let mut config = FleetConfig::default();
        config.nodes.consumer.user_data = Some("custom {{ out_queue }}".to_string());
        let script = UserDataRenderer::from_config(&config)
            .render(NodeRole::Consumer, &UserDataContext::new(&config, NodeRole::Consumer))
            .expect("render");
        assert_eq!(script, "custom outqueue");
    }
}
