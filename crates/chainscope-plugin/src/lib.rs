#![warn(missing_docs)]

//! # chainscope-plugin
//!
//! Datasource plugins for the chainscope MCP server.
//!
//! A plugin owns the configuration for one datasource kind. It contributes
//! three things, strictly separated by trust level:
//!
//! - **Proxy handler targets** (credentials included) — consumed only by the
//!   credential proxy, never serialized elsewhere.
//! - **Sandbox environment** (credential-free metadata) — injected into the
//!   Python sandbox.
//! - **Docs & examples** — surfaced through MCP resources.
//!
//! The registry holds the ordered plugin set and aggregates all three.

pub mod registry;

mod clickhouse;
mod loki;
mod prometheus;
mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use chainscope_proxy::handlers::{ClickHouseTarget, LokiTarget, PrometheusTarget, S3Config};
use chainscope_proxy::ProxyClient;

pub use clickhouse::ClickHousePlugin;
pub use loki::LokiPlugin;
pub use prometheus::PrometheusPlugin;
pub use registry::{HealthReport, PluginRegistry};
pub use storage::StoragePlugin;

/// Errors from plugin initialization.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin has no usable configuration. The registry treats this as
    /// "disabled", not as a failure.
    #[error("no valid config")]
    NoValidConfig,

    /// The configuration is present but wrong — fatal at startup.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Raw YAML failed to parse into the plugin's config shape.
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Credential-free description of one datasource, as surfaced to the
/// sandbox and to MCP resources.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatasourceInfo {
    /// Discovery name (the `X-Datasource` value).
    pub name: String,
    /// Kind: "clickhouse", "prometheus", "loki", "s3".
    pub kind: String,
    /// Human description, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One worked query example for the sandbox docs.
#[derive(Debug, Clone, Serialize)]
pub struct QueryExample {
    /// Short title.
    pub title: String,
    /// What the example demonstrates.
    pub description: String,
    /// Python source.
    pub code: String,
}

/// Plugin health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// The plugin's backing services answer.
    Healthy,
    /// Something is wrong; the string says what.
    Unhealthy(String),
    /// The plugin does not implement a health check.
    Unknown,
}

/// A datasource plugin.
///
/// `init` (construction from raw YAML) happens in each plugin's
/// constructor; everything after construction is read-mostly.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name (matches the config key).
    fn name(&self) -> &str;

    /// Credential-free environment injected into the sandbox. Merged across
    /// plugins by the registry; later plugins win on collision.
    fn sandbox_env(&self) -> HashMap<String, String>;

    /// Credential-free datasource metadata.
    fn datasource_info(&self) -> Vec<DatasourceInfo>;

    /// Worked query examples.
    fn examples(&self) -> Vec<QueryExample> {
        Vec::new()
    }

    /// Python API documentation for this plugin's sandbox module.
    fn python_api_docs(&self) -> Option<String> {
        None
    }

    /// ClickHouse targets this plugin contributes to the proxy.
    fn clickhouse_targets(&self) -> Vec<ClickHouseTarget> {
        Vec::new()
    }

    /// Prometheus targets this plugin contributes to the proxy.
    fn prometheus_targets(&self) -> Vec<PrometheusTarget> {
        Vec::new()
    }

    /// Loki targets this plugin contributes to the proxy.
    fn loki_targets(&self) -> Vec<LokiTarget> {
        Vec::new()
    }

    /// S3 config this plugin contributes to the proxy.
    fn s3_config(&self) -> Option<S3Config> {
        None
    }

    /// Hook: receive the proxy client once it exists. Default no-op.
    fn on_proxy(&self, _client: Arc<ProxyClient>) {}

    /// Start background work. Sequential and fail-stop across the registry.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop background work. Best-effort across the registry.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Health probe.
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Unknown
    }
}

/// Build a built-in plugin from its raw YAML config section.
///
/// Unknown names are an error: a typo in the config must not silently drop
/// a datasource.
pub fn build_builtin(
    name: &str,
    raw: &serde_yaml::Value,
) -> Result<Arc<dyn Plugin>, PluginError> {
    match name {
        "clickhouse" => Ok(Arc::new(ClickHousePlugin::from_yaml(raw)?)),
        "prometheus" => Ok(Arc::new(PrometheusPlugin::from_yaml(raw)?)),
        "loki" => Ok(Arc::new(LokiPlugin::from_yaml(raw)?)),
        "storage" => Ok(Arc::new(StoragePlugin::from_yaml(raw)?)),
        other => Err(PluginError::InvalidConfig(format!(
            "unknown plugin '{other}', supported: clickhouse, prometheus, loki, storage"
        ))),
    }
}
