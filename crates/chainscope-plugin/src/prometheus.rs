//! Prometheus plugin: time-series metrics behind the proxy.

use std::collections::HashMap;

use serde::Deserialize;

use chainscope_proxy::handlers::PrometheusTarget;

use crate::{DatasourceInfo, Plugin, PluginError, QueryExample};

/// Env var carrying the Prometheus datasource list into the sandbox.
pub const ENV_DATASOURCES: &str = "ETHPANDAOPS_PROMETHEUS_DATASOURCES";

#[derive(Debug, Clone, Deserialize)]
struct Config {
    #[serde(default)]
    datasources: Vec<DatasourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct DatasourceConfig {
    name: String,
    url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    bearer_token: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    skip_verify: bool,
}

fn default_timeout() -> u64 {
    60
}

/// The Prometheus datasource plugin.
pub struct PrometheusPlugin {
    cfg: Config,
}

impl PrometheusPlugin {
    /// Parse, default, and validate the raw config section.
    pub fn from_yaml(raw: &serde_yaml::Value) -> Result<Self, PluginError> {
        let cfg: Config = serde_yaml::from_value(raw.clone())?;

        if cfg.datasources.is_empty() {
            return Err(PluginError::NoValidConfig);
        }

        for ds in &cfg.datasources {
            if ds.name.is_empty() || ds.url.is_empty() {
                return Err(PluginError::InvalidConfig(format!(
                    "prometheus datasource '{}' needs both name and url",
                    ds.name
                )));
            }
        }

        Ok(Self { cfg })
    }
}

#[async_trait::async_trait]
impl Plugin for PrometheusPlugin {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn sandbox_env(&self) -> HashMap<String, String> {
        let entries: Vec<serde_json::Value> = self
            .cfg
            .datasources
            .iter()
            .map(|ds| {
                serde_json::json!({
                    "name": ds.name,
                    "url": "/prometheus",
                    "description": ds.description,
                })
            })
            .collect();

        let mut env = HashMap::new();
        env.insert(
            ENV_DATASOURCES.to_string(),
            serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string()),
        );
        env
    }

    fn datasource_info(&self) -> Vec<DatasourceInfo> {
        self.cfg
            .datasources
            .iter()
            .map(|ds| DatasourceInfo {
                name: ds.name.clone(),
                kind: "prometheus".to_string(),
                description: ds.description.clone(),
            })
            .collect()
    }

    fn examples(&self) -> Vec<QueryExample> {
        vec![QueryExample {
            title: "Current head slot".to_string(),
            description: "Instant query for the beacon head slot across nodes".to_string(),
            code: r#"from chainscope import prometheus

result = prometheus.query("metrics", "beacon_head_slot")
for series in result:
    print(series["metric"], series["value"])
"#
            .to_string(),
        }]
    }

    fn python_api_docs(&self) -> Option<String> {
        Some(
            "prometheus.query(datasource: str, promql: str, time: datetime | None = None) \
             — instant query; prometheus.query_range(...) — range query."
                .to_string(),
        )
    }

    fn prometheus_targets(&self) -> Vec<PrometheusTarget> {
        self.cfg
            .datasources
            .iter()
            .map(|ds| PrometheusTarget {
                name: ds.name.clone(),
                url: ds.url.clone(),
                username: ds.username.clone(),
                password: ds.password.clone(),
                bearer_token: ds.bearer_token.clone(),
                timeout_secs: ds.timeout,
                skip_verify: ds.skip_verify,
            })
            .collect()
    }
}
