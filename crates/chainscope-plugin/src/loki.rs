//! Loki plugin: log streams behind the proxy.

use std::collections::HashMap;

use serde::Deserialize;

use chainscope_proxy::handlers::LokiTarget;

use crate::{DatasourceInfo, Plugin, PluginError, QueryExample};

/// Env var carrying the Loki datasource list into the sandbox.
pub const ENV_DATASOURCES: &str = "ETHPANDAOPS_LOKI_DATASOURCES";

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

/// The Loki datasource plugin.
pub struct LokiPlugin {
    cfg: Config,
}

impl LokiPlugin {
    /// Parse, default, and validate the raw config section.
    pub fn from_yaml(raw: &serde_yaml::Value) -> Result<Self, PluginError> {
        let cfg: Config = serde_yaml::from_value(raw.clone())?;

        if cfg.datasources.is_empty() {
            return Err(PluginError::NoValidConfig);
        }

        for ds in &cfg.datasources {
            if ds.name.is_empty() || ds.url.is_empty() {
                return Err(PluginError::InvalidConfig(format!(
                    "loki datasource '{}' needs both name and url",
                    ds.name
                )));
            }
        }

        Ok(Self { cfg })
    }
}

#[async_trait::async_trait]
impl Plugin for LokiPlugin {
    fn name(&self) -> &str {
        "loki"
    }

    fn sandbox_env(&self) -> HashMap<String, String> {
        let entries: Vec<serde_json::Value> = self
            .cfg
            .datasources
            .iter()
            .map(|ds| {
                serde_json::json!({
                    "name": ds.name,
                    "url": "/loki",
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
                kind: "loki".to_string(),
                description: ds.description.clone(),
            })
            .collect()
    }

    fn examples(&self) -> Vec<QueryExample> {
        vec![QueryExample {
            title: "Recent errors from a client".to_string(),
            description: "LogQL range query over the last hour".to_string(),
            code: r#"from chainscope import loki

lines = loki.query_range(
    "logs",
    '{app="lighthouse"} |= "ERRO"',
    since="1h",
)
for line in lines[:20]:
    print(line)
"#
            .to_string(),
        }]
    }

    fn python_api_docs(&self) -> Option<String> {
        Some(
            "loki.query_range(datasource: str, logql: str, since: str = '1h') — \
             range query returning log lines."
                .to_string(),
        )
    }

    fn loki_targets(&self) -> Vec<LokiTarget> {
        self.cfg
            .datasources
            .iter()
            .map(|ds| LokiTarget {
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
