//! ClickHouse plugin: OLAP blockchain tables behind the proxy.

use std::collections::HashMap;

use serde::Deserialize;

use chainscope_proxy::handlers::ClickHouseTarget;

use crate::{DatasourceInfo, Plugin, PluginError, QueryExample};

/// Env var carrying the ClickHouse datasource list into the sandbox.
pub const ENV_DATASOURCES: &str = "ETHPANDAOPS_CLICKHOUSE_DATASOURCES";

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
    username: String,
    #[serde(default)]
    password: String,
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

/// The ClickHouse datasource plugin.
#[derive(Debug)]
pub struct ClickHousePlugin {
    cfg: Config,
}

impl ClickHousePlugin {
    /// Parse, default, and validate the raw config section.
    pub fn from_yaml(raw: &serde_yaml::Value) -> Result<Self, PluginError> {
        let cfg: Config = serde_yaml::from_value(raw.clone())?;

        if cfg.datasources.is_empty() {
            return Err(PluginError::NoValidConfig);
        }

        for ds in &cfg.datasources {
            if ds.name.is_empty() {
                return Err(PluginError::InvalidConfig(
                    "clickhouse datasource with empty name".to_string(),
                ));
            }
            if ds.url.is_empty() {
                return Err(PluginError::InvalidConfig(format!(
                    "clickhouse datasource '{}' has no url",
                    ds.name
                )));
            }
        }

        Ok(Self { cfg })
    }
}

#[async_trait::async_trait]
impl Plugin for ClickHousePlugin {
    fn name(&self) -> &str {
        "clickhouse"
    }

    fn sandbox_env(&self) -> HashMap<String, String> {
        let entries: Vec<serde_json::Value> = self
            .cfg
            .datasources
            .iter()
            .map(|ds| {
                // `url` is the proxy route, never the upstream address.
                serde_json::json!({
                    "name": ds.name,
                    "url": "/clickhouse",
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
                kind: "clickhouse".to_string(),
                description: ds.description.clone(),
            })
            .collect()
    }

    fn examples(&self) -> Vec<QueryExample> {
        vec![QueryExample {
            title: "Recent beacon blocks".to_string(),
            description: "Query slot and proposer for the last 10 canonical beacon blocks"
                .to_string(),
            code: r#"from chainscope import clickhouse

df = clickhouse.query(
    "xatu",
    "SELECT slot, proposer_index FROM beacon_api_eth_v2_beacon_block "
    "ORDER BY slot DESC LIMIT 10",
)
print(df)
"#
            .to_string(),
        }]
    }

    fn python_api_docs(&self) -> Option<String> {
        Some(
            "clickhouse.query(datasource: str, sql: str) -> DataFrame — run SQL \
             against a named ClickHouse datasource through the proxy."
                .to_string(),
        )
    }

    fn clickhouse_targets(&self) -> Vec<ClickHouseTarget> {
        self.cfg
            .datasources
            .iter()
            .map(|ds| ClickHouseTarget {
                name: ds.name.clone(),
                url: ds.url.clone(),
                username: ds.username.clone(),
                password: ds.password.clone(),
                timeout_secs: ds.timeout,
                skip_verify: ds.skip_verify,
            })
            .collect()
    }
}
