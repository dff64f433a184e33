//! Storage plugin: S3 object storage for sandbox outputs.

use std::collections::HashMap;

use serde::Deserialize;

use chainscope_proxy::handlers::S3Config;

use crate::{DatasourceInfo, Plugin, PluginError, QueryExample};

/// Env var carrying the bucket name into the sandbox.
pub const ENV_BUCKET: &str = "ETHPANDAOPS_S3_BUCKET";
/// Env var carrying the public URL prefix into the sandbox.
pub const ENV_PUBLIC_URL_PREFIX: &str = "ETHPANDAOPS_S3_PUBLIC_URL_PREFIX";

#[derive(Debug, Clone, Deserialize)]
struct Config {
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    access_key: String,
    #[serde(default)]
    secret_key: String,
    #[serde(default)]
    bucket: String,
    #[serde(default = "default_region")]
    region: String,
    #[serde(default)]
    public_url_prefix: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_timeout() -> u64 {
    60
}

/// The S3 storage plugin.
#[derive(Debug)]
pub struct StoragePlugin {
    cfg: Config,
}

impl StoragePlugin {
    /// Parse, default, and validate the raw config section.
    pub fn from_yaml(raw: &serde_yaml::Value) -> Result<Self, PluginError> {
        let cfg: Config = serde_yaml::from_value(raw.clone())?;

        if cfg.endpoint.is_empty() {
            return Err(PluginError::NoValidConfig);
        }

        if cfg.bucket.is_empty() {
            return Err(PluginError::InvalidConfig(
                "storage.bucket is required when an endpoint is configured".to_string(),
            ));
        }
        if cfg.access_key.is_empty() || cfg.secret_key.is_empty() {
            return Err(PluginError::InvalidConfig(
                "storage.access_key and storage.secret_key are required".to_string(),
            ));
        }

        Ok(Self { cfg })
    }
}

#[async_trait::async_trait]
impl Plugin for StoragePlugin {
    fn name(&self) -> &str {
        "storage"
    }

    fn sandbox_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(ENV_BUCKET.to_string(), self.cfg.bucket.clone());
        if let Some(prefix) = &self.cfg.public_url_prefix {
            env.insert(ENV_PUBLIC_URL_PREFIX.to_string(), prefix.clone());
        }
        env
    }

    fn datasource_info(&self) -> Vec<DatasourceInfo> {
        vec![DatasourceInfo {
            name: self.cfg.bucket.clone(),
            kind: "s3".to_string(),
            description: Some("Object storage for execution outputs".to_string()),
        }]
    }

    fn examples(&self) -> Vec<QueryExample> {
        vec![QueryExample {
            title: "Upload a plot".to_string(),
            description: "Write a file to the workspace and publish it".to_string(),
            code: r#"from chainscope import storage

with open("plot.png", "rb") as f:
    url = storage.upload("plots/head_slot.png", f.read())
print(url)
"#
            .to_string(),
        }]
    }

    fn python_api_docs(&self) -> Option<String> {
        Some(
            "storage.upload(key: str, data: bytes) -> str — upload through the \
             proxy and return the public URL."
                .to_string(),
        )
    }

    fn s3_config(&self) -> Option<S3Config> {
        Some(S3Config {
            endpoint: self.cfg.endpoint.clone(),
            access_key: self.cfg.access_key.clone(),
            secret_key: self.cfg.secret_key.clone(),
            bucket: self.cfg.bucket.clone(),
            region: self.cfg.region.clone(),
            public_url_prefix: self.cfg.public_url_prefix.clone(),
            timeout_secs: self.cfg.timeout,
        })
    }
}
