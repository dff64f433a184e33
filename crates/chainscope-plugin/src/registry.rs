//! The plugin registry: ordered init, aggregated contributions, lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chainscope_proxy::handlers::{ClickHouseTarget, LokiTarget, PrometheusTarget, S3Config};
use chainscope_proxy::ProxyClient;

use crate::{DatasourceInfo, HealthStatus, Plugin, PluginError, QueryExample};

/// Aggregated health across plugins.
#[derive(Debug, Default)]
pub struct HealthReport {
    /// Plugins whose backing services answered.
    pub healthy: Vec<String>,
    /// Plugins that reported a failure, with the reason.
    pub unhealthy: Vec<(String, String)>,
    /// Plugins without a health check.
    pub unknown: Vec<String>,
}

/// Ordered collection of initialized plugins.
#[derive(Default)]
pub struct PluginRegistry {
    initialized: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already-constructed plugin.
    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        self.initialized.push(plugin);
    }

    /// Initialize a built-in plugin from its raw YAML config section.
    ///
    /// A plugin whose validator reports [`PluginError::NoValidConfig`] is
    /// disabled: accepted without error and not appended.
    pub fn init_plugin(&mut self, name: &str, raw: &serde_yaml::Value) -> Result<(), PluginError> {
        match crate::build_builtin(name, raw) {
            Ok(plugin) => {
                tracing::info!(plugin = name, "plugin initialized");
                self.initialized.push(plugin);
                Ok(())
            }
            Err(PluginError::NoValidConfig) => {
                tracing::info!(plugin = name, "plugin disabled (no valid config)");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Initialize every configured plugin, in key order.
    pub fn init_all(
        &mut self,
        plugins: &BTreeMap<String, serde_yaml::Value>,
    ) -> Result<(), PluginError> {
        for (name, raw) in plugins {
            self.init_plugin(name, raw)?;
        }
        Ok(())
    }

    /// Initialized plugin names, in order.
    pub fn names(&self) -> Vec<&str> {
        self.initialized.iter().map(|p| p.name()).collect()
    }

    /// Number of initialized plugins.
    pub fn len(&self) -> usize {
        self.initialized.len()
    }

    /// Whether no plugin is initialized.
    pub fn is_empty(&self) -> bool {
        self.initialized.is_empty()
    }

    /// Hand the proxy client to every plugin that wants it.
    pub fn wire_proxy(&self, client: &Arc<ProxyClient>) {
        for plugin in &self.initialized {
            plugin.on_proxy(Arc::clone(client));
        }
    }

    /// Start plugins sequentially; the first failure stops the sequence.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        for plugin in &self.initialized {
            plugin
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("starting plugin '{}': {e}", plugin.name()))?;
            tracing::debug!(plugin = plugin.name(), "plugin started");
        }
        Ok(())
    }

    /// Stop plugins in reverse order, best-effort; errors are logged.
    pub async fn stop_all(&self) {
        for plugin in self.initialized.iter().rev() {
            if let Err(err) = plugin.stop().await {
                tracing::warn!(plugin = plugin.name(), error = %err, "plugin stop failed");
            }
        }
    }

    /// Merged sandbox environment. On key collision the later plugin wins
    /// and a warning is logged.
    pub fn sandbox_env(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for plugin in &self.initialized {
            for (key, value) in plugin.sandbox_env() {
                if merged.contains_key(&key) {
                    tracing::warn!(
                        plugin = plugin.name(),
                        key = %key,
                        "sandbox env collision; later plugin wins"
                    );
                }
                merged.insert(key, value);
            }
        }
        merged
    }

    /// All datasource metadata.
    pub fn datasource_info(&self) -> Vec<DatasourceInfo> {
        self.initialized
            .iter()
            .flat_map(|p| p.datasource_info())
            .collect()
    }

    /// All query examples.
    pub fn examples(&self) -> Vec<QueryExample> {
        self.initialized.iter().flat_map(|p| p.examples()).collect()
    }

    /// Python API docs, one section per plugin that provides them.
    pub fn python_api_docs(&self) -> Vec<(String, String)> {
        self.initialized
            .iter()
            .filter_map(|p| p.python_api_docs().map(|docs| (p.name().to_string(), docs)))
            .collect()
    }

    /// All ClickHouse targets for the proxy.
    pub fn clickhouse_targets(&self) -> Vec<ClickHouseTarget> {
        self.initialized
            .iter()
            .flat_map(|p| p.clickhouse_targets())
            .collect()
    }

    /// All Prometheus targets for the proxy.
    pub fn prometheus_targets(&self) -> Vec<PrometheusTarget> {
        self.initialized
            .iter()
            .flat_map(|p| p.prometheus_targets())
            .collect()
    }

    /// All Loki targets for the proxy.
    pub fn loki_targets(&self) -> Vec<LokiTarget> {
        self.initialized
            .iter()
            .flat_map(|p| p.loki_targets())
            .collect()
    }

    /// The S3 config for the proxy. First plugin providing one wins.
    pub fn s3_config(&self) -> Option<S3Config> {
        self.initialized.iter().find_map(|p| p.s3_config())
    }

    /// Fan out health checks and aggregate.
    pub async fn health_checks(&self) -> HealthReport {
        let mut report = HealthReport::default();
        for plugin in &self.initialized {
            match plugin.health_check().await {
                HealthStatus::Healthy => report.healthy.push(plugin.name().to_string()),
                HealthStatus::Unhealthy(reason) => {
                    report.unhealthy.push((plugin.name().to_string(), reason))
                }
                HealthStatus::Unknown => report.unknown.push(plugin.name().to_string()),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakePlugin {
        name: &'static str,
        env: HashMap<String, String>,
        health: HealthStatus,
        fail_start: bool,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl FakePlugin {
        fn new(name: &'static str, events: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                env: HashMap::new(),
                health: HealthStatus::Unknown,
                fail_start: false,
                events,
            }
        }

        fn with_env(mut self, key: &str, value: &str) -> Self {
            self.env.insert(key.to_string(), value.to_string());
            self
        }
    }

    #[async_trait::async_trait]
    impl Plugin for FakePlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn sandbox_env(&self) -> HashMap<String, String> {
            self.env.clone()
        }

        fn datasource_info(&self) -> Vec<DatasourceInfo> {
            Vec::new()
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail_start {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            self.health.clone()
        }
    }

    #[tokio::test]
    async fn start_is_sequential_and_stop_is_reverse() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(FakePlugin::new("a", Arc::clone(&events))));
        registry.add(Arc::new(FakePlugin::new("b", Arc::clone(&events))));

        registry.start_all().await.unwrap();
        registry.stop_all().await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["start:a", "start:b", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn start_failure_stops_the_sequence() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(FakePlugin::new("a", Arc::clone(&events))));
        let mut failing = FakePlugin::new("b", Arc::clone(&events));
        failing.fail_start = true;
        registry.add(Arc::new(failing));
        registry.add(Arc::new(FakePlugin::new("c", Arc::clone(&events))));

        let err = registry.start_all().await.unwrap_err();
        assert!(err.to_string().contains("'b'"));
        assert_eq!(*events.lock().unwrap(), vec!["start:a", "start:b"]);
    }

    #[test]
    fn env_merge_later_plugin_wins() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(
            FakePlugin::new("first", Arc::clone(&events)).with_env("SHARED", "one"),
        ));
        registry.add(Arc::new(
            FakePlugin::new("second", Arc::clone(&events)).with_env("SHARED", "two"),
        ));

        let env = registry.sandbox_env();
        assert_eq!(env.get("SHARED").unwrap(), "two");
    }

    #[tokio::test]
    async fn health_aggregation_buckets_by_status() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();

        let mut healthy = FakePlugin::new("up", Arc::clone(&events));
        healthy.health = HealthStatus::Healthy;
        registry.add(Arc::new(healthy));

        let mut down = FakePlugin::new("down", Arc::clone(&events));
        down.health = HealthStatus::Unhealthy("connection refused".into());
        registry.add(Arc::new(down));

        registry.add(Arc::new(FakePlugin::new("silent", Arc::clone(&events))));

        let report = registry.health_checks().await;
        assert_eq!(report.healthy, vec!["up"]);
        assert_eq!(report.unhealthy, vec![("down".to_string(), "connection refused".to_string())]);
        assert_eq!(report.unknown, vec!["silent"]);
    }

    #[test]
    fn init_plugin_accepts_disabled_plugins_without_appending() {
        let mut registry = PluginRegistry::new();
        // Empty clickhouse section → NoValidConfig → disabled, not an error.
        registry
            .init_plugin("clickhouse", &serde_yaml::from_str("{}").unwrap())
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn init_plugin_rejects_unknown_names() {
        let mut registry = PluginRegistry::new();
        let err = registry
            .init_plugin("graphite", &serde_yaml::from_str("{}").unwrap())
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidConfig(_)));
    }

    #[test]
    fn init_all_builds_targets_from_config() {
        let mut plugins = BTreeMap::new();
        plugins.insert(
            "clickhouse".to_string(),
            serde_yaml::from_str(
                r#"
datasources:
  - name: xatu
    url: https://ch.example.com
    username: reader
    password: pw
"#,
            )
            .unwrap(),
        );
        plugins.insert(
            "storage".to_string(),
            serde_yaml::from_str(
                r#"
endpoint: http://minio:9000
access_key: ak
secret_key: sk
bucket: outputs
"#,
            )
            .unwrap(),
        );

        let mut registry = PluginRegistry::new();
        registry.init_all(&plugins).unwrap();

        assert_eq!(registry.names(), vec!["clickhouse", "storage"]);
        assert_eq!(registry.clickhouse_targets().len(), 1);
        assert_eq!(registry.s3_config().unwrap().bucket, "outputs");
        assert_eq!(registry.datasource_info().len(), 2);
    }

    /// Property 8 (golden test): feed credentials into every plugin and
    /// assert none of them reappear in the merged sandbox environment.
    #[test]
    fn sandbox_env_never_contains_plugin_credentials() {
        let secrets = [
            "ch-password-1",
            "prom-bearer-2",
            "loki-password-3",
            "s3-secret-4",
            "s3-access-5",
        ];

        let mut plugins = BTreeMap::new();
        plugins.insert(
            "clickhouse".to_string(),
            serde_yaml::from_str(&format!(
                "datasources:\n  - name: xatu\n    url: https://ch\n    username: u\n    password: {}\n",
                secrets[0]
            ))
            .unwrap(),
        );
        plugins.insert(
            "prometheus".to_string(),
            serde_yaml::from_str(&format!(
                "datasources:\n  - name: metrics\n    url: https://prom\n    bearer_token: {}\n",
                secrets[1]
            ))
            .unwrap(),
        );
        plugins.insert(
            "loki".to_string(),
            serde_yaml::from_str(&format!(
                "datasources:\n  - name: logs\n    url: https://loki\n    username: u\n    password: {}\n",
                secrets[2]
            ))
            .unwrap(),
        );
        plugins.insert(
            "storage".to_string(),
            serde_yaml::from_str(&format!(
                "endpoint: http://minio:9000\naccess_key: {}\nsecret_key: {}\nbucket: outputs\n",
                secrets[4], secrets[3]
            ))
            .unwrap(),
        );

        let mut registry = PluginRegistry::new();
        registry.init_all(&plugins).unwrap();
        assert_eq!(registry.len(), 4);

        let env = registry.sandbox_env();
        assert!(!env.is_empty());
        for (key, value) in &env {
            for secret in &secrets {
                assert!(
                    !value.contains(secret),
                    "credential {secret:?} leaked into sandbox env key {key:?}"
                );
            }
        }
    }

    #[test]
    fn wire_proxy_reaches_every_plugin() {
        struct CountingPlugin(AtomicUsize);

        #[async_trait::async_trait]
        impl Plugin for CountingPlugin {
            fn name(&self) -> &str {
                "counting"
            }
            fn sandbox_env(&self) -> HashMap<String, String> {
                HashMap::new()
            }
            fn datasource_info(&self) -> Vec<DatasourceInfo> {
                Vec::new()
            }
            fn on_proxy(&self, _client: Arc<ProxyClient>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let plugin = Arc::new(CountingPlugin(AtomicUsize::new(0)));
        let mut registry = PluginRegistry::new();
        registry.add(Arc::clone(&plugin) as Arc<dyn Plugin>);

        struct NoCredentials;
        impl chainscope_proxy::client::CredentialSource for NoCredentials {
            fn credential(&self) -> Option<chainscope_proxy::client::StoredCredential> {
                None
            }
        }

        let client = Arc::new(ProxyClient::Remote(
            chainscope_proxy::RemoteProxyClient::new(
                "http://localhost:1",
                "http://idp",
                "cli",
                Arc::new(NoCredentials),
            ),
        ));
        registry.wire_proxy(&client);
        assert_eq!(plugin.0.load(Ordering::SeqCst), 1);
    }
}
