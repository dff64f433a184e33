//! ClickHouse reverse proxy.
//!
//! SQL-over-HTTP: the query travels as the request body or the `query`
//! parameter, both forwarded verbatim. Upstream auth is always Basic.

use std::time::Duration;

use axum::extract::Request;
use axum::response::Response;

use super::{ProxyPool, TargetConfig, UpstreamAuth};

/// One ClickHouse cluster.
#[derive(Debug, Clone)]
pub struct ClickHouseTarget {
    /// Discovery name.
    pub name: String,
    /// Base URL of the HTTP interface, e.g. `https://ch.example.com:8443`.
    pub url: String,
    /// Upstream username.
    pub username: String,
    /// Upstream password.
    pub password: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Disable TLS verification. Explicit opt-in only.
    pub skip_verify: bool,
}

/// Reverse proxy over the configured ClickHouse clusters.
pub struct ClickHouseHandler {
    pool: ProxyPool,
}

impl ClickHouseHandler {
    /// Build a handler from cluster configs.
    pub fn new(targets: Vec<ClickHouseTarget>) -> Self {
        let configs = targets
            .into_iter()
            .map(|t| TargetConfig {
                name: t.name,
                url: t.url,
                auth: UpstreamAuth::Basic {
                    username: t.username,
                    password: t.password,
                },
                timeout: Duration::from_secs(t.timeout_secs.max(1)),
                skip_verify: t.skip_verify,
            })
            .collect();

        Self {
            pool: ProxyPool::new("clickhouse", "/clickhouse", configs),
        }
    }

    /// Configured cluster names.
    pub fn clusters(&self) -> Vec<String> {
        self.pool.names()
    }

    /// Forward one request.
    pub async fn handle(&self, req: Request) -> Response {
        self.pool.forward(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clusters_reports_configured_names() {
        let handler = ClickHouseHandler::new(vec![
            ClickHouseTarget {
                name: "xatu".into(),
                url: "http://localhost:8123".into(),
                username: "reader".into(),
                password: "pw".into(),
                timeout_secs: 30,
                skip_verify: false,
            },
            ClickHouseTarget {
                name: "mainnet".into(),
                url: "http://localhost:8124".into(),
                username: "reader".into(),
                password: "pw".into(),
                timeout_secs: 30,
                skip_verify: false,
            },
        ]);

        assert_eq!(handler.clusters(), vec!["mainnet", "xatu"]);
    }

    #[test]
    fn empty_config_is_valid() {
        let handler = ClickHouseHandler::new(Vec::new());
        assert!(handler.clusters().is_empty());
    }
}
