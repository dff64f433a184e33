//! Loki reverse proxy. Same shape as Prometheus with a different prefix.

use std::time::Duration;

use axum::extract::Request;
use axum::response::Response;

use super::{ProxyPool, TargetConfig, UpstreamAuth};

/// One Loki instance.
#[derive(Debug, Clone)]
pub struct LokiTarget {
    /// Discovery name.
    pub name: String,
    /// Base URL.
    pub url: String,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Bearer token.
    pub bearer_token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Disable TLS verification. Explicit opt-in only.
    pub skip_verify: bool,
}

/// Reverse proxy over the configured Loki instances.
pub struct LokiHandler {
    pool: ProxyPool,
}

impl LokiHandler {
    /// Build a handler from instance configs.
    pub fn new(targets: Vec<LokiTarget>) -> Self {
        let configs = targets
            .into_iter()
            .map(|t| {
                let auth = if let Some(token) = t.bearer_token {
                    UpstreamAuth::Bearer(token)
                } else if let (Some(username), Some(password)) = (t.username, t.password) {
                    UpstreamAuth::Basic { username, password }
                } else {
                    UpstreamAuth::None
                };

                TargetConfig {
                    name: t.name,
                    url: t.url,
                    auth,
                    timeout: Duration::from_secs(t.timeout_secs.max(1)),
                    skip_verify: t.skip_verify,
                }
            })
            .collect();

        Self {
            pool: ProxyPool::new("loki", "/loki", configs),
        }
    }

    /// Configured instance names.
    pub fn instances(&self) -> Vec<String> {
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
    fn instances_reports_configured_names() {
        let handler = LokiHandler::new(vec![LokiTarget {
            name: "logs".into(),
            url: "http://localhost:3100".into(),
            username: None,
            password: None,
            bearer_token: None,
            timeout_secs: 30,
            skip_verify: false,
        }]);
        assert_eq!(handler.instances(), vec!["logs"]);
    }
}
