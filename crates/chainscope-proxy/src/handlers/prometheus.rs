//! Prometheus reverse proxy.

use std::time::Duration;

use axum::extract::Request;
use axum::response::Response;

use super::{ProxyPool, TargetConfig, UpstreamAuth};

/// One Prometheus instance.
#[derive(Debug, Clone)]
pub struct PrometheusTarget {
    /// Discovery name.
    pub name: String,
    /// Base URL, e.g. `https://prom.example.com`.
    pub url: String,
    /// Basic-auth username, when the instance uses Basic auth.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Bearer token, when the instance uses token auth.
    pub bearer_token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Disable TLS verification. Explicit opt-in only.
    pub skip_verify: bool,
}

impl PrometheusTarget {
    fn auth(&self) -> UpstreamAuth {
        if let Some(token) = &self.bearer_token {
            UpstreamAuth::Bearer(token.clone())
        } else if let (Some(username), Some(password)) = (&self.username, &self.password) {
            UpstreamAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            }
        } else {
            UpstreamAuth::None
        }
    }
}

/// Reverse proxy over the configured Prometheus instances.
pub struct PrometheusHandler {
    pool: ProxyPool,
}

impl PrometheusHandler {
    /// Build a handler from instance configs.
    pub fn new(targets: Vec<PrometheusTarget>) -> Self {
        let configs = targets
            .into_iter()
            .map(|t| TargetConfig {
                auth: t.auth(),
                name: t.name,
                url: t.url,
                timeout: Duration::from_secs(t.timeout_secs.max(1)),
                skip_verify: t.skip_verify,
            })
            .collect();

        Self {
            pool: ProxyPool::new("prometheus", "/prometheus", configs),
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
    fn bearer_token_wins_over_basic() {
        let target = PrometheusTarget {
            name: "prod".into(),
            url: "http://localhost:9090".into(),
            username: Some("user".into()),
            password: Some("pw".into()),
            bearer_token: Some("tok".into()),
            timeout_secs: 30,
            skip_verify: false,
        };
        assert!(matches!(target.auth(), UpstreamAuth::Bearer(_)));
    }

    #[test]
    fn basic_requires_both_halves() {
        let target = PrometheusTarget {
            name: "prod".into(),
            url: "http://localhost:9090".into(),
            username: Some("user".into()),
            password: None,
            bearer_token: None,
            timeout_secs: 30,
            skip_verify: false,
        };
        assert!(matches!(target.auth(), UpstreamAuth::None));
    }
}
