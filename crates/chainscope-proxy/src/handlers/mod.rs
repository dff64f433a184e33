//! Reverse-proxy handlers, one per datasource kind.
//!
//! The caller selects a datasource with the `X-Datasource` header rather
//! than a path segment, so sandbox code stays free of routing details. The
//! handler strips its kind prefix, forwards body and query string verbatim
//! (streamed, never buffered), injects the upstream credential, and relays
//! the upstream response — including upstream 4xx/5xx — untouched.

mod clickhouse;
mod loki;
mod prometheus;
mod s3;

pub use clickhouse::{ClickHouseHandler, ClickHouseTarget};
pub use loki::{LokiHandler, LokiTarget};
pub use prometheus::{PrometheusHandler, PrometheusTarget};
pub use s3::{S3Config, S3Handler};

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http::StatusCode;

/// Header used to select the datasource by name.
pub const DATASOURCE_HEADER: &str = "x-datasource";

/// Credential material injected into upstream requests.
#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    /// No credential.
    None,
    /// HTTP Basic auth.
    Basic {
        /// Upstream username.
        username: String,
        /// Upstream password.
        password: String,
    },
    /// Bearer token.
    Bearer(String),
}

/// A single named upstream target.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Discovery name.
    pub name: String,
    /// Target base URL, scheme included.
    pub url: String,
    /// Credential to inject.
    pub auth: UpstreamAuth,
    /// Per-target request timeout.
    pub timeout: Duration,
    /// Disable TLS verification. Explicit opt-in only.
    pub skip_verify: bool,
}

struct Target {
    /// Normalized base URL. `None` when the configured URL failed to parse —
    /// such a target answers 500 on use instead of crashing the process at
    /// startup.
    base: Option<String>,
    auth: UpstreamAuth,
    client: reqwest::Client,
}

/// Shared per-kind reverse proxy: a map from datasource name to target.
pub struct ProxyPool {
    kind: &'static str,
    prefix: &'static str,
    targets: HashMap<String, Target>,
}

impl ProxyPool {
    pub(crate) fn new(kind: &'static str, prefix: &'static str, configs: Vec<TargetConfig>) -> Self {
        let mut targets = HashMap::with_capacity(configs.len());

        for cfg in configs {
            let base = match reqwest::Url::parse(&cfg.url) {
                Ok(url) => Some(url.to_string().trim_end_matches('/').to_string()),
                Err(err) => {
                    tracing::error!(
                        kind,
                        datasource = %cfg.name,
                        url = %cfg.url,
                        error = %err,
                        "datasource URL failed to parse; target marked unconfigured"
                    );
                    None
                }
            };

            let client = reqwest::Client::builder()
                .timeout(cfg.timeout)
                .danger_accept_invalid_certs(cfg.skip_verify)
                .build()
                .expect("reqwest client construction cannot fail with static options");

            targets.insert(
                cfg.name.clone(),
                Target {
                    base,
                    auth: cfg.auth,
                    client,
                },
            );
        }

        Self {
            kind,
            prefix,
            targets,
        }
    }

    /// Configured datasource names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Forward one request to the selected upstream.
    pub async fn forward(&self, req: Request) -> Response {
        let datasource = match req
            .headers()
            .get(DATASOURCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            Some(name) => name.to_string(),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "missing X-Datasource header",
                )
            }
        };

        let Some(target) = self.targets.get(&datasource) else {
            return error_response(StatusCode::NOT_FOUND, "unknown datasource");
        };

        let Some(base) = &target.base else {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "datasource misconfigured");
        };

        let path = req.uri().path();
        let stripped = path.strip_prefix(self.prefix).unwrap_or(path);
        let mut url = format!("{base}{stripped}");
        if let Some(query) = req.uri().query() {
            url.push('?');
            url.push_str(query);
        }

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        scrub_request_headers(&mut headers);

        let mut builder = target
            .client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));

        builder = match &target.auth {
            UpstreamAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            UpstreamAuth::Bearer(token) => builder.bearer_auth(token),
            UpstreamAuth::None => builder,
        };

        match builder.send().await {
            Ok(upstream) => relay_response(upstream),
            Err(err) => {
                tracing::warn!(
                    kind = self.kind,
                    datasource = %datasource,
                    error = %err,
                    "upstream request failed"
                );
                error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        }
    }
}

/// Build an axum response that streams the upstream body through.
pub(crate) fn relay_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    scrub_response_headers(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .expect("static response construction cannot fail")
}

/// Strip the inbound proxy credential, routing headers, and hop-by-hop
/// headers before forwarding.
pub(crate) fn scrub_request_headers(headers: &mut http::HeaderMap) {
    for name in [
        "authorization",
        DATASOURCE_HEADER,
        "host",
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "content-length",
    ] {
        headers.remove(name);
    }
}

fn scrub_response_headers(headers: &mut http::HeaderMap) {
    for name in ["connection", "transfer-encoding", "content-length"] {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ProxyPool {
        ProxyPool::new(
            "clickhouse",
            "/clickhouse",
            vec![
                TargetConfig {
                    name: "good".into(),
                    url: "http://127.0.0.1:9".into(),
                    auth: UpstreamAuth::None,
                    timeout: Duration::from_millis(200),
                    skip_verify: false,
                },
                TargetConfig {
                    name: "broken".into(),
                    url: "not a url".into(),
                    auth: UpstreamAuth::None,
                    timeout: Duration::from_millis(200),
                    skip_verify: false,
                },
            ],
        )
    }

    fn request(datasource: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/clickhouse/").method("GET");
        if let Some(ds) = datasource {
            builder = builder.header(DATASOURCE_HEADER, ds);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn missing_datasource_header_is_400() {
        let response = pool().forward(request(None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_datasource_is_404() {
        let response = pool().forward(request(Some("nope"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn misconfigured_target_is_500_not_a_crash() {
        let response = pool().forward(request(Some("broken"))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_502() {
        // Port 9 (discard) refuses connections.
        let response = pool().forward(request(Some("good"))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(pool().names(), vec!["broken", "good"]);
    }

    #[test]
    fn request_scrub_removes_credential_and_routing_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "Bearer sandbox-token".parse().unwrap());
        headers.insert("x-datasource", "xatu".parse().unwrap());
        headers.insert("host", "proxy.local".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());

        scrub_request_headers(&mut headers);

        assert!(headers.get("authorization").is_none());
        assert!(headers.get("x-datasource").is_none());
        assert!(headers.get("host").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }
}
