//! End-to-end proxy tests: a real listener, a real upstream, the full
//! middleware chain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::routing::any;
use axum::Router;
use chainscope_config::{RateLimitConfig, RateLimitRule};
use chainscope_proxy::audit::AuditorConfig;
use chainscope_proxy::handlers::ClickHouseTarget;
use chainscope_proxy::{
    Authenticator, DatasourceSummary, ProxyServer, ProxyServerConfig, TokenStore,
};

/// Serve an echo upstream that reports the path, query, and auth header it
/// saw. Returns its base URL.
async fn start_upstream() -> String {
    async fn echo(req: Request) -> String {
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        format!(
            "path={} query={} auth={auth}",
            req.uri().path(),
            req.uri().query().unwrap_or("")
        )
    }

    let app = Router::new().route("/{*rest}", any(echo)).route("/", any(echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn rate_limit(rps: f64, burst: u32, block: u64) -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        default: RateLimitRule {
            requests_per_second: rps,
            requests_per_minute: 0,
            burst_size: burst,
            block_duration: block,
        },
        ..RateLimitConfig::default()
    }
}

async fn start_proxy(
    upstream: &str,
    tokens: Arc<TokenStore>,
    rate_limit_cfg: RateLimitConfig,
) -> Arc<ProxyServer> {
    let server = Arc::new(ProxyServer::new(ProxyServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        authenticator: Authenticator::Token(tokens),
        rate_limit: rate_limit_cfg,
        audit: Some(AuditorConfig::default()),
        clickhouse: vec![ClickHouseTarget {
            name: "xatu".into(),
            url: upstream.to_string(),
            username: "reader".into(),
            password: "hunter2".into(),
            timeout_secs: 5,
            skip_verify: false,
        }],
        prometheus: Vec::new(),
        loki: Vec::new(),
        s3: None,
        metrics: None,
    }));
    server.start().await.unwrap();
    server
}

#[tokio::test]
async fn health_and_ready_are_unauthenticated() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, tokens, RateLimitConfig::default()).await;
    let base = proxy.url();

    let health = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let ready = reqwest::get(format!("{base}/ready")).await.unwrap();
    assert_eq!(ready.status(), 200);

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_the_port() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, tokens, RateLimitConfig::default()).await;
    let addr = proxy.local_addr().unwrap();

    proxy.stop(Duration::from_secs(5)).await;
    proxy.stop(Duration::from_secs(5)).await;

    // Once drained, the port can be re-bound.
    let rebound = tokio::net::TcpListener::bind(addr).await;
    assert!(rebound.is_ok(), "port still held after stop");
}

#[tokio::test]
async fn datasources_discovery_is_unauthenticated_and_credential_free() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, tokens, RateLimitConfig::default()).await;
    let base = proxy.url();

    let body = reqwest::get(format!("{base}/datasources"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let summary: DatasourceSummary = serde_json::from_str(&body).unwrap();
    assert_eq!(summary.clickhouse, vec!["xatu"]);
    assert!(summary.prometheus.is_empty());
    assert!(
        !body.contains("hunter2"),
        "credentials must never cross the discovery surface"
    );

    // Per-kind discovery.
    let names: Vec<String> = reqwest::get(format!("{base}/datasources/clickhouse"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names, vec!["xatu"]);

    let unknown = reqwest::get(format!("{base}/datasources/graphite"))
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn authenticated_request_is_forwarded_with_upstream_credentials() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, Arc::clone(&tokens), RateLimitConfig::default()).await;
    let base = proxy.url();

    let token = tokens.register("exec-1");
    let client = reqwest::Client::new();

    let body = client
        .get(format!("{base}/clickhouse/query?query=SELECT+1"))
        .bearer_auth(&token)
        .header("x-datasource", "xatu")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    // Prefix stripped, query preserved, proxy bearer replaced with the
    // upstream Basic credential.
    assert!(body.contains("path=/query"), "body: {body}");
    assert!(body.contains("query=query=SELECT+1"), "body: {body}");
    assert!(body.contains("auth=Basic "), "body: {body}");
    assert!(!body.contains(&token), "sandbox token must not reach upstream");

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn requests_without_token_are_401_with_generic_body() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, tokens, RateLimitConfig::default()).await;
    let base = proxy.url();

    let client = reqwest::Client::new();
    for request in [
        client.get(format!("{base}/clickhouse/query")),
        client
            .get(format!("{base}/clickhouse/query"))
            .bearer_auth("bogus"),
        client
            .get(format!("{base}/clickhouse/query"))
            .header("authorization", "NotBearer x"),
    ] {
        let response = request.header("x-datasource", "xatu").send().await.unwrap();
        assert_eq!(response.status(), 401);
        assert_eq!(response.text().await.unwrap(), "invalid or expired token");
    }

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn revoked_token_stops_working_immediately() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, Arc::clone(&tokens), RateLimitConfig::default()).await;
    let base = proxy.url();

    let token = tokens.register("exec-1");
    let client = reqwest::Client::new();
    let url = format!("{base}/clickhouse/ping");

    let ok = client
        .get(&url)
        .bearer_auth(&token)
        .header("x-datasource", "xatu")
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    tokens.revoke("exec-1");

    let denied = client
        .get(&url)
        .bearer_auth(&token)
        .header("x-datasource", "xatu")
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn rate_limit_burst_then_429_with_headers() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, Arc::clone(&tokens), rate_limit(2.0, 2, 60)).await;
    let base = proxy.url();

    let token = tokens.register("exec-1");
    let client = reqwest::Client::new();
    let url = format!("{base}/clickhouse/q");

    let mut statuses = Vec::new();
    let mut last = None;
    for _ in 0..3 {
        let response = client
            .get(&url)
            .bearer_auth(&token)
            .header("x-datasource", "xatu")
            .send()
            .await
            .unwrap();
        statuses.push(response.status().as_u16());
        last = Some(response);
    }

    assert_eq!(statuses, vec![200, 200, 429]);

    let denial = last.unwrap();
    assert_eq!(
        denial.headers().get("retry-after").unwrap().to_str().unwrap(),
        "60"
    );
    assert!(denial.headers().get("x-ratelimit-limit").is_some());
    assert_eq!(
        denial
            .headers()
            .get("x-ratelimit-remaining")
            .unwrap()
            .to_str()
            .unwrap(),
        "0"
    );
    assert!(denial.headers().get("x-ratelimit-reset").is_some());

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn unauthenticated_requests_do_not_consume_rate_limit() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, Arc::clone(&tokens), rate_limit(1.0, 1, 60)).await;
    let base = proxy.url();

    let client = reqwest::Client::new();
    let url = format!("{base}/clickhouse/q");

    // Auth is outermost: these must not touch the limiter.
    for _ in 0..3 {
        let response = client
            .get(&url)
            .header("x-datasource", "xatu")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    // The single burst token is still available for the authenticated call.
    let token = tokens.register("exec-1");
    let response = client
        .get(&url)
        .bearer_auth(&token)
        .header("x-datasource", "xatu")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn disabled_rate_limit_is_a_transparent_noop() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, Arc::clone(&tokens), RateLimitConfig::default()).await;
    let base = proxy.url();

    let token = tokens.register("exec-1");
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/clickhouse/q"))
        .bearer_auth(&token)
        .header("x-datasource", "xatu")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response.headers().get("x-ratelimit-limit").is_none(),
        "disabled limiter must not emit headers"
    );

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn unknown_and_missing_datasource_errors() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, Arc::clone(&tokens), RateLimitConfig::default()).await;
    let base = proxy.url();

    let token = tokens.register("exec-1");
    let client = reqwest::Client::new();
    let url = format!("{base}/clickhouse/q");

    let missing = client.get(&url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(missing.status(), 400);

    let unknown = client
        .get(&url)
        .bearer_auth(&token)
        .header("x-datasource", "mystery")
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn port_conflict_fails_fast_at_start() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = ProxyServer::new(ProxyServerConfig {
        listen_addr: addr.to_string(),
        authenticator: Authenticator::Token(tokens),
        rate_limit: RateLimitConfig::default(),
        audit: None,
        clickhouse: Vec::new(),
        prometheus: Vec::new(),
        loki: Vec::new(),
        s3: None,
        metrics: None,
    });

    let err = proxy.start().await.unwrap_err();
    assert!(err.to_string().contains("binding to"), "got: {err}");
}

#[tokio::test]
async fn embedded_client_mints_tokens_the_proxy_accepts() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, Arc::clone(&tokens), RateLimitConfig::default()).await;
    let base = proxy.url();

    let client = chainscope_proxy::ProxyClient::Embedded(
        chainscope_proxy::EmbeddedProxyClient::new(Arc::clone(&proxy)).unwrap(),
    );
    client.start().await;

    assert_eq!(client.url(), base);
    assert_eq!(client.clickhouse_datasources(), vec!["xatu"]);
    assert!(client.ensure_authenticated().is_ok());

    let token = client.register_token("exec-77");
    let http = reqwest::Client::new();
    let response = http
        .get(format!("{base}/clickhouse/q"))
        .bearer_auth(&token)
        .header("x-datasource", "xatu")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    client.revoke_token("exec-77");
    let response = http
        .get(format!("{base}/clickhouse/q"))
        .bearer_auth(&token)
        .header("x-datasource", "xatu")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    proxy.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn remote_client_discovers_datasources_over_http() {
    let upstream = start_upstream().await;
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(60)));
    let proxy = start_proxy(&upstream, tokens, RateLimitConfig::default()).await;
    let base = proxy.url();

    struct NoCredentials;
    impl chainscope_proxy::client::CredentialSource for NoCredentials {
        fn credential(&self) -> Option<chainscope_proxy::client::StoredCredential> {
            None
        }
    }

    let remote = chainscope_proxy::RemoteProxyClient::new(
        base.clone(),
        "https://idp.example.com",
        "chainscope-cli",
        Arc::new(NoCredentials),
    );
    remote.refresh_datasources().await.unwrap();

    let client = chainscope_proxy::ProxyClient::Remote(remote);
    assert_eq!(client.clickhouse_datasources(), vec!["xatu"]);

    proxy.stop(Duration::from_secs(5)).await;
}
