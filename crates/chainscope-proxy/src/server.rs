//! The proxy HTTP front door.
//!
//! Routes, middleware chain, health endpoints, and datasource discovery.
//! The middleware chain on datasource routes is strictly
//! auth → rate-limit → audit → handler: unauthenticated requests never
//! count against the limiter.
//!
//! Lifecycle is `new → start → stop`. `start` binds the listener
//! synchronously so a port conflict fails fast; serving happens on a
//! spawned task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use http::StatusCode;
use tokio_util::sync::CancellationToken;

use chainscope_config::RateLimitConfig;

use crate::audit::{datasource_from_path, Auditor, AuditorConfig};
use crate::auth::{AuthContext, Authenticator, UNAUTHORIZED_BODY};
use crate::handlers::{
    ClickHouseHandler, ClickHouseTarget, LokiHandler, LokiTarget, PrometheusHandler,
    PrometheusTarget, S3Config, S3Handler,
};
use crate::metrics::ProxyMetrics;
use crate::ratelimit::{headers as rl_headers, RateLimiter};
use crate::tokens::TokenStore;
use crate::DatasourceSummary;

/// Everything the proxy server needs at construction.
pub struct ProxyServerConfig {
    /// Listen address, e.g. `127.0.0.1:18081` (`:0` for an ephemeral port).
    pub listen_addr: String,
    /// Authentication mode, fixed for the server's lifetime.
    pub authenticator: Authenticator,
    /// Rate limiting settings.
    pub rate_limit: RateLimitConfig,
    /// Audit settings; `None` disables audit logging.
    pub audit: Option<AuditorConfig>,
    /// ClickHouse targets.
    pub clickhouse: Vec<ClickHouseTarget>,
    /// Prometheus targets.
    pub prometheus: Vec<PrometheusTarget>,
    /// Loki targets.
    pub loki: Vec<LokiTarget>,
    /// S3 target.
    pub s3: Option<S3Config>,
    /// Metrics sink; `None` disables metrics.
    pub metrics: Option<Arc<ProxyMetrics>>,
}

struct Shared {
    authenticator: Authenticator,
    rate_limiter: Arc<RateLimiter>,
    auditor: Option<Auditor>,
    metrics: Option<Arc<ProxyMetrics>>,
    clickhouse: Option<ClickHouseHandler>,
    prometheus: Option<PrometheusHandler>,
    loki: Option<LokiHandler>,
    s3: Option<S3Handler>,
    started: AtomicBool,
}

#[derive(Default)]
struct ServeState {
    local_addr: Option<SocketAddr>,
    cancel: Option<CancellationToken>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// The credential proxy server.
pub struct ProxyServer {
    listen_addr: String,
    shared: Arc<Shared>,
    state: Mutex<ServeState>,
}

impl ProxyServer {
    /// Build the server. Handlers for unconfigured kinds are absent; their
    /// routes answer 404.
    pub fn new(cfg: ProxyServerConfig) -> Self {
        let shared = Shared {
            authenticator: cfg.authenticator,
            rate_limiter: Arc::new(RateLimiter::new(cfg.rate_limit)),
            auditor: cfg.audit.map(Auditor::new),
            metrics: cfg.metrics,
            clickhouse: (!cfg.clickhouse.is_empty()).then(|| ClickHouseHandler::new(cfg.clickhouse)),
            prometheus: (!cfg.prometheus.is_empty()).then(|| PrometheusHandler::new(cfg.prometheus)),
            loki: (!cfg.loki.is_empty()).then(|| LokiHandler::new(cfg.loki)),
            s3: cfg.s3.map(S3Handler::new),
            started: AtomicBool::new(false),
        };

        Self {
            listen_addr: cfg.listen_addr,
            shared: Arc::new(shared),
            state: Mutex::new(ServeState::default()),
        }
    }

    /// Start the authenticator, bind the listener, and serve.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shared.started.load(Ordering::SeqCst) {
            anyhow::bail!("proxy already started");
        }

        self.shared.authenticator.start().await?;
        self.shared.rate_limiter.start();

        let listener = match tokio::net::TcpListener::bind(&self.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                // Don't leave the JWKS refresher running behind a dead server.
                self.shared.authenticator.stop().await;
                self.shared.rate_limiter.stop().await;
                anyhow::bail!("binding to {}: {e}", self.listen_addr);
            }
        };
        let local_addr = listener.local_addr()?;

        let app = build_router(Arc::clone(&self.shared));
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

            if let Err(err) = serve.await {
                tracing::error!(error = %err, "proxy server error");
            }
        });

        {
            let mut state = self.state.lock().expect("serve state lock poisoned");
            state.local_addr = Some(local_addr);
            state.cancel = Some(cancel);
            state.task = Some(task);
        }

        self.shared.started.store(true, Ordering::SeqCst);
        tracing::info!(addr = %local_addr, auth_mode = self.shared.authenticator.mode(), "proxy server started");
        Ok(())
    }

    /// Stop accepting, drain in-flight requests up to `deadline`, and stop
    /// the authenticator and limiter. Idempotent.
    pub async fn stop(&self, deadline: Duration) {
        self.shared.started.store(false, Ordering::SeqCst);

        let (cancel, task) = {
            let mut state = self.state.lock().expect("serve state lock poisoned");
            (state.cancel.take(), state.task.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if tokio::time::timeout(deadline, task).await.is_err() {
                tracing::warn!("proxy server did not drain before the deadline");
            }
        }

        self.shared.authenticator.stop().await;
        self.shared.rate_limiter.stop().await;
        tracing::info!("proxy server stopped");
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .expect("serve state lock poisoned")
            .local_addr
    }

    /// The base URL sandbox code should use.
    pub fn url(&self) -> String {
        match self.local_addr() {
            Some(addr) => format!("http://127.0.0.1:{}", addr.port()),
            None => {
                let port = self
                    .listen_addr
                    .rsplit(':')
                    .next()
                    .unwrap_or("18081");
                format!("http://127.0.0.1:{port}")
            }
        }
    }

    /// The token store, in token auth mode.
    pub fn token_store(&self) -> Option<Arc<TokenStore>> {
        match &self.shared.authenticator {
            Authenticator::Token(store) => Some(Arc::clone(store)),
            Authenticator::Jwt(_) => None,
        }
    }

    /// ClickHouse datasource names.
    pub fn clickhouse_datasources(&self) -> Vec<String> {
        self.shared
            .clickhouse
            .as_ref()
            .map(ClickHouseHandler::clusters)
            .unwrap_or_default()
    }

    /// Prometheus datasource names.
    pub fn prometheus_datasources(&self) -> Vec<String> {
        self.shared
            .prometheus
            .as_ref()
            .map(PrometheusHandler::instances)
            .unwrap_or_default()
    }

    /// Loki datasource names.
    pub fn loki_datasources(&self) -> Vec<String> {
        self.shared
            .loki
            .as_ref()
            .map(LokiHandler::instances)
            .unwrap_or_default()
    }

    /// The S3 bucket name, when storage is configured.
    pub fn s3_bucket(&self) -> String {
        self.shared
            .s3
            .as_ref()
            .map(|s3| s3.bucket().to_string())
            .unwrap_or_default()
    }

    /// The S3 handler, for public-URL construction.
    pub fn s3_handler(&self) -> Option<&S3Handler> {
        self.shared.s3.as_ref()
    }

    /// The discovery document served at `/datasources`.
    pub fn datasource_summary(&self) -> DatasourceSummary {
        DatasourceSummary {
            clickhouse: self.clickhouse_datasources(),
            prometheus: self.prometheus_datasources(),
            loki: self.loki_datasources(),
            s3_bucket: self.s3_bucket(),
        }
    }
}

fn build_router(shared: Arc<Shared>) -> Router {
    let mut protected: Router<Arc<Shared>> = Router::new();

    if shared.clickhouse.is_some() {
        protected = protected
            .route("/clickhouse", any(clickhouse_route))
            .route("/clickhouse/{*rest}", any(clickhouse_route));
    }
    if shared.prometheus.is_some() {
        protected = protected
            .route("/prometheus", any(prometheus_route))
            .route("/prometheus/{*rest}", any(prometheus_route));
    }
    if shared.loki.is_some() {
        protected = protected
            .route("/loki", any(loki_route))
            .route("/loki/{*rest}", any(loki_route));
    }
    if shared.s3.is_some() {
        protected = protected
            .route("/s3", any(s3_route))
            .route("/s3/{*rest}", any(s3_route));
    }

    // Layer order: the last layer added runs first, so auth is outermost.
    let protected = protected
        .layer(middleware::from_fn_with_state(
            Arc::clone(&shared),
            audit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&shared),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&shared),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/datasources", get(datasources))
        .route("/datasources/{kind}", get(datasources_by_kind))
        .merge(protected)
        .with_state(shared)
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(shared): State<Arc<Shared>>) -> Response {
    if shared.started.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn datasources(State(shared): State<Arc<Shared>>) -> Json<DatasourceSummary> {
    Json(DatasourceSummary {
        clickhouse: shared
            .clickhouse
            .as_ref()
            .map(ClickHouseHandler::clusters)
            .unwrap_or_default(),
        prometheus: shared
            .prometheus
            .as_ref()
            .map(PrometheusHandler::instances)
            .unwrap_or_default(),
        loki: shared
            .loki
            .as_ref()
            .map(LokiHandler::instances)
            .unwrap_or_default(),
        s3_bucket: shared
            .s3
            .as_ref()
            .map(|s3| s3.bucket().to_string())
            .unwrap_or_default(),
    })
}

async fn datasources_by_kind(
    State(shared): State<Arc<Shared>>,
    Path(kind): Path<String>,
) -> Response {
    let names: Option<Vec<String>> = match kind.as_str() {
        "clickhouse" => Some(
            shared
                .clickhouse
                .as_ref()
                .map(ClickHouseHandler::clusters)
                .unwrap_or_default(),
        ),
        "prometheus" => Some(
            shared
                .prometheus
                .as_ref()
                .map(PrometheusHandler::instances)
                .unwrap_or_default(),
        ),
        "loki" => Some(
            shared
                .loki
                .as_ref()
                .map(LokiHandler::instances)
                .unwrap_or_default(),
        ),
        "s3" => Some(
            shared
                .s3
                .as_ref()
                .map(|s3| vec![s3.bucket().to_string()])
                .unwrap_or_default(),
        ),
        _ => None,
    };

    match names {
        Some(names) => Json(names).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown datasource kind").into_response(),
    }
}

async fn clickhouse_route(State(shared): State<Arc<Shared>>, req: Request) -> Response {
    match &shared.clickhouse {
        Some(handler) => handler.handle(req).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn prometheus_route(State(shared): State<Arc<Shared>>, req: Request) -> Response {
    match &shared.prometheus {
        Some(handler) => handler.handle(req).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn loki_route(State(shared): State<Arc<Shared>>, req: Request) -> Response {
    match &shared.loki {
        Some(handler) => handler.handle(req).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn s3_route(State(shared): State<Arc<Shared>>, req: Request) -> Response {
    match &shared.s3 {
        Some(handler) => handler.handle(req).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Outermost middleware: authenticate and tag the request with an
/// [`AuthContext`]. Every failure is the same generic 401.
async fn auth_middleware(
    State(shared): State<Arc<Shared>>,
    mut req: Request,
    next: Next,
) -> Response {
    match shared.authenticator.authenticate(req.headers()) {
        Ok(ctx) => {
            tracing::debug!(
                user_id = %ctx.user_id,
                path = req.uri().path(),
                method = %req.method(),
                auth_mode = shared.authenticator.mode(),
                "authenticated request"
            );
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!(error = %err, path = req.uri().path(), "authentication failed");
            if let Some(metrics) = &shared.metrics {
                metrics.auth_failures_total.inc();
            }
            (StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY).into_response()
        }
    }
}

/// Rate-limit middleware. A transparent no-op when disabled by config.
async fn rate_limit_middleware(
    State(shared): State<Arc<Shared>>,
    req: Request,
    next: Next,
) -> Response {
    let limiter = &shared.rate_limiter;
    if !limiter.enabled() {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let kind = datasource_from_path(req.uri().path());
    let client_ip = limiter.client_ip(peer, req.headers());
    let rule = limiter.rule_for(kind).clone();
    let key = RateLimiter::build_key(&client_ip, kind);

    let (allowed, info) = limiter.allow(&key, &rule);

    let mut response = if allowed {
        next.run(req).await
    } else {
        tracing::debug!(client_ip = %client_ip, kind, "rate limit exceeded");
        if let Some(metrics) = &shared.metrics {
            metrics.rate_limited_total.inc();
        }
        (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response()
    };

    let headers = response.headers_mut();
    if let Ok(value) = format!("{:.2}", info.limit).parse() {
        headers.insert(rl_headers::LIMIT, value);
    }
    if let Ok(value) = info.remaining.to_string().parse() {
        headers.insert(rl_headers::REMAINING, value);
    }
    if let Ok(value) = info.reset_at.to_string().parse() {
        headers.insert(rl_headers::RESET, value);
    }
    if !allowed {
        if let Ok(value) = info.retry_after.to_string().parse() {
            headers.insert(rl_headers::RETRY_AFTER, value);
        }
    }

    response
}

/// Innermost middleware: one audit entry and one metrics sample per request.
async fn audit_middleware(State(shared): State<Arc<Shared>>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let ctx = req.extensions().get::<AuthContext>().cloned();

    let response = next.run(req).await;

    if let Some(auditor) = &shared.auditor {
        auditor.record(ctx.as_ref(), &method, &uri, response.status(), start.elapsed());
    }
    if let Some(metrics) = &shared.metrics {
        metrics.record_request(datasource_from_path(uri.path()), response.status());
    }

    response
}
