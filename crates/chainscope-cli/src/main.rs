#![warn(missing_docs)]

//! chainscope — MCP server for Ethereum observability data.
//!
//! Lets AI assistants query ClickHouse, Prometheus, Loki, and S3 by running
//! Python in ephemeral sandboxes. Credentials never enter the sandbox; every
//! query goes through the credential proxy with a per-execution token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chainscope_config::Config;
use chainscope_plugin::PluginRegistry;
use chainscope_proxy::audit::AuditorConfig;
use chainscope_proxy::client::{CredentialSource, StoredCredential};
use chainscope_proxy::handlers::S3Config;
use chainscope_proxy::{
    Authenticator, EmbeddedProxyClient, JwtValidator, ProxyClient, ProxyServer,
    ProxyServerConfig, RemoteProxyClient, TokenStore,
};
use chainscope_proxy::metrics::ProxyMetrics;
use chainscope_sandbox::{ExecuteRequest, SandboxExecutor};
use chainscope_server::{ChainscopeServer, ExecutionIssuer, ServerMetrics};
use prometheus_client::registry::Registry;

#[derive(Parser)]
#[command(name = "chainscope", version, about = "MCP server for Ethereum observability")]
struct Cli {
    /// Config file path. Falls back to $CHAINSCOPE_CONFIG, then
    /// ./chainscope.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server over stdio (with the embedded credential proxy).
    Serve,
    /// Run the standalone credential proxy (JWT auth, for K8s deployment).
    Proxy,
    /// Execute a Python file once and exit with the child's exit code.
    Exec {
        /// Path to the Python file, or `-` for stdin.
        file: String,
        /// Execution timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Session id to reuse.
        #[arg(long)]
        session: Option<String>,
    },
    /// Print the configured datasources as JSON.
    Datasources,
}

/// Stand-in credential source for remote proxy mode. The OAuth PKCE login
/// flow stores tokens outside this binary; this picks them up from the
/// environment.
struct EnvCredentialSource;

impl CredentialSource for EnvCredentialSource {
    fn credential(&self) -> Option<StoredCredential> {
        std::env::var("CHAINSCOPE_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(|access_token| StoredCredential {
                access_token,
                expires_at: None,
            })
    }
}

/// Everything `serve`/`exec` need, wired.
///
/// Metrics are explicitly constructed registries passed to components at
/// startup; nothing is ambient.
struct Runtime {
    proxy_server: Option<Arc<ProxyServer>>,
    registry: Arc<PluginRegistry>,
    executor: Arc<SandboxExecutor>,
    issuer: Arc<ExecutionIssuer>,
    server_metrics: Arc<ServerMetrics>,
    metrics_task: Option<tokio::task::JoinHandle<()>>,
}

impl Runtime {
    async fn shutdown(&self) {
        self.registry.stop_all().await;
        self.executor.stop().await;
        if let Some(proxy) = &self.proxy_server {
            proxy.stop(Duration::from_secs(10)).await;
        }
        if let Some(task) = &self.metrics_task {
            task.abort();
        }
    }
}

/// Serve `GET /metrics` in Prometheus text format.
async fn spawn_metrics_listener(
    addr: &str,
    registry: Arc<Registry>,
) -> Result<tokio::task::JoinHandle<()>> {
    use axum::routing::get;

    let app = axum::Router::new().route(
        "/metrics",
        get(move || {
            let registry = Arc::clone(&registry);
            async move {
                let mut body = String::new();
                match prometheus_client::encoding::text::encode(&mut body, &registry) {
                    Ok(()) => (http::StatusCode::OK, body),
                    Err(_) => (
                        http::StatusCode::INTERNAL_SERVER_ERROR,
                        "encoding failed".to_string(),
                    ),
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics listener to {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");

    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "metrics listener error");
        }
    }))
}

fn find_config_file(flag: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path);
    }

    if let Ok(path) = std::env::var("CHAINSCOPE_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let cwd = PathBuf::from("chainscope.yaml");
    cwd.exists().then_some(cwd)
}

fn load_config(flag: Option<PathBuf>) -> Result<Config> {
    match find_config_file(flag) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            Config::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(Config::default())
        }
    }
}

/// The proxy S3 target: the storage plugin's contribution wins, then the
/// top-level storage section.
fn s3_config(registry: &PluginRegistry, config: &Config) -> Option<S3Config> {
    registry.s3_config().or_else(|| {
        config.storage.as_ref().map(|s| S3Config {
            endpoint: s.endpoint.clone(),
            access_key: s.access_key.clone(),
            secret_key: s.secret_key.clone(),
            bucket: s.bucket.clone(),
            region: s.region.clone(),
            public_url_prefix: s.public_url_prefix.clone(),
            timeout_secs: 60,
        })
    })
}

/// Wire the registry, proxy, client, executor, and issuer per the config.
async fn build_runtime(config: &Config) -> Result<Runtime> {
    let mut registry = PluginRegistry::new();
    registry
        .init_all(&config.plugins)
        .context("initializing plugins")?;
    let registry = Arc::new(registry);

    let mut metrics_registry = Registry::default();
    let proxy_metrics = Arc::new(ProxyMetrics::new(&mut metrics_registry));
    let server_metrics = Arc::new(ServerMetrics::new(&mut metrics_registry));

    let (proxy_server, client) = match config.proxy.mode.as_str() {
        "remote" => {
            let url = config
                .proxy
                .url
                .clone()
                .context("proxy.url is required in remote mode")?;
            let (issuer_url, client_id) = config
                .proxy
                .auth
                .as_ref()
                .map(|a| (a.issuer_url.clone(), a.client_id.clone()))
                .unwrap_or_default();

            let remote = RemoteProxyClient::new(url, issuer_url, client_id, Arc::new(EnvCredentialSource));
            (None, ProxyClient::Remote(remote))
        }
        _ => {
            let tokens = Arc::new(TokenStore::new(Duration::from_secs(config.proxy.token_ttl)));
            let server = Arc::new(ProxyServer::new(ProxyServerConfig {
                listen_addr: config.proxy.listen_addr.clone(),
                authenticator: Authenticator::Token(tokens),
                rate_limit: config.rate_limit.clone(),
                audit: Some(AuditorConfig::default()),
                clickhouse: registry.clickhouse_targets(),
                prometheus: registry.prometheus_targets(),
                loki: registry.loki_targets(),
                s3: s3_config(&registry, config),
                metrics: Some(Arc::clone(&proxy_metrics)),
            }));

            server.start().await.context("starting embedded proxy")?;

            let embedded = EmbeddedProxyClient::new(Arc::clone(&server))
                .context("wiring embedded proxy client")?;
            (Some(server), ProxyClient::Embedded(embedded))
        }
    };

    let client = Arc::new(client);
    client.ensure_authenticated()?;
    client.start().await;
    registry.wire_proxy(&client);

    registry.start_all().await.context("starting plugins")?;

    let executor = Arc::new(
        SandboxExecutor::from_config(&config.sandbox).context("building sandbox executor")?,
    );
    executor.start();

    let issuer = Arc::new(ExecutionIssuer::new(client, Arc::clone(&registry)));

    let metrics_task = if config.observability.metrics_enabled {
        Some(spawn_metrics_listener(&config.observability.metrics_addr, Arc::new(metrics_registry)).await?)
    } else {
        None
    };

    Ok(Runtime {
        proxy_server,
        registry,
        executor,
        issuer,
        server_metrics,
        metrics_task,
    })
}

async fn run_serve(config: Config) -> Result<()> {
    let runtime = build_runtime(&config).await?;

    let server = ChainscopeServer::new(
        Arc::clone(&runtime.executor),
        Arc::clone(&runtime.issuer),
        config.sandbox.timeout,
    )
    .with_metrics(Arc::clone(&runtime.server_metrics));

    tracing::info!(
        backend = runtime.executor.backend_name(),
        plugins = runtime.registry.len(),
        "chainscope MCP server starting"
    );

    // Serve over stdio (standard MCP transport)
    use rmcp::ServiceExt;
    let service = server.serve(rmcp::transport::io::stdio()).await?;

    // Wait for either normal shutdown or ctrl-c
    tokio::select! {
        result = service.waiting() => { result?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, stopping gracefully");
        }
    }

    runtime.shutdown().await;
    Ok(())
}

async fn run_proxy(config: Config) -> Result<()> {
    let jwt_cfg = config
        .proxy
        .jwt
        .clone()
        .context("proxy.jwt is required for the standalone proxy")?;

    let mut registry = PluginRegistry::new();
    registry
        .init_all(&config.plugins)
        .context("initializing plugins")?;

    let mut metrics_registry = Registry::default();
    let proxy_metrics = Arc::new(ProxyMetrics::new(&mut metrics_registry));

    let validator = Arc::new(JwtValidator::new(jwt_cfg));
    let server = ProxyServer::new(ProxyServerConfig {
        listen_addr: config.proxy.listen_addr.clone(),
        authenticator: Authenticator::Jwt(validator),
        rate_limit: config.rate_limit.clone(),
        audit: Some(AuditorConfig::default()),
        clickhouse: registry.clickhouse_targets(),
        prometheus: registry.prometheus_targets(),
        loki: registry.loki_targets(),
        s3: s3_config(&registry, &config),
        metrics: Some(proxy_metrics),
    });

    server.start().await.context("starting standalone proxy")?;
    tracing::info!(url = %server.url(), "standalone proxy running; ctrl-c to stop");

    let metrics_task = if config.observability.metrics_enabled {
        Some(spawn_metrics_listener(&config.observability.metrics_addr, Arc::new(metrics_registry)).await?)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    server.stop(Duration::from_secs(10)).await;
    if let Some(task) = metrics_task {
        task.abort();
    }
    Ok(())
}

async fn run_exec(
    config: Config,
    file: String,
    timeout: Option<u64>,
    session: Option<String>,
) -> Result<i32> {
    let code = if file == "-" {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("reading {file}"))?
    };

    let runtime = build_runtime(&config).await?;

    let execution_id = format!("exec-cli-{}", chrono::Utc::now().timestamp_millis());
    let env = runtime.issuer.sandbox_env(&execution_id);

    let result = runtime
        .executor
        .execute(
            ExecuteRequest {
                execution_id: execution_id.clone(),
                code,
                env,
                timeout: Duration::from_secs(timeout.unwrap_or(config.sandbox.timeout)),
                session_id: session.unwrap_or_default(),
                owner_id: "local".to_string(),
            },
            CancellationToken::new(),
        )
        .await;

    runtime.issuer.revoke(&execution_id);

    let exit_code = match result {
        Ok(result) => {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            result.exit_code
        }
        Err(err) => {
            eprintln!("execution error: {err}");
            1
        }
    };

    runtime.shutdown().await;
    Ok(exit_code)
}

async fn run_datasources(config: Config) -> Result<()> {
    let mut registry = PluginRegistry::new();
    registry
        .init_all(&config.plugins)
        .context("initializing plugins")?;

    let info = registry.datasource_info();
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.clone())?;

    match cli.command {
        Command::Serve => run_serve(config).await,
        Command::Proxy => run_proxy(config).await,
        Command::Exec {
            file,
            timeout,
            session,
        } => {
            let code = run_exec(config, file, timeout, session).await?;
            std::process::exit(code);
        }
        Command::Datasources => run_datasources(config).await,
    }
}
