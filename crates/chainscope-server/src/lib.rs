#![warn(missing_docs)]

//! # chainscope-server
//!
//! MCP server for chainscope.
//!
//! Exposes sandboxed Python execution over Ethereum observability data:
//! - `execute_python` — run code in a sandbox wired to the credential proxy
//! - `list_sessions` / `destroy_session` — manage persistent workspaces
//!
//! For every execution the server mints a short-lived capability token
//! bound to the execution id, injects it (never credentials) into the
//! sandbox environment, and revokes it on completion.

pub mod issuer;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ServerCapabilities, ServerInfo};
use rmcp::schemars::JsonSchema;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use chainscope_sandbox::{
    workspace::format_size, ExecuteRequest, ExecutionResult, SandboxExecutor,
};

pub use issuer::ExecutionIssuer;
pub use metrics::ServerMetrics;

/// Minimum allowed execution timeout in seconds.
pub const MIN_TIMEOUT_SECS: u64 = 1;
/// Maximum allowed execution timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// The chainscope MCP server handler.
#[derive(Clone)]
pub struct ChainscopeServer {
    executor: Arc<SandboxExecutor>,
    issuer: Arc<ExecutionIssuer>,
    metrics: Option<Arc<ServerMetrics>>,
    default_timeout_secs: u64,
    /// Owner identity bound to sessions. On stdio transport every caller is
    /// the local user; an authenticating wire layer can override per-server.
    owner_id: String,
    tool_router: ToolRouter<Self>,
}

/// Input for the `execute_python` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecutePythonInput {
    /// Python code to execute.
    pub code: String,
    /// Execution timeout in seconds (default from config, max 300).
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Session id to reuse a persistent workspace. Omit to start a new
    /// session (when sessions are enabled).
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Input for the `destroy_session` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DestroySessionInput {
    /// The session to destroy.
    pub session_id: String,
}

impl ChainscopeServer {
    /// Create the server.
    pub fn new(
        executor: Arc<SandboxExecutor>,
        issuer: Arc<ExecutionIssuer>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            executor,
            issuer,
            metrics: None,
            default_timeout_secs,
            owner_id: "local".to_string(),
            tool_router: Self::tool_router(),
        }
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the owner identity bound to sessions.
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// The sandbox executor.
    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }
}

#[tool_router(router = tool_router)]
impl ChainscopeServer {
    /// Execute Python code in the sandbox.
    #[tool(
        name = "execute_python",
        description = "Execute Python code in a sandboxed environment with the chainscope library pre-installed.\n\nKey modules: clickhouse, prometheus, loki, storage. Datasource names are injected via environment metadata; queries go through an authenticated proxy, so no credentials are needed in code.\n\nFiles written to the workspace persist within a session. Pass session_id to reuse a session; use storage.upload() for public URLs."
    )]
    pub async fn execute_python(
        &self,
        Parameters(input): Parameters<ExecutePythonInput>,
    ) -> Result<String, String> {
        if input.code.is_empty() {
            return Err("code is required".to_string());
        }

        let timeout_secs = input.timeout.unwrap_or(self.default_timeout_secs);
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout_secs) {
            return Err(format!(
                "timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds"
            ));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let env = self.issuer.sandbox_env(&execution_id);

        tracing::info!(
            execution_id = %execution_id,
            code_len = input.code.len(),
            timeout_secs,
            backend = self.executor.backend_name(),
            session_id = input.session_id.as_deref().unwrap_or(""),
            "execute_python: starting"
        );

        let request = ExecuteRequest {
            execution_id: execution_id.clone(),
            code: input.code,
            env,
            timeout: Duration::from_secs(timeout_secs),
            session_id: input.session_id.unwrap_or_default(),
            owner_id: self.owner_id.clone(),
        };

        let result = self.executor.execute(request, CancellationToken::new()).await;

        // The token dies with the execution, on every path.
        self.issuer.revoke(&execution_id);

        match result {
            Ok(result) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_execution(
                        self.executor.backend_name(),
                        result.duration.as_secs_f64(),
                    );
                }
                tracing::info!(
                    execution_id = %result.execution_id,
                    exit_code = result.exit_code,
                    "execute_python: complete"
                );
                Ok(format_execution_result(&result))
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(err.kind());
                }
                tracing::warn!(execution_id = %execution_id, error = %err, "execute_python: failed");
                Err(format!("execution error: {err}"))
            }
        }
    }

    /// List the caller's sessions.
    #[tool(
        name = "list_sessions",
        description = "List your active sandbox sessions with age, idle TTL remaining, workspace file count, and status."
    )]
    pub async fn list_sessions(&self) -> Result<String, String> {
        let sessions = self.executor.sessions().list(&self.owner_id);
        if sessions.is_empty() {
            return Ok("no active sessions".to_string());
        }

        let mut lines = Vec::with_capacity(sessions.len());
        for s in sessions {
            lines.push(format!(
                "{} age={}s idle={}s ttl_remaining={}s files={} status={}",
                s.id,
                s.age.as_secs(),
                s.idle.as_secs(),
                s.ttl_remaining.as_secs(),
                s.file_count,
                s.status,
            ));
        }
        Ok(lines.join("\n"))
    }

    /// Destroy one of the caller's sessions.
    #[tool(
        name = "destroy_session",
        description = "Destroy a sandbox session and its workspace. Idempotent on unknown ids."
    )]
    pub async fn destroy_session(
        &self,
        Parameters(input): Parameters<DestroySessionInput>,
    ) -> Result<String, String> {
        self.executor
            .sessions()
            .destroy(&input.session_id, &self.owner_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("session {} destroyed", input.session_id))
    }
}

#[tool_handler]
impl ServerHandler for ChainscopeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Query Ethereum observability data (ClickHouse, Prometheus, Loki, S3) by \
                 executing Python in a sandbox. Use execute_python; reuse session_id to keep \
                 workspace state between runs."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Render an [`ExecutionResult`] into the tool's text output.
pub fn format_execution_result(result: &ExecutionResult) -> String {
    let mut parts = Vec::new();

    if !result.stdout.is_empty() {
        parts.push(format!("[stdout]\n{}", result.stdout));
    }

    if !result.stderr.is_empty() {
        parts.push(format!("[stderr]\n{}", result.stderr));
    }

    if !result.output_files.is_empty() {
        parts.push(format!("[files] {}", result.output_files.join(", ")));
    }

    if let Some(session) = &result.session {
        let mut line = format!(
            "[session] id={} ttl={}s",
            session.id,
            session.ttl_remaining.as_secs()
        );
        if !session.files.is_empty() {
            let listing: Vec<String> = session
                .files
                .iter()
                .map(|f| format!("{}({})", f.name, format_size(f.size)))
                .collect();
            line.push_str(&format!(" workspace=[{}]", listing.join(", ")));
        }
        parts.push(line);
    }

    parts.push(format!(
        "[exit={} duration={:.2}s id={}]",
        result.exit_code,
        result.duration.as_secs_f64(),
        result.execution_id
    ));

    parts.join("\n")
}
