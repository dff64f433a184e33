#![warn(missing_docs)]

//! # chainscope-sandbox
//!
//! Sandboxed Python execution for the chainscope MCP server.
//!
//! Runs untrusted Python in ephemeral sandboxes with bounded sessions. The
//! sandbox never sees datasource credentials — it receives a proxy URL and a
//! short-lived capability token through its environment, and every query it
//! makes goes through the credential proxy.
//!
//! ## Model
//!
//! - **Backend**: how code actually runs — a direct `python3` subprocess in
//!   its own process group, or a long-lived docker container per session.
//! - **Session**: a persistent workspace reusable across executions by one
//!   owner, with an idle TTL, an absolute lifetime, and a global cap.
//! - **Executor**: stages code into the workspace, runs it under a deadline,
//!   captures bounded output, and reports new workspace files.

pub mod error;
pub mod output;
pub mod session;
pub mod workspace;

mod docker;
mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use docker::DockerBackend;
pub use error::SandboxError;
pub use process::ProcessBackend;
pub use session::{Session, SessionManager, SessionManagerConfig, SessionSummary};
pub use workspace::WorkspaceFile;

/// A request to execute Python code.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    /// Execution id. Empty generates one. Callers that mint a capability
    /// token before executing pass the id the token is bound to, so the
    /// proxy's audit trail and the result correlate.
    pub execution_id: String,
    /// The Python source to run.
    pub code: String,
    /// Environment injected for this run (proxy URL, capability token,
    /// datasource metadata). Overrides session-level env on key collision.
    pub env: HashMap<String, String>,
    /// Per-run deadline. Zero means the executor default.
    pub timeout: Duration,
    /// Session to reuse. Empty creates a new session (or an ephemeral run
    /// when sessions are disabled).
    pub session_id: String,
    /// Stable caller identity; bound to any session this run creates.
    pub owner_id: String,
}

/// The outcome of a completed execution.
///
/// A non-zero `exit_code` is a normal outcome, not an error.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Unique id for this run.
    pub execution_id: String,
    /// Captured stdout (possibly truncated with a sentinel).
    pub stdout: String,
    /// Captured stderr (possibly truncated with a sentinel).
    pub stderr: String,
    /// Child exit code.
    pub exit_code: i32,
    /// Wall-clock execution time.
    pub duration: Duration,
    /// Workspace files created or modified by this run.
    pub output_files: Vec<String>,
    /// Session details when the run used a session.
    pub session: Option<SessionInfo>,
}

/// Session details attached to an [`ExecutionResult`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The session id (pass back as `session_id` to reuse).
    pub id: String,
    /// Idle TTL remaining after this run.
    pub ttl_remaining: Duration,
    /// Current workspace listing.
    pub files: Vec<WorkspaceFile>,
}

/// What a backend needs to run one staged execution.
pub struct RunSpec<'a> {
    /// Unique id for this run.
    pub execution_id: &'a str,
    /// Key identifying the container to use (session id, or the execution id
    /// for ephemeral runs).
    pub container_key: &'a str,
    /// Host workspace directory.
    pub workspace: &'a Path,
    /// Path of the staged code file, relative to the workspace root.
    pub code_rel: &'a str,
    /// Environment for the child.
    pub env: &'a HashMap<String, String>,
    /// Deadline for this run.
    pub timeout: Duration,
    /// Caller-driven cancellation.
    pub cancel: &'a CancellationToken,
    /// Cap on captured stdout/stderr, each.
    pub max_output_bytes: usize,
}

/// Raw output of a backend run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Child exit code.
    pub exit_code: i32,
}

/// An execution backend.
///
/// Implementations must kill the whole process tree on timeout or
/// cancellation and must never leak a child process.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Run one staged execution to completion (or deadline).
    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutput, SandboxError>;

    /// Tear down any per-session state (e.g. the session container).
    /// Must be idempotent and must not error on unknown ids.
    async fn destroy_session(&self, session_id: &str);
}

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deadline applied when a request does not carry one.
    pub default_timeout: Duration,
    /// Maximum size of submitted code in bytes.
    pub max_code_size: usize,
    /// Cap on captured stdout/stderr, each.
    pub max_output_bytes: usize,
    /// Whether persistent sessions are enabled.
    pub sessions_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_code_size: 256 * 1024,
            max_output_bytes: 256 * 1024,
            sessions_enabled: true,
        }
    }
}

/// The sandbox executor: session resolution, staging, deadline enforcement,
/// output collection.
pub struct SandboxExecutor {
    config: ExecutorConfig,
    backend: Arc<dyn Backend>,
    sessions: Arc<SessionManager>,
}

impl SandboxExecutor {
    /// Build an executor from the application config.
    pub fn from_config(cfg: &chainscope_config::SandboxConfig) -> Result<Self, SandboxError> {
        let backend: Arc<dyn Backend> = match cfg.backend.as_str() {
            "docker" => Arc::new(DockerBackend::new(
                &cfg.image,
                cfg.memory_limit.clone(),
                cfg.cpu_limit,
                cfg.network.clone(),
            )),
            _ => Arc::new(ProcessBackend::new()),
        };

        let session_cfg = SessionManagerConfig {
            ttl: cfg.sessions.ttl_duration(),
            max_duration: cfg.sessions.max_duration_duration(),
            max_sessions: cfg.sessions.max_sessions,
            ..SessionManagerConfig::default()
        };

        let executor_cfg = ExecutorConfig {
            default_timeout: Duration::from_secs(cfg.timeout),
            max_output_bytes: cfg.max_output_bytes,
            sessions_enabled: cfg.sessions.enabled,
            ..ExecutorConfig::default()
        };

        Ok(Self::with_backend(executor_cfg, session_cfg, backend))
    }

    /// Build an executor with an explicit backend (used by tests).
    pub fn with_backend(
        config: ExecutorConfig,
        session_cfg: SessionManagerConfig,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(session_cfg, Arc::clone(&backend)));
        Self {
            config,
            backend,
            sessions,
        }
    }

    /// Backend name for logging.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Start the session reapers.
    pub fn start(&self) {
        self.sessions.start();
    }

    /// Stop the reapers and destroy all sessions.
    pub async fn stop(&self) {
        self.sessions.stop().await;
    }

    /// Execute a request.
    ///
    /// Always returns either a structured [`ExecutionResult`] or a typed
    /// [`SandboxError`]; the session lock is released on every path and no
    /// child process outlives the call.
    pub async fn execute(
        &self,
        req: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if req.code.len() > self.config.max_code_size {
            return Err(SandboxError::CodeTooLarge {
                max: self.config.max_code_size,
                actual: req.code.len(),
            });
        }

        let execution_id = if req.execution_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            req.execution_id.clone()
        };
        let timeout = if req.timeout.is_zero() {
            self.config.default_timeout
        } else {
            req.timeout
        };

        tracing::info!(
            execution_id = %execution_id,
            code_len = req.code.len(),
            timeout_secs = timeout.as_secs(),
            backend = self.backend.name(),
            session_id = %req.session_id,
            owner_id = %req.owner_id,
            "executing code"
        );

        if req.session_id.is_empty() && !self.config.sessions_enabled {
            return self.execute_ephemeral(&execution_id, &req, timeout, &cancel).await;
        }

        let session = if req.session_id.is_empty() {
            self.sessions.create(&req.owner_id, req.env.clone()).await?
        } else {
            if !self.config.sessions_enabled {
                return Err(SandboxError::SessionNotFound {
                    id: req.session_id.clone(),
                });
            }
            self.sessions.attach(&req.session_id, &req.owner_id)?
        };

        // Serialize against other executions on this session. The guard is
        // dropped on every return path below.
        let guard = self.sessions.acquire_execution(&session).await;

        let mut env = session.env().clone();
        env.extend(req.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let run = self
            .run_in_workspace(
                &execution_id,
                session.id(),
                session.workspace(),
                &req.code,
                &env,
                timeout,
                &cancel,
            )
            .await;

        session.touch();
        drop(guard);
        self.sessions.finish_execution(&session).await;

        let (output, duration) = run?;
        let (stdout, stderr, exit_code, output_files) = output;

        Ok(ExecutionResult {
            execution_id,
            stdout,
            stderr,
            exit_code,
            duration,
            output_files,
            session: Some(SessionInfo {
                id: session.id().to_string(),
                ttl_remaining: session.ttl_remaining(self.sessions.config().ttl),
                files: session.workspace_files(),
            }),
        })
    }

    /// One-shot execution with a throwaway workspace.
    async fn execute_ephemeral(
        &self,
        execution_id: &str,
        req: &ExecuteRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let workspace = self
            .sessions
            .config()
            .root_dir
            .join(format!("ephemeral-{execution_id}"));
        tokio::fs::create_dir_all(&workspace).await?;

        let run = self
            .run_in_workspace(
                execution_id,
                execution_id,
                &workspace,
                &req.code,
                &req.env,
                timeout,
                cancel,
            )
            .await;

        self.backend.destroy_session(execution_id).await;
        if let Err(err) = tokio::fs::remove_dir_all(&workspace).await {
            tracing::warn!(error = %err, "failed to remove ephemeral workspace");
        }

        let (output, duration) = run?;
        let (stdout, stderr, exit_code, output_files) = output;

        Ok(ExecutionResult {
            execution_id: execution_id.to_string(),
            stdout,
            stderr,
            exit_code,
            duration,
            output_files,
            session: None,
        })
    }

    /// Stage, run, and diff the workspace. The staged file is removed on
    /// every path.
    #[allow(clippy::too_many_arguments)]
    async fn run_in_workspace(
        &self,
        execution_id: &str,
        container_key: &str,
        workspace: &Path,
        code: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<((String, String, i32, Vec<String>), Duration), SandboxError> {
        let staging = workspace.join(".exec");
        tokio::fs::create_dir_all(&staging).await?;
        let code_rel = format!(".exec/{execution_id}.py");
        let code_path = workspace.join(&code_rel);
        tokio::fs::write(&code_path, code).await?;

        let before = workspace::list_workspace(workspace);
        let started = std::time::Instant::now();

        let run = self
            .backend
            .run(RunSpec {
                execution_id,
                container_key,
                workspace,
                code_rel: &code_rel,
                env,
                timeout,
                cancel,
                max_output_bytes: self.config.max_output_bytes,
            })
            .await;

        let duration = started.elapsed();
        let _ = tokio::fs::remove_file(&code_path).await;

        let output = run?;
        let after = workspace::list_workspace(workspace);
        let output_files = workspace::diff_output_files(&before, &after);

        tracing::info!(
            execution_id,
            exit_code = output.exit_code,
            duration_ms = duration.as_millis() as u64,
            output_file_count = output_files.len(),
            "execution completed"
        );

        Ok((
            (output.stdout, output.stderr, output.exit_code, output_files),
            duration,
        ))
    }
}
