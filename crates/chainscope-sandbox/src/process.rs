//! Subprocess backend — runs `python3` directly on the host.
//!
//! Each run gets its own process group so that deadline enforcement can kill
//! the interpreter together with anything it spawned. The child sees a
//! scrubbed environment: `PATH`, a workspace-local `HOME`, and exactly the
//! variables the executor injects.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::SandboxError;
use crate::output::capture_stream;
use crate::{Backend, RunOutput, RunSpec};

/// Grace window between SIGTERM and SIGKILL on deadline.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Direct-subprocess execution backend.
pub struct ProcessBackend {
    interpreter: String,
    kill_grace: Duration,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBackend {
    /// Create a backend running `python3` from `PATH`.
    pub fn new() -> Self {
        Self {
            interpreter: "python3".to_string(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Override the interpreter binary (used by tests).
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Override the SIGTERM→SIGKILL grace window (used by tests).
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

#[async_trait::async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutput, SandboxError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(spec.code_rel)
            .current_dir(spec.workspace)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH")
                    .unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
            )
            .env("HOME", spec.workspace)
            .env("PYTHONUNBUFFERED", "1")
            .envs(spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::Backend(anyhow::anyhow!(
                "failed to spawn {}: {e}",
                self.interpreter
            ))
        })?;

        let pid = child.id().map(|p| Pid::from_raw(p as i32));

        let stdout = child
            .stdout
            .take()
            .expect("stdout was requested piped");
        let stderr = child
            .stderr
            .take()
            .expect("stderr was requested piped");
        let cap = spec.max_output_bytes;
        let stdout_task = tokio::spawn(capture_stream(stdout, cap));
        let stderr_task = tokio::spawn(capture_stream(stderr, cap));

        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(spec.timeout) => None,
            _ = spec.cancel.cancelled() => {
                cancelled = true;
                None
            }
        };

        match status {
            Some(Ok(status)) => {
                let stdout = stdout_task
                    .await
                    .map(super::output::BoundedBuffer::into_string)
                    .unwrap_or_default();
                let stderr = stderr_task
                    .await
                    .map(super::output::BoundedBuffer::into_string)
                    .unwrap_or_default();

                Ok(RunOutput {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            Some(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                Err(SandboxError::Backend(anyhow::anyhow!(
                    "waiting on child failed: {e}"
                )))
            }
            None => {
                terminate_group(pid, &mut child, self.kill_grace).await;
                stdout_task.abort();
                stderr_task.abort();

                if cancelled {
                    Err(SandboxError::Cancelled)
                } else {
                    Err(SandboxError::Timeout {
                        timeout_ms: spec.timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    async fn destroy_session(&self, _session_id: &str) {
        // Nothing lives beyond the run in process mode; the workspace
        // directory is removed by the session manager.
    }
}

/// SIGTERM the process group, wait out the grace window, then SIGKILL and
/// reap. The final `wait` guarantees no zombie is left behind.
async fn terminate_group(pid: Option<Pid>, child: &mut Child, grace: Duration) {
    if let Some(pid) = pid {
        // ESRCH means the group is already gone.
        let _ = killpg(pid, Signal::SIGTERM);
    }

    let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
    if !exited {
        if let Some(pid) = pid {
            let _ = killpg(pid, Signal::SIGKILL);
        }
        let _ = child.wait().await;
    }
}
