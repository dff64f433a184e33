//! Docker backend — one long-lived container per session.
//!
//! The session workspace is bind-mounted at `/workspace` and a container
//! runs `sleep infinity` for the session's lifetime; each execution is a
//! `docker exec` against it. On deadline the container is force-removed —
//! there is no reliable way to kill only the exec'd process tree from the
//! client side — and the next execution on the session recreates it over the
//! same workspace.

use std::process::Stdio;

use tokio::process::Command;

use crate::error::SandboxError;
use crate::output::capture_stream;
use crate::{Backend, RunOutput, RunSpec};

/// Workspace mount point inside the container.
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Docker-CLI execution backend.
pub struct DockerBackend {
    image: String,
    memory_limit: Option<String>,
    cpu_limit: Option<f64>,
    network: Option<String>,
}

impl DockerBackend {
    /// Create a backend using the given image and resource limits.
    pub fn new(
        image: &str,
        memory_limit: Option<String>,
        cpu_limit: Option<f64>,
        network: Option<String>,
    ) -> Self {
        Self {
            image: image.to_string(),
            memory_limit,
            cpu_limit,
            network,
        }
    }

    fn container_name(key: &str) -> String {
        format!("chainscope-sbx-{key}")
    }

    /// Start the session container if it is not already running.
    async fn ensure_container(&self, spec: &RunSpec<'_>) -> Result<String, SandboxError> {
        let name = Self::container_name(spec.container_key);

        let inspect = Command::new("docker")
            .args(["container", "inspect", "--format", "{{.State.Running}}"])
            .arg(&name)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::Backend(anyhow::anyhow!("docker inspect failed: {e}")))?;

        if inspect.status.success()
            && String::from_utf8_lossy(&inspect.stdout).trim() == "true"
        {
            return Ok(name);
        }

        // A stopped container with this name blocks `docker run`.
        let _ = Command::new("docker")
            .args(["rm", "-f"])
            .arg(&name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        let mount = format!(
            "{}:{}",
            spec.workspace.display(),
            CONTAINER_WORKSPACE
        );
        let mut run = Command::new("docker");
        run.args(["run", "-d", "--name"])
            .arg(&name)
            .args(["--workdir", CONTAINER_WORKSPACE])
            .arg("-v")
            .arg(&mount);

        if let Some(mem) = &self.memory_limit {
            run.arg("--memory").arg(mem);
        }
        if let Some(cpus) = self.cpu_limit {
            run.arg("--cpus").arg(cpus.to_string());
        }
        if let Some(network) = &self.network {
            run.arg("--network").arg(network);
        }

        run.arg(&self.image)
            .args(["sleep", "infinity"])
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = run
            .output()
            .await
            .map_err(|e| SandboxError::Backend(anyhow::anyhow!("docker run failed: {e}")))?;

        if !output.status.success() {
            return Err(SandboxError::Backend(anyhow::anyhow!(
                "docker run for image '{}' failed: {}",
                self.image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!(container = %name, image = %self.image, "session container started");
        Ok(name)
    }

    /// Force-remove the container. Used on deadline and on session teardown.
    async fn remove_container(name: &str) {
        let _ = Command::new("docker")
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[async_trait::async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, spec: RunSpec<'_>) -> Result<RunOutput, SandboxError> {
        let name = self.ensure_container(&spec).await?;

        let mut exec = Command::new("docker");
        exec.args(["exec", "-i"]);
        for (key, value) in spec.env {
            exec.arg("-e").arg(format!("{key}={value}"));
        }
        exec.arg(&name)
            .arg("python3")
            .arg(format!("{CONTAINER_WORKSPACE}/{}", spec.code_rel))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = exec
            .spawn()
            .map_err(|e| SandboxError::Backend(anyhow::anyhow!("docker exec failed: {e}")))?;

        let stdout = child.stdout.take().expect("stdout was requested piped");
        let stderr = child.stderr.take().expect("stderr was requested piped");
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
                    "waiting on docker exec failed: {e}"
                )))
            }
            None => {
                // The exec'd tree lives server-side; taking down the
                // container is the only hard stop.
                Self::remove_container(&name).await;
                let _ = child.wait().await;
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

    async fn destroy_session(&self, session_id: &str) {
        Self::remove_container(&Self::container_name(session_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_stable_and_prefixed() {
        assert_eq!(
            DockerBackend::container_name("abc-123"),
            "chainscope-sbx-abc-123"
        );
    }
}
