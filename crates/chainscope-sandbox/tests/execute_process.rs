//! End-to-end executor tests on the process backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chainscope_sandbox::{
    ExecuteRequest, ExecutorConfig, ProcessBackend, SandboxError, SandboxExecutor,
    SessionManagerConfig,
};
use tokio_util::sync::CancellationToken;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok()
}

fn executor(root: &Path, sessions_enabled: bool) -> SandboxExecutor {
    SandboxExecutor::with_backend(
        ExecutorConfig {
            default_timeout: Duration::from_secs(10),
            sessions_enabled,
            ..ExecutorConfig::default()
        },
        SessionManagerConfig {
            ttl: Duration::from_secs(60),
            max_duration: Duration::from_secs(600),
            max_sessions: 4,
            reap_interval: Duration::from_millis(50),
            root_dir: root.to_path_buf(),
        },
        Arc::new(ProcessBackend::new().with_kill_grace(Duration::from_millis(200))),
    )
}

fn request(code: &str, timeout: Duration) -> ExecuteRequest {
    ExecuteRequest {
        execution_id: String::new(),
        code: code.to_string(),
        env: HashMap::new(),
        timeout,
        session_id: String::new(),
        owner_id: "tester".to_string(),
    }
}

#[tokio::test]
async fn simple_execution_returns_stdout_and_exit_code() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), true);

    let result = exec
        .execute(
            request("print(1+1)", Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stdout, "2\n");
    assert_eq!(result.exit_code, 0);
    assert!(!result.execution_id.is_empty());
    assert!(result.session.is_some(), "sessions enabled: session attached");

    exec.stop().await;
}

#[tokio::test]
async fn timeout_yields_timeout_error_and_no_zombie() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), true);

    let started = std::time::Instant::now();
    let err = exec
        .execute(
            request("import time; time.sleep(10)", Duration::from_secs(1)),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SandboxError::Timeout { .. }), "got: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    // The session must be reusable afterwards (lock released, no half-used
    // state).
    let result = exec
        .execute(
            request("print('ok')", Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "ok\n");

    exec.stop().await;
}

#[tokio::test]
async fn workspace_persists_across_executions_in_a_session() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), true);

    let first = exec
        .execute(
            request(
                "with open('state.txt', 'w') as f:\n    f.write('hello')",
                Duration::from_secs(5),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(first.output_files, vec!["state.txt"]);
    let session_id = first.session.as_ref().unwrap().id.clone();

    let mut second_req = request(
        "print(open('state.txt').read())",
        Duration::from_secs(5),
    );
    second_req.session_id = session_id.clone();
    let second = exec
        .execute(second_req, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.stdout, "hello\n");
    assert_eq!(second.session.as_ref().unwrap().id, session_id);
    let names: Vec<&str> = second
        .session
        .as_ref()
        .unwrap()
        .files
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(names, vec!["state.txt"]);
    // Reading a file does not report it as an output file.
    assert!(second.output_files.is_empty());

    exec.stop().await;
}

#[tokio::test]
async fn foreign_session_is_forbidden() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), true);

    let first = exec
        .execute(request("print(0)", Duration::from_secs(5)), CancellationToken::new())
        .await
        .unwrap();
    let session_id = first.session.unwrap().id;

    let mut foreign = request("print(1)", Duration::from_secs(5));
    foreign.session_id = session_id;
    foreign.owner_id = "someone-else".to_string();

    let err = exec
        .execute(foreign, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::SessionForbidden { .. }));

    exec.stop().await;
}

#[tokio::test]
async fn ephemeral_mode_leaves_nothing_behind() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), false);

    let result = exec
        .execute(
            request("print('once')", Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.stdout, "once\n");
    assert!(result.session.is_none());

    // No session directories survive an ephemeral run.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .map(|rd| rd.flatten().collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");

    exec.stop().await;
}

#[tokio::test]
async fn oversized_code_is_rejected_before_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let exec = SandboxExecutor::with_backend(
        ExecutorConfig {
            max_code_size: 16,
            ..ExecutorConfig::default()
        },
        SessionManagerConfig {
            root_dir: dir.path().to_path_buf(),
            ..SessionManagerConfig::default()
        },
        Arc::new(ProcessBackend::new()),
    );

    let err = exec
        .execute(
            request("print('this is definitely too long')", Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
}

#[tokio::test]
async fn env_injection_reaches_the_interpreter() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), true);

    let mut req = request(
        "import os; print(os.environ['ETHPANDAOPS_PROXY_URL'])",
        Duration::from_secs(5),
    );
    req.env.insert(
        "ETHPANDAOPS_PROXY_URL".to_string(),
        "http://localhost:18081".to_string(),
    );

    let result = exec.execute(req, CancellationToken::new()).await.unwrap();
    assert_eq!(result.stdout, "http://localhost:18081\n");

    exec.stop().await;
}
