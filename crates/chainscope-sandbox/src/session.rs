//! Session manager — bounded, owner-bound, reaped.
//!
//! A session is a persistent workspace (and, for the docker backend, a
//! long-lived container) reusable across executions by the same owner.
//! Sessions are destroyed when idle past their TTL, when they exceed their
//! absolute lifetime, when their owner destroys them, or when the session cap
//! forces eviction of the longest-idle victim.
//!
//! Reapers cooperate with in-flight executions: a session that is currently
//! executing is never torn down under the executor — it is flagged
//! pending-destroy and torn down when the execution completes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::workspace::{list_workspace, WorkspaceFile};
use crate::Backend;

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Idle TTL; a session unused for longer is destroyed.
    pub ttl: Duration,
    /// Absolute maximum session lifetime.
    pub max_duration: Duration,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// How often the reapers scan.
    pub reap_interval: Duration,
    /// Directory under which per-session workspaces are created.
    pub root_dir: PathBuf,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_duration: Duration::from_secs(3600),
            max_sessions: 10,
            reap_interval: Duration::from_secs(15),
            root_dir: std::env::temp_dir().join("chainscope-sessions"),
        }
    }
}

/// A single session: workspace + interpreter state bound to one owner.
#[derive(Debug)]
pub struct Session {
    id: String,
    owner_id: String,
    created_at: Instant,
    last_used: Mutex<Instant>,
    env: HashMap<String, String>,
    workspace: PathBuf,
    /// Serializes executions on this session (one interpreter, one workspace).
    exec_lock: tokio::sync::Mutex<()>,
    /// Count of executions holding or waiting on `exec_lock`. Reapers must
    /// not tear down a session while this is non-zero.
    in_use: AtomicUsize,
    pending_destroy: AtomicBool,
}

impl Session {
    fn new(owner_id: &str, env: HashMap<String, String>, workspace: PathBuf) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            created_at: now,
            last_used: Mutex::new(now),
            env,
            workspace,
            exec_lock: tokio::sync::Mutex::new(()),
            in_use: AtomicUsize::new(0),
            pending_destroy: AtomicBool::new(false),
        }
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The owner bound at creation.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Environment captured at creation.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// The workspace directory.
    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    /// Mark the session as used now.
    pub fn touch(&self) {
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    /// Time since the session was last used.
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("last_used lock poisoned")
            .elapsed()
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Idle TTL remaining, saturating at zero.
    pub fn ttl_remaining(&self, ttl: Duration) -> Duration {
        ttl.saturating_sub(self.idle_for())
    }

    /// Whether an execution currently holds (or is queued on) this session.
    pub fn is_executing(&self) -> bool {
        self.in_use.load(Ordering::SeqCst) > 0
    }

    /// Whether the session is flagged for teardown on execution completion.
    pub fn is_pending_destroy(&self) -> bool {
        self.pending_destroy.load(Ordering::SeqCst)
    }

    /// Current workspace listing (hidden entries excluded).
    pub fn workspace_files(&self) -> Vec<WorkspaceFile> {
        list_workspace(&self.workspace)
    }

    /// One-line status.
    pub fn status(&self) -> &'static str {
        if self.is_pending_destroy() {
            "pending-destroy"
        } else if self.is_executing() {
            "executing"
        } else {
            "idle"
        }
    }
}

/// A summary row for `list`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// The session id.
    pub id: String,
    /// Time since creation.
    pub age: Duration,
    /// Time since last use.
    pub idle: Duration,
    /// Idle TTL remaining.
    pub ttl_remaining: Duration,
    /// Number of visible workspace files.
    pub file_count: usize,
    /// One-line status.
    pub status: String,
}

/// RAII guard for an execution slot on a session.
///
/// Holds the per-session mutex for the duration of the execution and
/// decrements the in-use count on drop, so cancellation can never leave the
/// session in a half-used state.
pub struct ExecutionGuard<'a> {
    session: &'a Session,
    _permit: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.session.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded mapping from session id to [`Session`].
pub struct SessionManager {
    cfg: SessionManagerConfig,
    backend: Arc<dyn Backend>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    cancel: CancellationToken,
    reapers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager. Call [`start`](Self::start) to run the reapers.
    pub fn new(cfg: SessionManagerConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            cfg,
            backend,
            sessions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            reapers: Mutex::new(Vec::new()),
        }
    }

    /// The manager configuration.
    pub fn config(&self) -> &SessionManagerConfig {
        &self.cfg
    }

    /// Start the idle reaper and the max-duration reaper.
    pub fn start(self: &Arc<Self>) {
        let mut reapers = self.reapers.lock().expect("reapers lock poisoned");
        if !reapers.is_empty() {
            return;
        }

        for lifetime_pass in [false, true] {
            let mgr = Arc::clone(self);
            let cancel = self.cancel.clone();
            reapers.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(mgr.cfg.reap_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tick.tick() => {
                            if lifetime_pass {
                                mgr.reap_over_lifetime().await;
                            } else {
                                mgr.reap_idle().await;
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Stop the reapers and destroy every remaining session.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.reapers.lock().expect("reapers lock poisoned"));
        for handle in handles {
            let _ = handle.await;
        }

        let all: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in all {
            self.teardown(&session).await;
        }
    }

    /// Create a session for `owner_id`, enforcing the cap.
    ///
    /// When the cap is reached the longest-idle session that is not
    /// currently executing is evicted (any owner). If every session is
    /// executing, returns [`SandboxError::SessionCapExceeded`].
    pub async fn create(
        &self,
        owner_id: &str,
        env: HashMap<String, String>,
    ) -> Result<Arc<Session>, SandboxError> {
        loop {
            let victim = {
                let sessions = self.sessions.lock().expect("sessions lock poisoned");
                if sessions.len() < self.cfg.max_sessions {
                    break;
                }

                let victim = sessions
                    .values()
                    .filter(|s| !s.is_executing())
                    .max_by_key(|s| s.idle_for())
                    .cloned();

                match victim {
                    Some(v) => v,
                    None => {
                        return Err(SandboxError::SessionCapExceeded {
                            max: self.cfg.max_sessions,
                        })
                    }
                }
            };

            tracing::info!(
                session_id = %victim.id(),
                idle_secs = victim.idle_for().as_secs(),
                "evicting longest-idle session to honor cap"
            );
            self.remove_and_teardown(victim.id()).await;
        }

        let workspace = self.cfg.root_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&workspace).await?;

        let session = Arc::new(Session::new(owner_id, env, workspace));
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .insert(session.id().to_string(), Arc::clone(&session));

        tracing::info!(session_id = %session.id(), owner_id, "session created");
        Ok(session)
    }

    /// Attach to an existing session. Owner-checked; updates last-used.
    pub fn attach(&self, id: &str, owner_id: &str) -> Result<Arc<Session>, SandboxError> {
        let session = {
            let sessions = self.sessions.lock().expect("sessions lock poisoned");
            sessions.get(id).cloned()
        };

        let session = session.ok_or_else(|| SandboxError::SessionNotFound { id: id.to_string() })?;

        if session.owner_id() != owner_id {
            return Err(SandboxError::SessionForbidden { id: id.to_string() });
        }

        if session.is_pending_destroy()
            || session.idle_for() > self.cfg.ttl
            || session.age() > self.cfg.max_duration
        {
            // Lazily expired between reaper passes.
            return Err(SandboxError::SessionNotFound { id: id.to_string() });
        }

        session.touch();
        Ok(session)
    }

    /// Destroy a session. Owner-checked; idempotent on unknown id.
    ///
    /// A session that is currently executing is flagged pending-destroy and
    /// torn down when the execution finishes.
    pub async fn destroy(&self, id: &str, owner_id: &str) -> Result<(), SandboxError> {
        let session = {
            let sessions = self.sessions.lock().expect("sessions lock poisoned");
            sessions.get(id).cloned()
        };

        let Some(session) = session else {
            return Ok(());
        };

        if session.owner_id() != owner_id {
            return Err(SandboxError::SessionForbidden { id: id.to_string() });
        }

        if session.is_executing() {
            session.pending_destroy.store(true, Ordering::SeqCst);
            return Ok(());
        }

        self.remove_and_teardown(id).await;
        Ok(())
    }

    /// Sessions owned by `owner_id`.
    pub fn list(&self, owner_id: &str) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().expect("sessions lock poisoned");
        let mut out: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.owner_id() == owner_id)
            .map(|s| SessionSummary {
                id: s.id().to_string(),
                age: s.age(),
                idle: s.idle_for(),
                ttl_remaining: s.ttl_remaining(self.cfg.ttl),
                file_count: s.workspace_files().len(),
                status: s.status().to_string(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("sessions lock poisoned").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the execution slot on a session.
    ///
    /// Serializes executions per session. The in-use count is incremented
    /// before waiting so reapers flag (rather than tear down) a session with
    /// queued work.
    pub async fn acquire_execution<'a>(&self, session: &'a Session) -> ExecutionGuard<'a> {
        session.in_use.fetch_add(1, Ordering::SeqCst);
        let permit = session.exec_lock.lock().await;
        session.touch();
        ExecutionGuard {
            session,
            _permit: permit,
        }
    }

    /// Executor callback after an execution completes: performs a deferred
    /// destroy when a reaper or owner flagged the session mid-execution.
    pub async fn finish_execution(&self, session: &Session) {
        if session.is_pending_destroy() && !session.is_executing() {
            self.remove_and_teardown(session.id()).await;
        }
    }

    async fn reap_idle(&self) {
        let expired = self.collect_expired(|s| s.idle_for() > self.cfg.ttl);
        for session in expired {
            tracing::debug!(session_id = %session.id(), "idle reaper destroying session");
            self.flag_or_teardown(&session).await;
        }
    }

    async fn reap_over_lifetime(&self) {
        let expired = self.collect_expired(|s| s.age() > self.cfg.max_duration);
        for session in expired {
            tracing::debug!(session_id = %session.id(), "max-duration reaper destroying session");
            self.flag_or_teardown(&session).await;
        }
    }

    fn collect_expired(&self, pred: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().expect("sessions lock poisoned");
        sessions.values().filter(|s| pred(s)).cloned().collect()
    }

    async fn flag_or_teardown(&self, session: &Arc<Session>) {
        if session.is_executing() {
            session.pending_destroy.store(true, Ordering::SeqCst);
        } else {
            self.remove_and_teardown(session.id()).await;
        }
    }

    async fn remove_and_teardown(&self, id: &str) {
        let session = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .remove(id);
        if let Some(session) = session {
            self.teardown(&session).await;
        }
    }

    async fn teardown(&self, session: &Session) {
        self.backend.destroy_session(session.id()).await;
        if let Err(err) = tokio::fs::remove_dir_all(session.workspace()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    session_id = %session.id(),
                    error = %err,
                    "failed to remove session workspace"
                );
            }
        }
        tracing::info!(session_id = %session.id(), "session destroyed");
    }
}
