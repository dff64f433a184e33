//! Per-execution capability tokens.
//!
//! The token store is the bridge between the MCP server and the credential
//! proxy: every sandbox execution gets a fresh opaque token bound to its
//! execution id, injected into the sandbox environment instead of
//! credentials, and revoked the moment the execution completes.
//!
//! At the API boundary "never existed" and "expired" are indistinguishable —
//! both validate to `None` and the caller reports a single generic failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio_util::sync::CancellationToken;

/// Bytes of entropy per token (256 bits).
const TOKEN_BYTES: usize = 32;

/// How often the background sweeper scans for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct TokenEntry {
    execution_id: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Maps {
    by_token: HashMap<String, TokenEntry>,
    by_execution: HashMap<String, String>,
}

/// In-memory capability token store with TTL, explicit revocation, and a
/// background expiry sweeper.
pub struct TokenStore {
    ttl: Duration,
    maps: RwLock<Maps>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TokenStore {
    /// Create a store whose tokens live for `ttl`.
    ///
    /// The TTL should exceed the sandbox timeout with some slack so a token
    /// never expires mid-execution.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            maps: RwLock::new(Maps::default()),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Generate and register a token bound to `execution_id`.
    ///
    /// Registering the same execution id again replaces (and revokes) the
    /// previous token.
    pub fn register(&self, execution_id: &str) -> String {
        let mut maps = self.maps.write().expect("token maps lock poisoned");

        // Replace any prior binding for this execution.
        if let Some(old) = maps.by_execution.remove(execution_id) {
            maps.by_token.remove(&old);
        }

        // Collisions on 256 random bits are not expected, but the store must
        // never hand out an existing token.
        let token = loop {
            let candidate = generate_token();
            if !maps.by_token.contains_key(&candidate) {
                break candidate;
            }
        };

        maps.by_token.insert(
            token.clone(),
            TokenEntry {
                execution_id: execution_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        maps.by_execution
            .insert(execution_id.to_string(), token.clone());

        tracing::debug!(execution_id, "capability token registered");
        token
    }

    /// Return the bound execution id iff the token exists and has not
    /// expired. Expired entries discovered here are deleted opportunistically.
    pub fn validate(&self, token: &str) -> Option<String> {
        {
            let maps = self.maps.read().expect("token maps lock poisoned");
            match maps.by_token.get(token) {
                None => return None,
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.execution_id.clone());
                }
                Some(_) => {} // expired; fall through to delete
            }
        }

        let mut maps = self.maps.write().expect("token maps lock poisoned");
        if let Some(entry) = maps.by_token.get(token) {
            if entry.expires_at <= Instant::now() {
                let execution_id = entry.execution_id.clone();
                maps.by_token.remove(token);
                maps.by_execution.remove(&execution_id);
            } else {
                // Re-registered between the read and write locks.
                return Some(entry.execution_id.clone());
            }
        }
        None
    }

    /// Revoke the token bound to `execution_id`. No-op on unknown ids.
    pub fn revoke(&self, execution_id: &str) {
        let mut maps = self.maps.write().expect("token maps lock poisoned");
        if let Some(token) = maps.by_execution.remove(execution_id) {
            maps.by_token.remove(&token);
            tracing::debug!(execution_id, "capability token revoked");
        }
    }

    /// Revoke by token value. No-op on unknown tokens.
    pub fn revoke_token(&self, token: &str) {
        let mut maps = self.maps.write().expect("token maps lock poisoned");
        if let Some(entry) = maps.by_token.remove(token) {
            maps.by_execution.remove(&entry.execution_id);
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.maps
            .read()
            .expect("token maps lock poisoned")
            .by_token
            .len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the background expiry sweeper.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().expect("sweeper lock poisoned");
        if sweeper.is_some() {
            return;
        }

        let store = Arc::clone(self);
        let cancel = self.cancel.clone();
        *sweeper = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "token sweeper removed expired entries");
                        }
                    }
                }
            }
        }));
    }

    /// Stop the sweeper. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().expect("sweeper lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Remove every expired entry. Expired tokens are collected under the
    /// read lock first so validators are not blocked during the scan.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let maps = self.maps.read().expect("token maps lock poisoned");
            maps.by_token
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(token, _)| token.clone())
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut maps = self.maps.write().expect("token maps lock poisoned");
        let mut removed = 0;
        for token in expired {
            // Re-check under the write lock: the binding may have been
            // replaced since the scan.
            if let Some(entry) = maps.by_token.get(&token) {
                if entry.expires_at <= now {
                    let execution_id = entry.execution_id.clone();
                    maps.by_token.remove(&token);
                    maps.by_execution.remove(&execution_id);
                    removed += 1;
                }
            }
        }
        removed
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
