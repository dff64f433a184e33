//! Per-key token-bucket rate limiting.
//!
//! Keys combine the resolved client IP with the tool (or datasource kind)
//! being called. Client IP resolution only honors forwarding headers when
//! the direct peer is in the trusted-proxy list — an untrusted peer can
//! never influence its own rate-limit key.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use chainscope_config::{RateLimitConfig, RateLimitRule};

/// Header names for the rate-limit response surface.
pub mod headers {
    /// Maximum sustained requests per second for this key.
    pub const LIMIT: &str = "x-ratelimit-limit";
    /// Requests remaining in the current window.
    pub const REMAINING: &str = "x-ratelimit-remaining";
    /// Unix timestamp when the limit resets.
    pub const RESET: &str = "x-ratelimit-reset";
    /// Seconds to wait after a denial.
    pub const RETRY_AFTER: &str = "retry-after";
}

/// Entries idle longer than this are removed by the janitor.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Rate-limit state reported alongside every decision.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    /// Sustained requests per second.
    pub limit: f64,
    /// Whole tokens remaining after this decision.
    pub remaining: u32,
    /// Unix timestamp when the limit resets.
    pub reset_at: i64,
    /// Seconds a denied caller should wait.
    pub retry_after: u64,
}

/// A lazily refilled token bucket.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            rate,
            burst: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    /// Refill based on elapsed time, then try to take one token.
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn remaining(&self) -> u32 {
        self.tokens.max(0.0) as u32
    }
}

struct Entry {
    bucket: Bucket,
    last_used: Instant,
    reset_at: i64,
}

/// The keyed limiter map. Each `allow` call obtains its entry under the read
/// lock, then operates on the entry's own mutex — janitor removal never
/// alters the decision of an in-flight call.
struct EntryMap {
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl EntryMap {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, key: &str, rule: &RateLimitRule) -> Arc<Mutex<Entry>> {
        {
            let entries = self.entries.read().expect("rate limit entries lock poisoned");
            if let Some(entry) = entries.get(key) {
                return Arc::clone(entry);
            }
        }

        let mut entries = self.entries.write().expect("rate limit entries lock poisoned");
        // Double-check after acquiring the write lock.
        if let Some(entry) = entries.get(key) {
            return Arc::clone(entry);
        }

        let entry = Arc::new(Mutex::new(Entry {
            bucket: Bucket::new(rule.effective_rate(), rule.effective_burst()),
            last_used: Instant::now(),
            reset_at: chrono::Utc::now().timestamp()
                + rule.effective_block_duration().as_secs() as i64,
        }));
        entries.insert(key.to_string(), Arc::clone(&entry));
        entry
    }

    fn sweep(&self, idle_cutoff: Duration) -> usize {
        let stale: Vec<String> = {
            let entries = self.entries.read().expect("rate limit entries lock poisoned");
            entries
                .iter()
                .filter(|(_, e)| {
                    e.lock()
                        .expect("rate limit entry lock poisoned")
                        .last_used
                        .elapsed()
                        > idle_cutoff
                })
                .map(|(k, _)| k.clone())
                .collect()
        };

        if stale.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write().expect("rate limit entries lock poisoned");
        let mut removed = 0;
        for key in stale {
            let still_stale = entries
                .get(&key)
                .map(|e| {
                    e.lock()
                        .expect("rate limit entry lock poisoned")
                        .last_used
                        .elapsed()
                        > idle_cutoff
                })
                .unwrap_or(false);
            if still_stale {
                entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .expect("rate limit entries lock poisoned")
            .len()
    }
}

/// Per-key token-bucket rate limiter with a janitor for stale keys.
pub struct RateLimiter {
    cfg: RateLimitConfig,
    map: EntryMap,
    cancel: CancellationToken,
    janitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter. Call [`start`](Self::start) to run the janitor.
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            map: EntryMap::new(),
            cancel: CancellationToken::new(),
            janitor: Mutex::new(None),
        }
    }

    /// Whether limiting is enabled at all. When disabled the middleware is a
    /// transparent no-op.
    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// The effective rule for a tool, falling back to the default rule.
    pub fn rule_for(&self, tool: &str) -> &RateLimitRule {
        if !tool.is_empty() {
            if let Some(rule) = self.cfg.per_tool.get(tool) {
                return rule;
            }
        }
        &self.cfg.default
    }

    /// Check whether a request under `key` is allowed.
    pub fn allow(&self, key: &str, rule: &RateLimitRule) -> (bool, RateLimitInfo) {
        let entry = self.map.get_or_create(key, rule);
        let mut entry = entry.lock().expect("rate limit entry lock poisoned");

        let block = rule.effective_block_duration();
        entry.last_used = Instant::now();
        entry.reset_at = chrono::Utc::now().timestamp() + block.as_secs() as i64;

        let allowed = entry.bucket.allow();
        let info = RateLimitInfo {
            limit: rule.effective_rate(),
            remaining: entry.bucket.remaining(),
            reset_at: entry.reset_at,
            retry_after: block.as_secs(),
        };
        (allowed, info)
    }

    /// Build the rate-limit key from a resolved client IP and tool name.
    pub fn build_key(client_ip: &str, tool: &str) -> String {
        if tool.is_empty() {
            client_ip.to_string()
        } else {
            format!("{client_ip}:{tool}")
        }
    }

    /// Resolve the client IP for a request.
    ///
    /// When the direct peer is a trusted proxy, the first entry of
    /// `X-Forwarded-For` wins, then `X-Real-IP`; otherwise the peer address
    /// is used and the headers are ignored.
    pub fn client_ip(&self, peer: IpAddr, headers: &http::HeaderMap) -> String {
        if self.is_trusted_proxy(peer) {
            if let Some(xff) = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                if let Some(first) = xff.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }

            if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
                let xri = xri.trim();
                if !xri.is_empty() {
                    return xri.to_string();
                }
            }
        }

        peer.to_string()
    }

    /// Whether `ip` is in the trusted-proxy list (exact IPs or CIDR ranges;
    /// malformed entries are skipped, never fatal).
    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        for trusted in &self.cfg.trusted_proxies {
            if trusted.contains('/') {
                if let Some(cidr) = parse_cidr(trusted) {
                    if ip_in_cidr(ip, cidr) {
                        return true;
                    }
                }
            } else if trusted.parse::<IpAddr>().map(|t| t == ip).unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries idle for longer than the sweep interval.
    pub fn sweep(&self) -> usize {
        self.map.sweep(SWEEP_INTERVAL)
    }

    /// Start the janitor.
    pub fn start(self: &Arc<Self>) {
        let mut janitor = self.janitor.lock().expect("janitor lock poisoned");
        if janitor.is_some() {
            return;
        }

        let limiter = Arc::clone(self);
        let cancel = self.cancel.clone();
        *janitor = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = limiter.len(), "rate limiter janitor pass");
                        }
                    }
                }
            }
        }));
    }

    /// Stop the janitor. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.janitor.lock().expect("janitor lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Parse `a.b.c.d/len` (or the v6 equivalent) into a network and prefix
/// length. Returns `None` for malformed input.
fn parse_cidr(s: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = s.split_once('/')?;
    let addr: IpAddr = addr.trim().parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok()?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    (prefix <= max).then_some((addr, prefix))
}

/// Whether `ip` falls inside the network. Mixed address families never match.
fn ip_in_cidr(ip: IpAddr, (net, prefix): (IpAddr, u8)) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - u32::from(prefix));
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - u32::from(prefix));
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}
