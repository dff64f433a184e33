#![warn(missing_docs)]

//! # chainscope-proxy
//!
//! The credential proxy for the chainscope MCP server.
//!
//! The proxy is the sole holder of datasource credentials. Sandboxed Python
//! never sees them: it authenticates with a short-lived capability token (or
//! a JWT against the standalone deployment), and the proxy rewrites requests
//! to carry the real upstream credentials.
//!
//! ## Components
//!
//! - [`tokens::TokenStore`] — per-execution capability tokens
//! - [`jwt::JwtValidator`] — JWKS-backed RS256 validation
//! - [`ratelimit::RateLimiter`] — per-key token buckets with a janitor
//! - [`handlers`] — reverse proxies per backend kind
//! - [`server::ProxyServer`] — routes + middleware chain (auth → rate-limit
//!   → audit → handler)
//! - [`client::ProxyClient`] — the in-process counterpart (embedded/remote)

pub mod audit;
pub mod auth;
pub mod client;
pub mod handlers;
pub mod jwt;
pub mod metrics;
pub mod ratelimit;
pub mod server;
pub mod tokens;

use serde::{Deserialize, Serialize};

pub use auth::{AuthContext, Authenticator};
pub use client::{EmbeddedProxyClient, ProxyClient, RemoteProxyClient};
pub use jwt::{JwtClaims, JwtValidator};
pub use ratelimit::RateLimiter;
pub use server::{ProxyServer, ProxyServerConfig};
pub use tokens::TokenStore;

/// The discovery document served at `GET /datasources`, consumed by Python
/// modules inside the sandbox. Names only — no credentials cross this
/// surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasourceSummary {
    /// ClickHouse cluster names.
    #[serde(default)]
    pub clickhouse: Vec<String>,
    /// Prometheus instance names.
    #[serde(default)]
    pub prometheus: Vec<String>,
    /// Loki instance names.
    #[serde(default)]
    pub loki: Vec<String>,
    /// S3 bucket name; empty when storage is not configured.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub s3_bucket: String,
}
