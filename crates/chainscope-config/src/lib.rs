#![warn(missing_docs)]

//! # chainscope-config
//!
//! Configuration loading for the chainscope MCP server.
//!
//! Supports YAML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```yaml
//! server:
//!   host: 127.0.0.1
//!   port: 8080
//!
//! sandbox:
//!   backend: docker
//!   image: chainscope-sandbox:latest
//!   timeout: 60
//!   sessions:
//!     enabled: true
//!     ttl: 600
//!     max_sessions: 10
//!
//! rate_limit:
//!   enabled: true
//!   default:
//!     requests_per_second: 2
//!     burst_size: 4
//!
//! plugins:
//!   clickhouse:
//!     datasources:
//!       - name: xatu
//!         url: https://clickhouse.example.com:8443
//!         username: reader
//!         password: ${CLICKHOUSE_PASSWORD}
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse YAML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level chainscope configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// MCP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Credential proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Rate limiting settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Object storage settings (optional).
    #[serde(default)]
    pub storage: Option<StorageConfig>,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Raw per-plugin configuration, keyed by plugin name.
    ///
    /// Each value is handed verbatim to the plugin registry, which parses,
    /// defaults, and validates it per plugin.
    #[serde(default)]
    pub plugins: BTreeMap<String, serde_yaml::Value>,
}

/// MCP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen host for HTTP transports.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port for HTTP transports.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport: "stdio" (default) or "http".
    #[serde(default = "default_transport")]
    pub transport: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: default_transport(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_transport() -> String {
    "stdio".to_string()
}

/// Sandbox execution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Execution backend: "process" or "docker".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Container image (docker backend).
    #[serde(default = "default_image")]
    pub image: String,

    /// Default execution timeout in seconds.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout: u64,

    /// Container memory limit, e.g. "512m" (docker backend).
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// Container CPU limit, e.g. 1.5 (docker backend).
    #[serde(default)]
    pub cpu_limit: Option<f64>,

    /// Container network mode (docker backend). Defaults to "bridge".
    #[serde(default)]
    pub network: Option<String>,

    /// Cap on captured stdout/stderr, in bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Session settings.
    #[serde(default)]
    pub sessions: SessionConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            image: default_image(),
            timeout: default_sandbox_timeout(),
            memory_limit: None,
            cpu_limit: None,
            network: None,
            max_output_bytes: default_max_output_bytes(),
            sessions: SessionConfig::default(),
        }
    }
}

fn default_backend() -> String {
    "process".to_string()
}

fn default_image() -> String {
    "chainscope-sandbox:latest".to_string()
}

fn default_sandbox_timeout() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    256 * 1024
}

/// Persistent session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Whether sessions are enabled. When disabled every execution is
    /// ephemeral.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Idle TTL in seconds; a session unused for longer is destroyed.
    #[serde(default = "default_session_ttl")]
    pub ttl: u64,

    /// Absolute maximum session lifetime in seconds.
    #[serde(default = "default_session_max_duration")]
    pub max_duration: u64,

    /// Maximum concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_session_ttl(),
            max_duration: default_session_max_duration(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl SessionConfig {
    /// Idle TTL as a [`Duration`].
    pub fn ttl_duration(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// Max lifetime as a [`Duration`].
    pub fn max_duration_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration)
    }
}

fn default_true() -> bool {
    true
}

fn default_session_ttl() -> u64 {
    600
}

fn default_session_max_duration() -> u64 {
    3600
}

fn default_max_sessions() -> usize {
    10
}

/// Credential proxy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Proxy mode: "embedded" (default), "standalone", or "remote".
    #[serde(default = "default_proxy_mode")]
    pub mode: String,

    /// Base URL of a remote proxy (remote mode).
    #[serde(default)]
    pub url: Option<String>,

    /// Listen address for the embedded/standalone proxy server.
    #[serde(default = "default_proxy_listen")]
    pub listen_addr: String,

    /// Per-execution capability token TTL in seconds. Should exceed the
    /// sandbox timeout with some slack.
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,

    /// OAuth settings for remote-mode authentication.
    #[serde(default)]
    pub auth: Option<ProxyAuthConfig>,

    /// JWT validator settings (standalone mode).
    #[serde(default)]
    pub jwt: Option<JwtValidatorConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: default_proxy_mode(),
            url: None,
            listen_addr: default_proxy_listen(),
            token_ttl: default_token_ttl(),
            auth: None,
            jwt: None,
        }
    }
}

fn default_proxy_mode() -> String {
    "embedded".to_string()
}

fn default_proxy_listen() -> String {
    "127.0.0.1:18081".to_string()
}

fn default_token_ttl() -> u64 {
    360
}

/// OAuth settings for authenticating against a remote proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyAuthConfig {
    /// OIDC issuer URL.
    pub issuer_url: String,

    /// OAuth client ID.
    pub client_id: String,
}

/// JWT validator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtValidatorConfig {
    /// URL to fetch the JWKS from.
    pub jwks_url: String,

    /// Expected token issuer. Empty disables the issuer check.
    #[serde(default)]
    pub issuer: String,

    /// Expected audience. Empty disables the audience check.
    #[serde(default)]
    pub audience: String,

    /// Allowed organizations/groups. Empty disables the group check.
    #[serde(default)]
    pub allowed_orgs: Vec<String>,

    /// JWKS refresh interval in seconds.
    #[serde(default = "default_jwks_refresh")]
    pub refresh_interval: u64,
}

fn default_jwks_refresh() -> u64 {
    3600
}

/// Rate limiting settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Backend: only "memory" is supported.
    #[serde(default = "default_rl_backend")]
    pub backend: String,

    /// Default rule applied when no per-tool rule matches.
    #[serde(default)]
    pub default: RateLimitRule,

    /// Per-tool rule overrides.
    #[serde(default)]
    pub per_tool: BTreeMap<String, RateLimitRule>,

    /// Trusted proxies (exact IPs or CIDR ranges) whose forwarding headers
    /// are honored when resolving the client IP.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: default_rl_backend(),
            default: RateLimitRule::default(),
            per_tool: BTreeMap::new(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_rl_backend() -> String {
    "memory".to_string()
}

/// A single rate-limit rule.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitRule {
    /// Maximum requests per second. Takes precedence over
    /// `requests_per_minute` when positive.
    #[serde(default)]
    pub requests_per_second: f64,

    /// Maximum requests per minute. Used when `requests_per_second` is unset.
    #[serde(default)]
    pub requests_per_minute: u32,

    /// Burst capacity. Defaults to the rate rounded up, never below 1.
    #[serde(default)]
    pub burst_size: u32,

    /// Block duration in seconds reported via `Retry-After`. Defaults to 60.
    #[serde(default)]
    pub block_duration: u64,
}

impl RateLimitRule {
    /// Effective fill rate in requests per second.
    pub fn effective_rate(&self) -> f64 {
        if self.requests_per_second > 0.0 {
            self.requests_per_second
        } else if self.requests_per_minute > 0 {
            f64::from(self.requests_per_minute) / 60.0
        } else {
            1.0
        }
    }

    /// Effective burst capacity.
    pub fn effective_burst(&self) -> u32 {
        if self.burst_size > 0 {
            self.burst_size
        } else {
            (self.effective_rate().ceil() as u32).max(1)
        }
    }

    /// Effective block duration.
    pub fn effective_block_duration(&self) -> Duration {
        if self.block_duration > 0 {
            Duration::from_secs(self.block_duration)
        } else {
            Duration::from_secs(60)
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Whether to expose Prometheus metrics.
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Listen address for the metrics endpoint.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9091".to_string()
}

/// Object storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// S3-compatible endpoint URL.
    pub endpoint: String,

    /// Access key (lives only in the proxy process).
    pub access_key: String,

    /// Secret key (lives only in the proxy process).
    pub secret_key: String,

    /// Bucket name.
    pub bucket: String,

    /// Signing region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Public URL prefix for uploaded objects (optional).
    #[serde(default)]
    pub public_url_prefix: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Config {
    /// Parse a config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a config from a YAML string, expanding `${ENV_VAR}` references.
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        Self::from_yaml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.sandbox.backend.as_str() {
            "process" | "docker" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.backend: unsupported backend '{other}', supported: process, docker"
                )));
            }
        }

        match self.rate_limit.backend.as_str() {
            "memory" | "" => {}
            "redis" => {
                return Err(ConfigError::Invalid(
                    "rate_limit.backend: 'redis' is not supported; use 'memory' \
                     or run one proxy replica per limit domain"
                        .to_string(),
                ));
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.backend: unknown backend '{other}'"
                )));
            }
        }

        match self.proxy.mode.as_str() {
            "embedded" | "standalone" => {}
            "remote" => {
                if self.proxy.url.is_none() {
                    return Err(ConfigError::Invalid(
                        "proxy.url is required when proxy.mode is 'remote'".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "proxy.mode: unsupported mode '{other}', supported: embedded, standalone, remote"
                )));
            }
        }

        if self.proxy.mode == "standalone" && self.proxy.jwt.is_none() {
            return Err(ConfigError::Invalid(
                "proxy.jwt is required when proxy.mode is 'standalone'".to_string(),
            ));
        }

        if self.sandbox.sessions.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.sessions.max_sessions must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{var_name}}}"));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
