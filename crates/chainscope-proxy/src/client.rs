//! The in-process counterpart to the proxy server.
//!
//! Two modes:
//!
//! - **Embedded**: the proxy runs in this process; tokens are minted and
//!   revoked directly against the shared [`TokenStore`].
//! - **Remote**: the proxy runs elsewhere (K8s); the locally stored OAuth
//!   access token stands in for per-execution tokens, and datasources are
//!   discovered over `GET /datasources`.
//!
//! Until discovery first succeeds every accessor returns the empty set —
//! never a panic.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::server::ProxyServer;
use crate::tokens::TokenStore;
use crate::DatasourceSummary;

/// A locally stored OAuth credential.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    /// The access token.
    pub access_token: String,
    /// Expiry, when known.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Source of locally stored OAuth credentials. The PKCE login flow and the
/// on-disk store live outside this crate; they plug in through this trait.
pub trait CredentialSource: Send + Sync {
    /// The current credential, if any.
    fn credential(&self) -> Option<StoredCredential>;
}

/// Proxy client variants. Resolved by capability, not construction order:
/// the plugin registry can wire either without knowing which mode is active.
pub enum ProxyClient {
    /// Proxy in this process.
    Embedded(EmbeddedProxyClient),
    /// Proxy elsewhere; auth via stored OAuth token.
    Remote(RemoteProxyClient),
}

impl ProxyClient {
    /// Mode name for logging.
    pub fn mode(&self) -> &'static str {
        match self {
            ProxyClient::Embedded(_) => "embedded",
            ProxyClient::Remote(_) => "remote",
        }
    }

    /// Start the client. Remote mode performs one discovery round; a failure
    /// is logged and retried lazily rather than fatal.
    pub async fn start(&self) {
        if let ProxyClient::Remote(remote) = self {
            if let Err(err) = remote.refresh_datasources().await {
                tracing::warn!(error = %err, "initial datasource discovery failed");
            }
        }
    }

    /// The proxy base URL for sandbox code.
    pub fn url(&self) -> String {
        match self {
            ProxyClient::Embedded(c) => c.server.url(),
            ProxyClient::Remote(c) => c.base_url.clone(),
        }
    }

    /// Mint a per-execution token.
    ///
    /// Remote mode returns the stored access token (the remote proxy
    /// validates JWTs, not capability tokens); an empty string when no
    /// credential is stored.
    pub fn register_token(&self, execution_id: &str) -> String {
        match self {
            ProxyClient::Embedded(c) => c.tokens.register(execution_id),
            ProxyClient::Remote(c) => match c.credentials.credential() {
                Some(cred) => cred.access_token,
                None => {
                    tracing::error!("no stored access token for remote proxy");
                    String::new()
                }
            },
        }
    }

    /// Revoke a per-execution token. No-op in remote mode — JWTs expire
    /// naturally and are managed by the OIDC provider.
    pub fn revoke_token(&self, execution_id: &str) {
        if let ProxyClient::Embedded(c) = self {
            c.tokens.revoke(execution_id);
        }
    }

    /// Verify a usable credential exists, returning a precise
    /// log-in-instruction error otherwise. Embedded mode always succeeds.
    pub fn ensure_authenticated(&self) -> anyhow::Result<()> {
        match self {
            ProxyClient::Embedded(_) => Ok(()),
            ProxyClient::Remote(c) => c.ensure_authenticated(),
        }
    }

    /// Current discovery document.
    pub fn datasource_summary(&self) -> DatasourceSummary {
        match self {
            ProxyClient::Embedded(c) => c.server.datasource_summary(),
            ProxyClient::Remote(c) => c
                .discovered
                .read()
                .expect("discovery lock poisoned")
                .clone(),
        }
    }

    /// ClickHouse datasource names.
    pub fn clickhouse_datasources(&self) -> Vec<String> {
        self.datasource_summary().clickhouse
    }

    /// Prometheus datasource names.
    pub fn prometheus_datasources(&self) -> Vec<String> {
        self.datasource_summary().prometheus
    }

    /// Loki datasource names.
    pub fn loki_datasources(&self) -> Vec<String> {
        self.datasource_summary().loki
    }

    /// The S3 bucket name.
    pub fn s3_bucket(&self) -> String {
        self.datasource_summary().s3_bucket
    }
}

/// Client for a proxy running in this process.
pub struct EmbeddedProxyClient {
    server: Arc<ProxyServer>,
    tokens: Arc<TokenStore>,
}

impl EmbeddedProxyClient {
    /// Wire a client to an embedded server. The server must be in token
    /// auth mode.
    pub fn new(server: Arc<ProxyServer>) -> anyhow::Result<Self> {
        let tokens = server
            .token_store()
            .ok_or_else(|| anyhow::anyhow!("embedded proxy client requires token auth mode"))?;
        Ok(Self { server, tokens })
    }
}

/// Client for a proxy running elsewhere.
pub struct RemoteProxyClient {
    base_url: String,
    issuer_url: String,
    client_id: String,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    discovered: RwLock<DatasourceSummary>,
}

impl RemoteProxyClient {
    /// Create a remote client.
    pub fn new(
        base_url: impl Into<String>,
        issuer_url: impl Into<String>,
        client_id: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            issuer_url: issuer_url.into(),
            client_id: client_id.into(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            credentials,
            discovered: RwLock::new(DatasourceSummary::default()),
        }
    }

    /// Fetch `/datasources` and replace the cached discovery document.
    pub async fn refresh_datasources(&self) -> anyhow::Result<()> {
        let url = format!("{}/datasources", self.base_url);
        let summary: DatasourceSummary = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::debug!(
            clickhouse = summary.clickhouse.len(),
            prometheus = summary.prometheus.len(),
            loki = summary.loki.len(),
            "discovered remote datasources"
        );
        *self.discovered.write().expect("discovery lock poisoned") = summary;
        Ok(())
    }

    fn ensure_authenticated(&self) -> anyhow::Result<()> {
        let login_hint = format!(
            "run 'chainscope auth login --issuer {} --client-id {}' first",
            self.issuer_url, self.client_id
        );

        match self.credentials.credential() {
            None => anyhow::bail!("not authenticated to remote proxy; {login_hint}"),
            Some(cred) => {
                if let Some(expires_at) = cred.expires_at {
                    if expires_at <= Utc::now() {
                        anyhow::bail!("stored access token is expired; {login_hint}");
                    }
                }
                Ok(())
            }
        }
    }
}
