//! Per-execution token issuance.
//!
//! For every sandbox run: mint a capability token bound to the execution id,
//! assemble the credential-free environment (plugin metadata + proxy URL +
//! the token), and revoke the token the moment the run completes. If a
//! revoke is ever missed (process crash mid-run), the token store's TTL
//! sweep is the backstop.

use std::collections::HashMap;
use std::sync::Arc;

use chainscope_plugin::PluginRegistry;
use chainscope_proxy::ProxyClient;

/// Env var carrying the proxy base URL into the sandbox.
pub const ENV_PROXY_URL: &str = "ETHPANDAOPS_PROXY_URL";
/// Env var carrying the per-execution capability token into the sandbox.
pub const ENV_PROXY_TOKEN: &str = "ETHPANDAOPS_PROXY_TOKEN";

/// Mints per-execution tokens and assembles the sandbox environment.
pub struct ExecutionIssuer {
    proxy: Arc<ProxyClient>,
    registry: Arc<PluginRegistry>,
}

impl ExecutionIssuer {
    /// Wire the issuer to the proxy client and plugin registry.
    pub fn new(proxy: Arc<ProxyClient>, registry: Arc<PluginRegistry>) -> Self {
        Self { proxy, registry }
    }

    /// The proxy client.
    pub fn proxy(&self) -> &Arc<ProxyClient> {
        &self.proxy
    }

    /// The plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Build the environment for one execution: merged plugin env (metadata
    /// only, no credentials), the proxy URL, and a fresh capability token
    /// bound to `execution_id`.
    pub fn sandbox_env(&self, execution_id: &str) -> HashMap<String, String> {
        let mut env = self.registry.sandbox_env();
        env.insert(ENV_PROXY_URL.to_string(), self.proxy.url());
        env.insert(
            ENV_PROXY_TOKEN.to_string(),
            self.proxy.register_token(execution_id),
        );
        env
    }

    /// Revoke the execution's token. Idempotent.
    pub fn revoke(&self, execution_id: &str) {
        self.proxy.revoke_token(execution_id);
    }
}
