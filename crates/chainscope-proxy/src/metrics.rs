//! Prometheus metrics for the credential proxy.
//!
//! Registries are constructed at startup and passed to the server — there is
//! no ambient global state.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Label set for proxied requests.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Datasource kind: "clickhouse", "prometheus", "loki", "s3".
    pub kind: String,
    /// Response status class: "2xx", "4xx", "5xx".
    pub status: String,
}

/// Proxy-wide metrics.
pub struct ProxyMetrics {
    /// Total proxied requests by kind and status class.
    pub requests_total: Family<RequestLabels, Counter>,
    /// Requests denied by the rate limiter.
    pub rate_limited_total: Counter,
    /// Requests rejected by authentication.
    pub auth_failures_total: Counter,
}

impl ProxyMetrics {
    /// Create the metrics and register them with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::default();
        registry.register(
            "chainscope_proxy_requests",
            "Total proxied requests",
            requests_total.clone(),
        );

        let rate_limited_total = Counter::default();
        registry.register(
            "chainscope_proxy_rate_limited",
            "Requests denied by the rate limiter",
            rate_limited_total.clone(),
        );

        let auth_failures_total = Counter::default();
        registry.register(
            "chainscope_proxy_auth_failures",
            "Requests rejected by authentication",
            auth_failures_total.clone(),
        );

        Self {
            requests_total,
            rate_limited_total,
            auth_failures_total,
        }
    }

    /// Record one proxied request.
    pub fn record_request(&self, kind: &str, status: http::StatusCode) {
        let class = match status.as_u16() {
            200..=299 => "2xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.requests_total
            .get_or_create(&RequestLabels {
                kind: kind.to_string(),
                status: class.to_string(),
            })
            .inc();
    }
}
