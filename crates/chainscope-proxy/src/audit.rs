//! Audit logging for proxied requests.
//!
//! One structured log line per request: who, what, where, outcome, how long.
//! Query capture is opt-in and truncated, so audit logs stay bounded even
//! when callers send large SQL.

use std::time::Duration;

use crate::auth::AuthContext;

/// Auditor settings.
#[derive(Debug, Clone)]
pub struct AuditorConfig {
    /// Whether to include query content in audit entries.
    pub log_queries: bool,
    /// Maximum captured query length.
    pub max_query_length: usize,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            log_queries: false,
            max_query_length: 2048,
        }
    }
}

/// Emits audit entries for proxied requests.
pub struct Auditor {
    cfg: AuditorConfig,
}

impl Auditor {
    /// Create an auditor.
    pub fn new(cfg: AuditorConfig) -> Self {
        Self { cfg }
    }

    /// Log one completed request.
    pub fn record(
        &self,
        ctx: Option<&AuthContext>,
        method: &http::Method,
        uri: &http::Uri,
        status: http::StatusCode,
        elapsed: Duration,
    ) {
        let user_id = ctx.map(|c| c.user_id.as_str()).unwrap_or("");
        let email = ctx.and_then(|c| c.email.as_deref()).unwrap_or("");
        let datasource = datasource_from_path(uri.path());

        let query = if self.cfg.log_queries {
            self.extract_query(uri)
        } else {
            String::new()
        };

        tracing::info!(
            user_id,
            email,
            method = %method,
            path = uri.path(),
            datasource,
            query = %query,
            status = status.as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            "audit"
        );
    }

    fn extract_query(&self, uri: &http::Uri) -> String {
        let raw = uri.query().unwrap_or("");
        for pair in raw.split('&') {
            if let Some(value) = pair.strip_prefix("query=") {
                let mut query = value.to_string();
                if query.len() > self.cfg.max_query_length {
                    query.truncate(self.cfg.max_query_length);
                    query.push_str("...");
                }
                return query;
            }
        }
        String::new()
    }
}

/// Which datasource kind a path targets.
pub(crate) fn datasource_from_path(path: &str) -> &'static str {
    if path.starts_with("/clickhouse/") || path == "/clickhouse" {
        "clickhouse"
    } else if path.starts_with("/prometheus/") || path == "/prometheus" {
        "prometheus"
    } else if path.starts_with("/loki/") || path == "/loki" {
        "loki"
    } else if path.starts_with("/s3/") || path == "/s3" {
        "s3"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datasource_extraction_from_paths() {
        assert_eq!(datasource_from_path("/clickhouse/query"), "clickhouse");
        assert_eq!(datasource_from_path("/prometheus/api/v1/query"), "prometheus");
        assert_eq!(datasource_from_path("/loki/api/v1/query_range"), "loki");
        assert_eq!(datasource_from_path("/s3/bucket/key"), "s3");
        assert_eq!(datasource_from_path("/health"), "unknown");
    }

    #[test]
    fn query_capture_is_truncated() {
        let auditor = Auditor::new(AuditorConfig {
            log_queries: true,
            max_query_length: 8,
        });
        let uri: http::Uri = "/clickhouse/?query=SELECT+1+FROM+long_table"
            .parse()
            .unwrap();
        let q = auditor.extract_query(&uri);
        assert_eq!(q, "SELECT+1...");
    }

    #[test]
    fn missing_query_yields_empty() {
        let auditor = Auditor::new(AuditorConfig {
            log_queries: true,
            max_query_length: 64,
        });
        let uri: http::Uri = "/loki/api/v1/labels".parse().unwrap();
        assert_eq!(auditor.extract_query(&uri), "");
    }
}
