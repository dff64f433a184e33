//! Prometheus metrics for the MCP tool surface.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    /// The backend that ran the code: "process" or "docker".
    pub backend: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The sandbox error kind.
    pub error_kind: String,
}

/// Tool-call metrics.
pub struct ServerMetrics {
    /// Total executions.
    pub executions_total: Family<ExecutionLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Family<ExecutionLabels, Histogram>,
    /// Total execution errors by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
}

impl ServerMetrics {
    /// Create the metrics and register them with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "chainscope_executions",
            "Total sandbox executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<ExecutionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0].into_iter())
            });
        registry.register(
            "chainscope_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "chainscope_execution_errors",
            "Total sandbox errors by kind",
            errors_total.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
        }
    }

    /// Record a completed execution.
    pub fn record_execution(&self, backend: &str, duration_secs: f64) {
        let labels = ExecutionLabels {
            backend: backend.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record an execution error.
    pub fn record_error(&self, error_kind: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                error_kind: error_kind.to_string(),
            })
            .inc();
    }
}
