//! Observability infrastructure for the anomaly agent
//!
//! Provides:
//! - Prometheus metrics (cycle and fetch latency, anomaly counts, failure counters)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{Anomaly, Severity};

/// Histogram buckets for cycle and fetch latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    cycle_duration_seconds: Histogram,
    fetch_latency_seconds: Histogram,
    cycles_total: IntCounter,
    anomalies_detected: IntCounterVec,
    fetch_errors: IntCounter,
    enrichment_fallbacks: IntCounter,
    sink_failures: IntCounter,
    metrics_monitored: IntGauge,
    last_cycle_anomalies: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram!(
                "metrics_agent_cycle_duration_seconds",
                "Time spent running one detection cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            fetch_latency_seconds: register_histogram!(
                "metrics_agent_fetch_latency_seconds",
                "Time spent fetching one series from the metrics store",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fetch_latency_seconds"),

            cycles_total: register_int_counter!(
                "metrics_agent_cycles_total",
                "Total number of completed detection cycles"
            )
            .expect("Failed to register cycles_total"),

            anomalies_detected: register_int_counter_vec!(
                "metrics_agent_anomalies_detected_total",
                "Total number of anomalies detected",
                &["detector", "severity"]
            )
            .expect("Failed to register anomalies_detected"),

            fetch_errors: register_int_counter!(
                "metrics_agent_fetch_errors_total",
                "Total number of failed series fetches"
            )
            .expect("Failed to register fetch_errors"),

            enrichment_fallbacks: register_int_counter!(
                "metrics_agent_enrichment_fallbacks_total",
                "Cycles where enrichment failed and raw anomalies were kept"
            )
            .expect("Failed to register enrichment_fallbacks"),

            sink_failures: register_int_counter!(
                "metrics_agent_sink_failures_total",
                "Total number of failed anomaly deliveries"
            )
            .expect("Failed to register sink_failures"),

            metrics_monitored: register_int_gauge!(
                "metrics_agent_metrics_monitored",
                "Number of metrics analyzed each cycle"
            )
            .expect("Failed to register metrics_monitored"),

            last_cycle_anomalies: register_int_gauge!(
                "metrics_agent_last_cycle_anomalies",
                "Anomalies reported by the most recent cycle"
            )
            .expect("Failed to register last_cycle_anomalies"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// Record a finished cycle and its duration
    pub fn observe_cycle(&self, duration_secs: f64, anomalies: usize) {
        let inner = self.inner();
        inner.cycle_duration_seconds.observe(duration_secs);
        inner.cycles_total.inc();
        inner.last_cycle_anomalies.set(anomalies as i64);
    }

    pub fn observe_fetch_latency(&self, duration_secs: f64) {
        self.inner().fetch_latency_seconds.observe(duration_secs);
    }

    pub fn inc_anomalies_detected(&self, detector: &str, severity: Severity) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[detector, severity.as_str()])
            .inc();
    }

    pub fn inc_fetch_errors(&self) {
        self.inner().fetch_errors.inc();
    }

    pub fn inc_enrichment_fallbacks(&self) {
        self.inner().enrichment_fallbacks.inc();
    }

    pub fn inc_sink_failures(&self) {
        self.inner().sink_failures.inc();
    }

    pub fn set_metrics_monitored(&self, count: i64) {
        self.inner().metrics_monitored.set(count);
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for anomalies, cycle
/// summaries and delivery status.
#[derive(Clone)]
pub struct StructuredLogger {
    agent_name: String,
}

impl StructuredLogger {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Log an anomaly detection event
    pub fn log_anomaly(&self, anomaly: &Anomaly) {
        match anomaly.severity() {
            Severity::Critical => {
                warn!(
                    event = "anomaly_detected",
                    agent = %self.agent_name,
                    anomaly_id = %anomaly.id(),
                    metric = %anomaly.metric_name(),
                    detector = %anomaly.detector_name(),
                    kind = %anomaly.kind(),
                    severity = %anomaly.severity(),
                    value = anomaly.value(),
                    confidence = anomaly.confidence(),
                    "Critical anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    agent = %self.agent_name,
                    anomaly_id = %anomaly.id(),
                    metric = %anomaly.metric_name(),
                    detector = %anomaly.detector_name(),
                    kind = %anomaly.kind(),
                    severity = %anomaly.severity(),
                    value = anomaly.value(),
                    confidence = anomaly.confidence(),
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log the per-severity breakdown of a cycle
    pub fn log_cycle_summary(&self, total: usize, by_severity: &BTreeMap<Severity, usize>) {
        let count = |s: Severity| by_severity.get(&s).copied().unwrap_or(0);
        info!(
            event = "cycle_completed",
            agent = %self.agent_name,
            total = total,
            critical = count(Severity::Critical),
            high = count(Severity::High),
            medium = count(Severity::Medium),
            low = count(Severity::Low),
            "Detection cycle summary"
        );
    }

    /// Log delivery status with the orchestrator
    pub fn log_delivery(&self, delivered: bool, anomalies: usize) {
        if delivered {
            info!(
                event = "anomalies_delivered",
                agent = %self.agent_name,
                anomalies = anomalies,
                "Delivered anomalies to orchestrator"
            );
        } else {
            warn!(
                event = "anomalies_delivery_failed",
                agent = %self.agent_name,
                anomalies = anomalies,
                "Failed to deliver anomalies to orchestrator"
            );
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, metrics: usize, detectors: &[&str]) {
        info!(
            event = "agent_started",
            agent = %self.agent_name,
            agent_version = %version,
            metrics = metrics,
            detectors = ?detectors,
            "Metrics anomaly agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent = %self.agent_name,
            reason = %reason,
            "Metrics anomaly agent shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_creation() {
        let metrics = AgentMetrics::new();

        metrics.observe_cycle(0.25, 3);
        metrics.observe_fetch_latency(0.01);
        metrics.inc_anomalies_detected("spike_detector", Severity::High);
        metrics.inc_fetch_errors();
        metrics.inc_enrichment_fallbacks();
        metrics.inc_sink_failures();
        metrics.set_metrics_monitored(4);

        let clone = metrics.clone();
        clone.inc_anomalies_detected("spike_detector", Severity::High);
    }

    #[test]
    fn test_anomaly_counter_exported() {
        let metrics = AgentMetrics::new();
        metrics.inc_anomalies_detected("threshold_detector", Severity::Critical);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "metrics_agent_anomalies_detected_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("metrics-agent");
        assert_eq!(logger.agent_name(), "metrics-agent");
    }
}
