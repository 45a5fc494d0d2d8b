//! Outbound anomaly reports
//!
//! Converts anomalies into the wire format expected by the downstream
//! orchestrator and delivers them.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::anomaly::{PATTERN_DETECTOR, SPIKE_DETECTOR, STATISTICAL_DETECTOR, THRESHOLD_DETECTOR};
use crate::models::{Anomaly, Labels, Severity};

pub use http::HttpSink;

/// Value of the `source` field on every report
pub const REPORT_SOURCE: &str = "metrics";

/// Coarse routing hint derived from the detector that found the anomaly
pub fn suggested_category(detector: &str) -> &'static str {
    match detector {
        SPIKE_DETECTOR | STATISTICAL_DETECTOR => "performance",
        THRESHOLD_DETECTOR => "capacity",
        PATTERN_DETECTOR => "availability",
        _ => "unknown",
    }
}

/// Metric-level context attached to each report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportContext {
    pub metric_type: String,
    pub unit: String,
    pub lookback_window: String,
}

impl ReportContext {
    pub fn new(metric_type: impl Into<String>, unit: impl Into<String>, lookback_secs: u64) -> Self {
        Self {
            metric_type: metric_type.into(),
            unit: unit.into(),
            lookback_window: format!("{}s", lookback_secs),
        }
    }
}

/// Anomaly as delivered to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub anomaly_id: String,
    pub source: String,
    pub metric_name: String,
    pub labels: Labels,
    pub detector: String,
    pub anomaly_type: String,
    pub severity: Severity,
    pub description: String,
    pub observed_value: f64,
    pub expected_value: Option<f64>,
    pub threshold: Option<f64>,
    pub confidence: f64,
    pub start_time: String,
    pub end_time: String,
    pub context: ReportContext,
    pub suggested_category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_validated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
}

impl AnomalyReport {
    pub fn from_anomaly(anomaly: &Anomaly, context: &ReportContext) -> Self {
        let metadata = anomaly.metadata();
        let description = if anomaly.description().is_empty() {
            format!("{} detected", anomaly.kind())
        } else {
            anomaly.description().to_string()
        };

        Self {
            anomaly_id: anomaly.id().to_string(),
            source: REPORT_SOURCE.to_string(),
            metric_name: anomaly.metric_name().to_string(),
            labels: anomaly.labels().clone(),
            detector: anomaly.detector_name().to_string(),
            anomaly_type: anomaly.kind().as_str().to_string(),
            severity: anomaly.severity(),
            description,
            observed_value: anomaly.value(),
            expected_value: anomaly.expected_value(),
            threshold: metadata.get("threshold").and_then(Value::as_f64),
            confidence: (anomaly.confidence() * 100.0).round() / 100.0,
            start_time: anomaly.start_time().to_rfc3339(),
            end_time: anomaly.end_time().to_rfc3339(),
            context: context.clone(),
            suggested_category: suggested_category(anomaly.detector_name()).to_string(),
            llm_validated: metadata.get("llm_validated").and_then(Value::as_bool),
            llm_analysis: metadata
                .get("llm_analysis")
                .and_then(Value::as_str)
                .map(str::to_string),
            llm_model: metadata
                .get("llm_model")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// Body posted to the orchestrator for one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBatch {
    pub agent: String,
    pub timestamp: String,
    pub anomalies: Vec<AnomalyReport>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to reach orchestrator: {0}")]
    Transport(String),
    #[error("orchestrator rejected reports ({status}): {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait AnomalySink: Send + Sync {
    /// Deliver one cycle's reports
    async fn deliver(&self, reports: &[AnomalyReport]) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnomalyKind;
    use chrono::{TimeZone, Utc};

    fn context() -> ReportContext {
        ReportContext::new("gauge", "percent", 3600)
    }

    #[test]
    fn test_category_table() {
        assert_eq!(suggested_category(SPIKE_DETECTOR), "performance");
        assert_eq!(suggested_category(STATISTICAL_DETECTOR), "performance");
        assert_eq!(suggested_category(THRESHOLD_DETECTOR), "capacity");
        assert_eq!(suggested_category(PATTERN_DETECTOR), "availability");
        assert_eq!(suggested_category("custom_detector"), "unknown");
    }

    #[test]
    fn test_report_from_threshold_breach() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let anomaly = Anomaly::builder("cpu_usage", THRESHOLD_DETECTOR, AnomalyKind::ThresholdBreach)
            .at(at, 95.0)
            .expected(90.0)
            .severity(Severity::Critical)
            .confidence(1.0)
            .description("Threshold breach")
            .meta("threshold", 90.0)
            .build()
            .unwrap();

        let report = AnomalyReport::from_anomaly(&anomaly, &context());

        assert_eq!(report.anomaly_id, anomaly.id().to_string());
        assert_eq!(report.source, "metrics");
        assert_eq!(report.detector, THRESHOLD_DETECTOR);
        assert_eq!(report.anomaly_type, "threshold_breach");
        assert_eq!(report.threshold, Some(90.0));
        assert_eq!(report.expected_value, Some(90.0));
        assert_eq!(report.suggested_category, "capacity");
        assert_eq!(report.start_time, report.end_time);
        assert_eq!(report.start_time, "2024-01-01T12:00:00+00:00");
        assert_eq!(report.context.lookback_window, "3600s");
        assert_eq!(report.llm_analysis, None);
    }

    #[test]
    fn test_report_rounds_confidence_and_copies_llm_fields() {
        let mut anomaly = Anomaly::builder("latency", SPIKE_DETECTOR, AnomalyKind::Drop)
            .at(Utc::now(), 10.0)
            .confidence(0.66666)
            .build()
            .unwrap();
        anomaly.annotate("llm_validated", true);
        anomaly.annotate("llm_analysis", "Real drop");
        anomaly.annotate("llm_model", "openai/gpt-oss-120b");

        let report = AnomalyReport::from_anomaly(&anomaly, &context());

        assert_eq!(report.confidence, 0.67);
        assert_eq!(report.description, "drop detected");
        assert_eq!(report.threshold, None);
        assert_eq!(report.llm_validated, Some(true));
        assert_eq!(report.llm_analysis.as_deref(), Some("Real drop"));
        assert_eq!(report.llm_model.as_deref(), Some("openai/gpt-oss-120b"));
    }

    #[test]
    fn test_report_omits_absent_llm_fields() {
        let anomaly = Anomaly::builder("m", PATTERN_DETECTOR, AnomalyKind::PatternAnomaly)
            .at(Utc::now(), 1.0)
            .confidence(0.5)
            .build()
            .unwrap();

        let json = serde_json::to_value(AnomalyReport::from_anomaly(&anomaly, &context())).unwrap();
        assert!(json.get("llm_analysis").is_none());
        assert_eq!(json["severity"], "low");
        assert!(json["expected_value"].is_null());
    }
}
