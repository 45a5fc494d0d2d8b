//! Core data models for the anomaly agent
//!
//! A [`Series`] is the unit every detector reads; an [`Anomaly`] is the
//! normalized record every detector emits.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Label set attached to a sample
pub type Labels = BTreeMap<String, String>;

/// Detector-specific evidence attached to an anomaly
pub type Metadata = BTreeMap<String, Value>;

/// Metric type as reported by the metrics store (informational only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    #[default]
    Gauge,
    Histogram,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single timestamped observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub labels: Labels,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            labels: Labels::new(),
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

/// Ordered samples for one metric over one collection window
///
/// Insertion order is chronological order. Detectors index samples by
/// position and never reorder them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Query that produced the series
    pub name: String,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

impl Series {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            samples: Vec::new(),
        }
    }

    pub fn with_samples(mut self, samples: Vec<Sample>) -> Self {
        self.samples = samples;
        self
    }

    /// Append a sample at the end of the series
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64, labels: Labels) {
        self.samples.push(Sample {
            timestamp,
            value,
            labels,
        });
    }

    /// Values only, in sample order
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }
}

/// Anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    Drop,
    StatisticalOutlier,
    ThresholdBreach,
    PatternAnomaly,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Spike => "spike",
            AnomalyKind::Drop => "drop",
            AnomalyKind::StatisticalOutlier => "statistical_outlier",
            AnomalyKind::ThresholdBreach => "threshold_breach",
            AnomalyKind::PatternAnomaly => "pattern_anomaly",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity levels, ordered from least to most important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected anomaly construction
///
/// Every variant indicates a detector bug rather than a runtime condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnomalyError {
    #[error("confidence must be within [0.0, 1.0], got {0}")]
    ConfidenceOutOfRange(f64),
    #[error("observed value must be finite, got {0}")]
    NonFiniteValue(f64),
    #[error("anomaly for metric '{0}' has no timestamp")]
    MissingTimestamp(String),
}

/// Normalized, detector-agnostic record of one abnormal observation
///
/// Only constructed through [`Anomaly::builder`]. The only mutation allowed
/// after construction is [`Anomaly::annotate`], used by the enrichment stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    id: Uuid,
    metric_name: String,
    detector_name: String,
    kind: AnomalyKind,
    severity: Severity,
    confidence: f64,
    value: f64,
    expected_value: Option<f64>,
    timestamp: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    description: String,
    metadata: Metadata,
    labels: Labels,
}

impl Anomaly {
    /// Start building an anomaly for `metric_name` found by `detector_name`
    pub fn builder(
        metric_name: impl Into<String>,
        detector_name: impl Into<String>,
        kind: AnomalyKind,
    ) -> AnomalyBuilder {
        AnomalyBuilder {
            metric_name: metric_name.into(),
            detector_name: detector_name.into(),
            kind,
            severity: Severity::Low,
            confidence: 0.0,
            value: 0.0,
            expected_value: None,
            timestamp: None,
            start_time: None,
            end_time: None,
            description: String::new(),
            metadata: Metadata::new(),
            labels: Labels::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn detector_name(&self) -> &str {
        &self.detector_name
    }

    pub fn kind(&self) -> AnomalyKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn expected_value(&self) -> Option<f64> {
        self.expected_value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Start of the anomalous interval (the sample timestamp when unset)
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time.unwrap_or(self.timestamp)
    }

    /// End of the anomalous interval (the sample timestamp when unset)
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.timestamp)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Percent deviation from the expected value
    ///
    /// Absent when there is no expected value or it is zero.
    pub fn deviation(&self) -> Option<f64> {
        match self.expected_value {
            Some(expected) if expected != 0.0 => {
                Some((self.value - expected) / expected * 100.0)
            }
            _ => None,
        }
    }

    /// Append an enrichment field to the metadata bag
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}

impl Serialize for Anomaly {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Anomaly", 15)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("metric_name", &self.metric_name)?;
        state.serialize_field("detector_name", &self.detector_name)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("severity", &self.severity)?;
        state.serialize_field("confidence", &self.confidence)?;
        state.serialize_field("value", &self.value)?;
        state.serialize_field("expected_value", &self.expected_value)?;
        state.serialize_field(
            "deviation_percent",
            &self.deviation().map(|d| (d * 100.0).round() / 100.0),
        )?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("start_time", &self.start_time())?;
        state.serialize_field("end_time", &self.end_time())?;
        state.serialize_field("description", &self.description)?;
        state.serialize_field("metadata", &self.metadata)?;
        state.serialize_field("labels", &self.labels)?;
        state.end()
    }
}

/// Shared construction helper for all detectors
#[derive(Debug, Clone)]
pub struct AnomalyBuilder {
    metric_name: String,
    detector_name: String,
    kind: AnomalyKind,
    severity: Severity,
    confidence: f64,
    value: f64,
    expected_value: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    description: String,
    metadata: Metadata,
    labels: Labels,
}

impl AnomalyBuilder {
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Take timestamp, value and labels from the anomalous sample
    pub fn observed(mut self, sample: &Sample) -> Self {
        self.timestamp = Some(sample.timestamp);
        self.value = sample.value;
        self.labels = sample.labels.clone();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>, value: f64) -> Self {
        self.timestamp = Some(timestamp);
        self.value = value;
        self
    }

    pub fn expected(mut self, expected_value: f64) -> Self {
        self.expected_value = Some(expected_value);
        self
    }

    pub fn window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Validate and create the anomaly with a fresh identifier
    pub fn build(self) -> Result<Anomaly, AnomalyError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(AnomalyError::ConfidenceOutOfRange(self.confidence));
        }
        if !self.value.is_finite() {
            return Err(AnomalyError::NonFiniteValue(self.value));
        }
        let timestamp = self
            .timestamp
            .ok_or_else(|| AnomalyError::MissingTimestamp(self.metric_name.clone()))?;

        Ok(Anomaly {
            id: Uuid::new_v4(),
            metric_name: self.metric_name,
            detector_name: self.detector_name,
            kind: self.kind,
            severity: self.severity,
            confidence: self.confidence,
            value: self.value,
            expected_value: self.expected_value,
            timestamp,
            start_time: self.start_time,
            end_time: self.end_time,
            description: self.description,
            metadata: self.metadata,
            labels: self.labels,
        })
    }
}
