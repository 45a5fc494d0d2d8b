//! Static bound checks
//!
//! Bounds are resolved per metric from an ordered rule list: an exact name
//! match wins, otherwise the first wildcard pattern that matches.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ConfigError, Detector, THRESHOLD_DETECTOR};
use crate::models::{Anomaly, AnomalyError, AnomalyKind, Sample, Series, Severity};

/// Bound set for one metric; every bound is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdBounds {
    pub critical: Option<f64>,
    pub warning: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub max_rate: Option<f64>,
    pub min_rate: Option<f64>,
}

impl ThresholdBounds {
    pub fn is_empty(&self) -> bool {
        self.checks().iter().all(|(_, bound)| bound.is_none())
    }

    /// Bounds in evaluation order
    fn checks(&self) -> [(BoundKind, Option<f64>); 6] {
        [
            (BoundKind::Critical, self.critical),
            (BoundKind::Warning, self.warning),
            (BoundKind::Max, self.max),
            (BoundKind::Min, self.min),
            (BoundKind::MaxRate, self.max_rate),
            (BoundKind::MinRate, self.min_rate),
        ]
    }

    /// First bound breached by `value`
    fn first_breach(&self, value: f64) -> Option<(BoundKind, f64)> {
        self.checks().into_iter().find_map(|(kind, bound)| {
            let bound = bound?;
            let breached = if kind.is_lower() {
                value < bound
            } else {
                value >= bound
            };
            breached.then_some((kind, bound))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundKind {
    Critical,
    Warning,
    Max,
    Min,
    MaxRate,
    MinRate,
}

impl BoundKind {
    fn as_str(&self) -> &'static str {
        match self {
            BoundKind::Critical => "critical",
            BoundKind::Warning => "warning",
            BoundKind::Max => "max",
            BoundKind::Min => "min",
            BoundKind::MaxRate => "max_rate",
            BoundKind::MinRate => "min_rate",
        }
    }

    fn is_lower(&self) -> bool {
        matches!(self, BoundKind::Min | BoundKind::MinRate)
    }

    fn severity(&self) -> Severity {
        match self {
            BoundKind::Critical => Severity::Critical,
            BoundKind::Warning | BoundKind::Max | BoundKind::MaxRate => Severity::High,
            BoundKind::Min | BoundKind::MinRate => Severity::Medium,
        }
    }
}

/// Bounds applied to metrics whose name matches `metric`
///
/// `metric` is either an exact name or a pattern where `*` matches any
/// run of characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,
    #[serde(default)]
    pub bounds: ThresholdBounds,
}

impl ThresholdRule {
    pub fn new(metric: impl Into<String>, bounds: ThresholdBounds) -> Self {
        Self {
            metric: metric.into(),
            bounds,
        }
    }

    fn is_pattern(&self) -> bool {
        self.metric.contains('*')
    }

    /// Compile the rule's metric into a matcher
    pub fn matcher(&self) -> Result<MetricMatcher, ConfigError> {
        MetricMatcher::new(&self.metric)
    }
}

/// Compiled form of a rule's `metric`
///
/// Only `*` is a wildcard. Every other character, including the `[`, `?`
/// and `(` that show up in PromQL expressions, matches literally.
#[derive(Debug, Clone)]
pub enum MetricMatcher {
    Exact(String),
    Pattern(Pattern),
}

impl MetricMatcher {
    pub fn new(metric: &str) -> Result<Self, ConfigError> {
        if !metric.contains('*') {
            return Ok(MetricMatcher::Exact(metric.to_string()));
        }

        let mut glob = String::with_capacity(metric.len());
        for (i, literal) in metric.split('*').enumerate() {
            // runs of `*` collapse to one; glob rejects `**` inside a component
            if i > 0 && !glob.ends_with('*') {
                glob.push('*');
            }
            glob.push_str(&Pattern::escape(literal));
        }

        Pattern::new(&glob)
            .map(MetricMatcher::Pattern)
            .map_err(|e| ConfigError::InvalidThresholdPattern {
                pattern: metric.to_string(),
                reason: e.msg.to_string(),
            })
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, MetricMatcher::Pattern(_))
    }

    /// Whole-string match against a metric name
    pub fn matches(&self, name: &str) -> bool {
        match self {
            MetricMatcher::Exact(metric) => metric == name,
            MetricMatcher::Pattern(pattern) => pattern.matches(name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub enabled: bool,
    pub rules: Vec<ThresholdRule>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.iter().any(|r| r.metric.trim().is_empty()) {
            return Err(ConfigError::EmptyThresholdPattern);
        }
        for rule in &self.rules {
            rule.matcher()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    matcher: MetricMatcher,
    bounds: ThresholdBounds,
}

/// Compares each sample against the bounds configured for its metric
#[derive(Debug, Clone, Default)]
pub struct ThresholdDetector {
    rules: Vec<CompiledRule>,
}

impl ThresholdDetector {
    pub fn new(config: ThresholdConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rules = config
            .rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    matcher: rule.matcher()?,
                    bounds: rule.bounds,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules })
    }

    /// Register exact-name bounds ahead of the configured rules
    pub fn with_metric_bounds(mut self, metric: impl Into<String>, bounds: ThresholdBounds) -> Self {
        let rule = CompiledRule {
            matcher: MetricMatcher::Exact(metric.into()),
            bounds,
        };
        self.rules.insert(0, rule);
        self
    }

    /// Bounds for a metric: exact match first, then the first matching pattern
    pub fn resolve(&self, metric: &str) -> Option<&ThresholdBounds> {
        self.rules
            .iter()
            .find(|r| !r.matcher.is_pattern() && r.matcher.matches(metric))
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|r| r.matcher.is_pattern() && r.matcher.matches(metric))
            })
            .map(|r| &r.bounds)
    }

    fn breach(
        series: &Series,
        sample: &Sample,
        kind: BoundKind,
        bound: f64,
    ) -> Result<Anomaly, AnomalyError> {
        let excess = if kind.is_lower() {
            bound - sample.value
        } else {
            sample.value - bound
        };
        let excess_percent = if bound != 0.0 {
            excess / bound * 100.0
        } else {
            0.0
        };
        let comparison = if kind.is_lower() { "below" } else { "at or above" };

        Anomaly::builder(&series.name, THRESHOLD_DETECTOR, AnomalyKind::ThresholdBreach)
            .observed(sample)
            .severity(kind.severity())
            .confidence(1.0)
            .expected(bound)
            .description(format!(
                "Threshold breach: value {:.2} {} {} threshold {:.2}",
                sample.value,
                comparison,
                kind.as_str(),
                bound
            ))
            .meta("threshold_type", kind.as_str())
            .meta("threshold_value", bound)
            .meta("threshold", bound)
            .meta("excess", excess)
            .meta("excess_percent", excess_percent)
            .build()
    }
}

impl Detector for ThresholdDetector {
    fn name(&self) -> &'static str {
        THRESHOLD_DETECTOR
    }

    fn detect(&self, series: &Series) -> Result<Vec<Anomaly>, AnomalyError> {
        let Some(bounds) = self.resolve(&series.name) else {
            debug!(
                detector = THRESHOLD_DETECTOR,
                metric = %series.name,
                "No thresholds configured for metric"
            );
            return Ok(Vec::new());
        };

        let mut anomalies = Vec::new();
        for sample in &series.samples {
            if let Some((kind, bound)) = bounds.first_breach(sample.value) {
                anomalies.push(Self::breach(series, sample, kind, bound)?);
            }
        }

        debug!(
            detector = THRESHOLD_DETECTOR,
            metric = %series.name,
            samples = series.len(),
            anomalies = anomalies.len(),
            "Threshold detection complete"
        );

        Ok(anomalies)
    }
}
