//! Anomaly detection over metric series
//!
//! This module provides:
//! - Spike and drop detection between consecutive samples
//! - Statistical outliers (z-score and IQR)
//! - Static threshold breaches
//! - Trend reversals and moving-average deviations

mod pattern_detector;
mod spike_detector;
mod statistical_detector;
pub mod stats;
mod threshold_detector;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::models::{Anomaly, AnomalyError, Series};

pub use pattern_detector::{PatternConfig, PatternDetector};
pub use spike_detector::{SpikeConfig, SpikeDetector};
pub use statistical_detector::{StatisticalConfig, StatisticalDetector};
pub use threshold_detector::{
    MetricMatcher, ThresholdBounds, ThresholdConfig, ThresholdDetector, ThresholdRule,
};

pub const SPIKE_DETECTOR: &str = "spike_detector";
pub const STATISTICAL_DETECTOR: &str = "statistical_detector";
pub const THRESHOLD_DETECTOR: &str = "threshold_detector";
pub const PATTERN_DETECTOR: &str = "pattern_detector";

/// Every known detector name, in default run order
pub const DETECTOR_NAMES: [&str; 4] = [
    SPIKE_DETECTOR,
    STATISTICAL_DETECTOR,
    THRESHOLD_DETECTOR,
    PATTERN_DETECTOR,
];

/// A pure analysis over one series
///
/// Implementations keep no state between calls. Degenerate input (too few
/// samples, zero spread) yields `Ok` with no anomalies; `Err` is reserved
/// for anomalies that fail construction.
pub trait Detector: Send + Sync {
    /// Stable identifier used in reports and configuration
    fn name(&self) -> &'static str;

    /// Analyze the series and return every anomaly found, in series order
    fn detect(&self, series: &Series) -> Result<Vec<Anomaly>, AnomalyError>;
}

/// Invalid detector configuration, reported at startup
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("sensitivity must be within [0.0, 1.0], got {0}")]
    InvalidSensitivity(f64),
    #[error("min_change_percent must be non-negative, got {0}")]
    InvalidMinChange(f64),
    #[error("z_score_threshold must be positive, got {0}")]
    InvalidZThreshold(f64),
    #[error("iqr_multiplier must be positive, got {0}")]
    InvalidIqrMultiplier(f64),
    #[error("window_size must be at least 2, got {0}")]
    InvalidWindowSize(usize),
    #[error("threshold rule has an empty metric pattern")]
    EmptyThresholdPattern,
    #[error("invalid threshold pattern '{pattern}': {reason}")]
    InvalidThresholdPattern { pattern: String, reason: String },
    #[error("unknown detector '{0}'")]
    UnknownDetector(String),
    #[error("detector '{0}' listed more than once")]
    DuplicateDetector(String),
}

/// Settings for all detectors plus their run order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorsConfig {
    pub order: Vec<String>,
    pub spike_detector: SpikeConfig,
    pub statistical_detector: StatisticalConfig,
    pub threshold_detector: ThresholdConfig,
    pub pattern_detector: PatternConfig,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            order: DETECTOR_NAMES.iter().map(|n| n.to_string()).collect(),
            spike_detector: SpikeConfig::default(),
            statistical_detector: StatisticalConfig::default(),
            threshold_detector: ThresholdConfig::default(),
            pattern_detector: PatternConfig::default(),
        }
    }
}

impl DetectorsConfig {
    /// Check every detector's settings and the run order
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::with_capacity(self.order.len());
        for name in &self.order {
            if !DETECTOR_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::UnknownDetector(name.clone()));
            }
            if seen.contains(&name) {
                return Err(ConfigError::DuplicateDetector(name.clone()));
            }
            seen.push(name);
        }

        self.spike_detector.validate()?;
        self.statistical_detector.validate()?;
        self.threshold_detector.validate()?;
        self.pattern_detector.validate()?;
        Ok(())
    }

    fn is_enabled(&self, name: &str) -> bool {
        match name {
            SPIKE_DETECTOR => self.spike_detector.enabled,
            STATISTICAL_DETECTOR => self.statistical_detector.enabled,
            THRESHOLD_DETECTOR => self.threshold_detector.enabled,
            PATTERN_DETECTOR => self.pattern_detector.enabled,
            _ => false,
        }
    }
}

/// Build the enabled detectors in configured order
///
/// `metric_bounds` are exact-name threshold rules that take precedence over
/// the configured rule list.
pub fn build_detectors(
    config: &DetectorsConfig,
    metric_bounds: Vec<ThresholdRule>,
) -> Result<Vec<Arc<dyn Detector>>, ConfigError> {
    config.validate()?;

    let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();
    for name in config.order.iter().filter(|n| config.is_enabled(n)) {
        let detector: Arc<dyn Detector> = match name.as_str() {
            SPIKE_DETECTOR => Arc::new(SpikeDetector::new(config.spike_detector.clone())?),
            STATISTICAL_DETECTOR => Arc::new(StatisticalDetector::new(
                config.statistical_detector.clone(),
            )?),
            THRESHOLD_DETECTOR => {
                let mut detector = ThresholdDetector::new(config.threshold_detector.clone())?;
                for rule in metric_bounds.iter().rev().filter(|r| !r.bounds.is_empty()) {
                    detector = detector.with_metric_bounds(rule.metric.clone(), rule.bounds.clone());
                }
                Arc::new(detector)
            }
            PATTERN_DETECTOR => Arc::new(PatternDetector::new(config.pattern_detector.clone())?),
            other => return Err(ConfigError::UnknownDetector(other.to_string())),
        };
        detectors.push(detector);
    }

    Ok(detectors)
}
