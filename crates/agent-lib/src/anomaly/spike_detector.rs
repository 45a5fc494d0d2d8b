//! Sudden change detection
//!
//! Compares each sample with its immediate predecessor and flags relative
//! changes at or above a minimum percentage.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::stats::round_to;
use super::{ConfigError, Detector, SPIKE_DETECTOR};
use crate::models::{Anomaly, AnomalyError, AnomalyKind, Series, Severity};

/// Percent change assumed when a series leaves zero
const CHANGE_FROM_ZERO_PERCENT: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    pub enabled: bool,
    /// Scales confidence, in `[0, 1]`
    pub sensitivity: f64,
    /// Smallest absolute percent change that is reported
    pub min_change_percent: f64,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: 0.8,
            min_change_percent: 50.0,
        }
    }
}

impl SpikeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(ConfigError::InvalidSensitivity(self.sensitivity));
        }
        if !(self.min_change_percent >= 0.0) {
            return Err(ConfigError::InvalidMinChange(self.min_change_percent));
        }
        Ok(())
    }
}

/// Detects spikes and drops between consecutive samples
#[derive(Debug, Clone)]
pub struct SpikeDetector {
    config: SpikeConfig,
}

impl SpikeDetector {
    pub fn new(config: SpikeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SpikeConfig {
        &self.config
    }

    /// Relative change from `previous` to `current`, `None` when both are zero
    fn percent_change(previous: f64, current: f64) -> Option<f64> {
        if previous == 0.0 {
            if current == 0.0 {
                None
            } else {
                Some(CHANGE_FROM_ZERO_PERCENT)
            }
        } else {
            Some((current - previous) / previous * 100.0)
        }
    }

    fn severity(abs_change: f64) -> Severity {
        if abs_change >= 200.0 {
            Severity::Critical
        } else if abs_change >= 100.0 {
            Severity::High
        } else if abs_change >= 75.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl Default for SpikeDetector {
    fn default() -> Self {
        Self {
            config: SpikeConfig::default(),
        }
    }
}

impl Detector for SpikeDetector {
    fn name(&self) -> &'static str {
        SPIKE_DETECTOR
    }

    fn detect(&self, series: &Series) -> Result<Vec<Anomaly>, AnomalyError> {
        let mut anomalies = Vec::new();

        for pair in series.samples.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            let Some(change) = Self::percent_change(previous.value, current.value) else {
                continue;
            };
            let abs_change = change.abs();
            if abs_change < self.config.min_change_percent {
                continue;
            }

            let (kind, direction) = if change > 0.0 {
                (AnomalyKind::Spike, "Spike")
            } else {
                (AnomalyKind::Drop, "Drop")
            };
            let confidence = (abs_change / 100.0).min(1.0) * self.config.sensitivity;

            let anomaly = Anomaly::builder(&series.name, SPIKE_DETECTOR, kind)
                .observed(current)
                .severity(Self::severity(abs_change))
                .confidence(confidence)
                .expected(previous.value)
                .description(format!(
                    "{} detected: {:.1}% change from {:.2} to {:.2}",
                    direction, change, previous.value, current.value
                ))
                .meta("percent_change", round_to(change, 2))
                .meta("previous_value", previous.value)
                .meta("change_magnitude", abs_change)
                .meta("threshold", self.config.min_change_percent)
                .build()?;
            anomalies.push(anomaly);
        }

        debug!(
            detector = SPIKE_DETECTOR,
            metric = %series.name,
            samples = series.len(),
            anomalies = anomalies.len(),
            "Spike detection complete"
        );

        Ok(anomalies)
    }
}
