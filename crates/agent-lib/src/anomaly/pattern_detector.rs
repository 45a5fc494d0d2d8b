//! Shape-based detection
//!
//! Two passes over the series: trend reversals found in the smoothed
//! gradient, and samples far from their trailing moving average.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::stats::{self, round_to};
use super::{ConfigError, Detector, PATTERN_DETECTOR};
use crate::models::{Anomaly, AnomalyError, AnomalyKind, Series, Severity};

/// Samples taken on each side of a reversal to measure the trend
const TREND_CONTEXT: usize = 5;

/// Moving-average deviations (in standard deviations) above this are flagged
const MA_DEVIATION_THRESHOLD: f64 = 2.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub enabled: bool,
    /// Smoothing and moving-average window, in samples
    pub window_size: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 24,
        }
    }
}

impl PatternConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < 2 {
            return Err(ConfigError::InvalidWindowSize(self.window_size));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrendType {
    RisingToFalling,
    FallingToRising,
}

impl TrendType {
    fn classify(before: f64, after: f64) -> Option<Self> {
        if before > 0.0 && after < 0.0 {
            Some(TrendType::RisingToFalling)
        } else if before < 0.0 && after > 0.0 {
            Some(TrendType::FallingToRising)
        } else {
            None
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TrendType::RisingToFalling => "rising_to_falling",
            TrendType::FallingToRising => "falling_to_rising",
        }
    }
}

/// Detects trend reversals and moving-average deviations
#[derive(Debug, Clone)]
pub struct PatternDetector {
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    fn trend_changes(&self, series: &Series, values: &[f64]) -> Result<Vec<Anomaly>, AnomalyError> {
        let gradient = stats::gradient(values);
        let gradient_std = match stats::population_std(&gradient) {
            Some(std) if std > 0.0 => std,
            _ => return Ok(Vec::new()),
        };

        let width = (self.config.window_size / 2).max(1);
        let smoothed = stats::moving_average(&gradient, width);

        let mut anomalies = Vec::new();
        for (idx, pair) in smoothed.windows(2).enumerate() {
            if stats::sign(pair[0]) == stats::sign(pair[1]) {
                continue;
            }

            // Map the smoothed index back onto the original series
            let pivot = idx + width / 2 + 1;
            if pivot >= values.len() {
                continue;
            }

            let before = &gradient[pivot.saturating_sub(TREND_CONTEXT)..pivot];
            let after = &gradient[pivot..(pivot + TREND_CONTEXT).min(gradient.len())];
            let (Some(before), Some(after)) = (stats::mean(before), stats::mean(after)) else {
                continue;
            };
            let Some(trend) = TrendType::classify(before, after) else {
                continue;
            };

            let sample = &series.samples[pivot];
            let confidence = ((after - before).abs() / gradient_std).min(1.0);

            anomalies.push(
                Anomaly::builder(&series.name, PATTERN_DETECTOR, AnomalyKind::PatternAnomaly)
                    .observed(sample)
                    .severity(Severity::Medium)
                    .confidence(confidence)
                    .description(format!(
                        "Trend change: {} (gradient {:.3} -> {:.3})",
                        trend.as_str().replace('_', " "),
                        before,
                        after
                    ))
                    .meta("detection_method", "trend_change")
                    .meta("trend_before", round_to(before, 4))
                    .meta("trend_after", round_to(after, 4))
                    .meta("trend_type", trend.as_str())
                    .build()?,
            );
        }
        Ok(anomalies)
    }

    fn moving_average_deviations(
        &self,
        series: &Series,
        values: &[f64],
    ) -> Result<Vec<Anomaly>, AnomalyError> {
        let window = self.config.window_size;
        let mut anomalies = Vec::new();

        for (i, sample) in series.samples.iter().enumerate().skip(window) {
            let trailing = &values[i - window..i];
            let (Some(average), Some(std_dev)) =
                (stats::mean(trailing), stats::population_std(trailing))
            else {
                continue;
            };
            if std_dev == 0.0 {
                continue;
            }

            let deviation = (sample.value - average).abs() / std_dev;
            if deviation <= MA_DEVIATION_THRESHOLD {
                continue;
            }

            let severity = if deviation >= 4.0 {
                Severity::High
            } else if deviation >= 3.0 {
                Severity::Medium
            } else {
                Severity::Low
            };

            anomalies.push(
                Anomaly::builder(&series.name, PATTERN_DETECTOR, AnomalyKind::PatternAnomaly)
                    .observed(sample)
                    .severity(severity)
                    .confidence((deviation / 5.0).min(1.0))
                    .expected(average)
                    .description(format!(
                        "Moving average deviation: {:.2} std from {:.2}",
                        deviation, average
                    ))
                    .meta("detection_method", "moving_average")
                    .meta("moving_average", average)
                    .meta("moving_std", std_dev)
                    .meta("deviation_sigma", round_to(deviation, 2))
                    .meta("threshold", MA_DEVIATION_THRESHOLD)
                    .build()?,
            );
        }
        Ok(anomalies)
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self {
            config: PatternConfig::default(),
        }
    }
}

impl Detector for PatternDetector {
    fn name(&self) -> &'static str {
        PATTERN_DETECTOR
    }

    fn detect(&self, series: &Series) -> Result<Vec<Anomaly>, AnomalyError> {
        if series.len() < self.config.window_size * 2 {
            debug!(
                detector = PATTERN_DETECTOR,
                metric = %series.name,
                samples = series.len(),
                required = self.config.window_size * 2,
                "Insufficient samples for pattern detection"
            );
            return Ok(Vec::new());
        }

        let values = series.values();
        let mut anomalies = self.trend_changes(series, &values)?;
        anomalies.extend(self.moving_average_deviations(series, &values)?);

        debug!(
            detector = PATTERN_DETECTOR,
            metric = %series.name,
            samples = series.len(),
            anomalies = anomalies.len(),
            "Pattern detection complete"
        );

        Ok(anomalies)
    }
}
