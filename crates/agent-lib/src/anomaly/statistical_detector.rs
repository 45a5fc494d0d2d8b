//! Distribution outlier detection
//!
//! Runs a z-score test and an interquartile range test over the whole
//! series, then keeps one candidate per timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::stats::{self, round_to};
use super::{ConfigError, Detector, STATISTICAL_DETECTOR};
use crate::models::{Anomaly, AnomalyError, AnomalyKind, Series, Severity};

/// Minimum samples required for either test
const MIN_SAMPLES_FOR_DETECTION: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticalConfig {
    pub enabled: bool,
    pub z_score_threshold: f64,
    pub iqr_multiplier: f64,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            z_score_threshold: 3.0,
            iqr_multiplier: 1.5,
        }
    }
}

impl StatisticalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.z_score_threshold > 0.0) {
            return Err(ConfigError::InvalidZThreshold(self.z_score_threshold));
        }
        if !(self.iqr_multiplier > 0.0) {
            return Err(ConfigError::InvalidIqrMultiplier(self.iqr_multiplier));
        }
        Ok(())
    }
}

/// Flags values far from the series' own distribution
#[derive(Debug, Clone)]
pub struct StatisticalDetector {
    config: StatisticalConfig,
}

impl StatisticalDetector {
    pub fn new(config: StatisticalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StatisticalConfig {
        &self.config
    }

    fn z_score_outliers(
        &self,
        series: &Series,
        values: &[f64],
    ) -> Result<Vec<Anomaly>, AnomalyError> {
        let (Some(mean), Some(std_dev)) = (stats::mean(values), stats::population_std(values))
        else {
            return Ok(Vec::new());
        };
        if std_dev == 0.0 {
            return Ok(Vec::new());
        }

        let mut anomalies = Vec::new();
        for sample in &series.samples {
            let z_score = (sample.value - mean).abs() / std_dev;
            if z_score <= self.config.z_score_threshold {
                continue;
            }

            let severity = if z_score >= 5.0 {
                Severity::Critical
            } else if z_score >= 4.0 {
                Severity::High
            } else if z_score >= 3.5 {
                Severity::Medium
            } else {
                Severity::Low
            };

            anomalies.push(
                Anomaly::builder(&series.name, STATISTICAL_DETECTOR, AnomalyKind::StatisticalOutlier)
                    .observed(sample)
                    .severity(severity)
                    .confidence((z_score / 5.0).min(1.0))
                    .expected(mean)
                    .description(format!(
                        "Statistical outlier: z-score {:.2} (value {:.2}, mean {:.2}, std {:.2})",
                        z_score, sample.value, mean, std_dev
                    ))
                    .meta("detection_method", "z_score")
                    .meta("z_score", round_to(z_score, 2))
                    .meta("mean", mean)
                    .meta("std", std_dev)
                    .meta("threshold", self.config.z_score_threshold)
                    .build()?,
            );
        }
        Ok(anomalies)
    }

    fn iqr_outliers(&self, series: &Series, values: &[f64]) -> Result<Vec<Anomaly>, AnomalyError> {
        let (Some(q1), Some(q3), Some(median)) = (
            stats::percentile(values, 25.0),
            stats::percentile(values, 75.0),
            stats::median(values),
        ) else {
            return Ok(Vec::new());
        };
        let iqr = q3 - q1;
        if iqr == 0.0 {
            return Ok(Vec::new());
        }

        let lower = q1 - self.config.iqr_multiplier * iqr;
        let upper = q3 + self.config.iqr_multiplier * iqr;

        let mut anomalies = Vec::new();
        for sample in &series.samples {
            let distance = if sample.value < lower {
                lower - sample.value
            } else if sample.value > upper {
                sample.value - upper
            } else {
                continue;
            };
            let normalized = distance / iqr;

            let severity = if normalized >= 3.0 {
                Severity::Critical
            } else if normalized >= 2.0 {
                Severity::High
            } else if normalized >= 1.0 {
                Severity::Medium
            } else {
                Severity::Low
            };

            anomalies.push(
                Anomaly::builder(&series.name, STATISTICAL_DETECTOR, AnomalyKind::StatisticalOutlier)
                    .observed(sample)
                    .severity(severity)
                    .confidence((normalized / 2.0).min(1.0))
                    .expected(median)
                    .description(format!(
                        "IQR outlier: value {:.2} outside [{:.2}, {:.2}]",
                        sample.value, lower, upper
                    ))
                    .meta("detection_method", "iqr")
                    .meta("q1", q1)
                    .meta("q3", q3)
                    .meta("iqr", iqr)
                    .meta("lower_bound", lower)
                    .meta("upper_bound", upper)
                    .meta("normalized_distance", round_to(normalized, 2))
                    .build()?,
            );
        }
        Ok(anomalies)
    }
}

impl Default for StatisticalDetector {
    fn default() -> Self {
        Self {
            config: StatisticalConfig::default(),
        }
    }
}

impl Detector for StatisticalDetector {
    fn name(&self) -> &'static str {
        STATISTICAL_DETECTOR
    }

    fn detect(&self, series: &Series) -> Result<Vec<Anomaly>, AnomalyError> {
        if series.len() < MIN_SAMPLES_FOR_DETECTION {
            debug!(
                detector = STATISTICAL_DETECTOR,
                metric = %series.name,
                samples = series.len(),
                "Insufficient samples for statistical detection"
            );
            return Ok(Vec::new());
        }

        let values = series.values();
        let mut candidates = self.z_score_outliers(series, &values)?;
        candidates.extend(self.iqr_outliers(series, &values)?);
        let anomalies = deduplicate(candidates);

        debug!(
            detector = STATISTICAL_DETECTOR,
            metric = %series.name,
            samples = series.len(),
            anomalies = anomalies.len(),
            "Statistical detection complete"
        );

        Ok(anomalies)
    }
}

/// Keep the highest-confidence candidate per timestamp
///
/// Timestamps keep the order of their first candidate. On equal confidence
/// the earlier candidate wins.
pub(crate) fn deduplicate(candidates: Vec<Anomaly>) -> Vec<Anomaly> {
    let mut kept: Vec<Anomaly> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let timestamp: DateTime<Utc> = candidate.timestamp();
        match kept.iter_mut().find(|a| a.timestamp() == timestamp) {
            Some(existing) => {
                if candidate.confidence() > existing.confidence() {
                    *existing = candidate;
                }
            }
            None => kept.push(candidate),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricKind, Sample};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn series(values: &[f64]) -> Series {
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(start() + Duration::minutes(i as i64), *v))
            .collect();
        Series::new("latency_ms", MetricKind::Gauge).with_samples(samples)
    }

    #[test]
    fn test_single_outlier_reported_once() {
        let detector = StatisticalDetector::default();
        let anomalies = detector
            .detect(&series(&[
                50.0, 51.0, 49.0, 50.0, 51.0, 50.0, 49.0, 51.0, 50.0, 500.0,
            ]))
            .unwrap();

        assert_eq!(anomalies.len(), 1);
        let outlier = &anomalies[0];
        assert_eq!(outlier.value(), 500.0);
        assert_eq!(outlier.kind(), AnomalyKind::StatisticalOutlier);
        assert_eq!(outlier.severity(), Severity::Critical);
        assert_eq!(outlier.confidence(), 1.0);
        assert_eq!(outlier.metadata()["detection_method"], json!("iqr"));
        assert_eq!(outlier.expected_value(), Some(50.0));
    }

    #[test]
    fn test_both_tests_fire_on_same_sample() {
        let mut values: Vec<f64> = (0..19).map(|i| if i % 2 == 0 { 10.0 } else { 12.0 }).collect();
        values.push(100.0);

        let anomalies = StatisticalDetector::default().detect(&series(&values)).unwrap();

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].value(), 100.0);
        // IQR confidence saturates at 1.0 and beats the z-score's ~0.87
        assert_eq!(anomalies[0].confidence(), 1.0);
        assert_eq!(anomalies[0].metadata()["detection_method"], json!("iqr"));
    }

    #[test]
    fn test_z_score_only_outlier() {
        let detector = StatisticalDetector::new(StatisticalConfig {
            z_score_threshold: 2.0,
            iqr_multiplier: 100.0,
            ..Default::default()
        })
        .unwrap();
        let mut values = vec![10.0; 10];
        values.extend([12.0; 9]);
        values.push(40.0);

        let anomalies = detector.detect(&series(&values)).unwrap();

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].value(), 40.0);
        assert_eq!(anomalies[0].metadata()["detection_method"], json!("z_score"));
        assert!(anomalies[0].confidence() < 1.0);
    }

    #[test]
    fn test_tiny_magnitudes_are_not_treated_as_constant() {
        let values: Vec<f64> = [50.0, 51.0, 49.0, 50.0, 51.0, 50.0, 49.0, 51.0, 50.0, 500.0]
            .iter()
            .map(|v| v * 1e-17)
            .collect();

        let anomalies = StatisticalDetector::default().detect(&series(&values)).unwrap();

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].value(), 500.0 * 1e-17);
        assert_eq!(anomalies[0].metadata()["detection_method"], json!("iqr"));
    }

    #[test]
    fn test_constant_series_yields_nothing() {
        let anomalies = StatisticalDetector::default()
            .detect(&series(&[7.0; 20]))
            .unwrap();
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_insufficient_samples() {
        let anomalies = StatisticalDetector::default()
            .detect(&series(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1000.0]))
            .unwrap();
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_deduplicate_keeps_higher_confidence() {
        let at = start();
        let later = start() + Duration::minutes(1);
        let candidate = |ts, confidence, method: &str| {
            Anomaly::builder("m", STATISTICAL_DETECTOR, AnomalyKind::StatisticalOutlier)
                .at(ts, 1.0)
                .confidence(confidence)
                .meta("detection_method", method)
                .build()
                .unwrap()
        };

        let kept = deduplicate(vec![
            candidate(later, 0.4, "z_score"),
            candidate(at, 0.9, "z_score"),
            candidate(later, 0.6, "iqr"),
            candidate(at, 0.5, "iqr"),
        ]);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].timestamp(), later);
        assert_eq!(kept[0].metadata()["detection_method"], json!("iqr"));
        assert_eq!(kept[1].timestamp(), at);
        assert_eq!(kept[1].metadata()["detection_method"], json!("z_score"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            StatisticalDetector::new(StatisticalConfig {
                z_score_threshold: 0.0,
                ..Default::default()
            }),
            Err(ConfigError::InvalidZThreshold(_))
        ));
        assert!(matches!(
            StatisticalDetector::new(StatisticalConfig {
                iqr_multiplier: -1.0,
                ..Default::default()
            }),
            Err(ConfigError::InvalidIqrMultiplier(_))
        ));
    }
}
