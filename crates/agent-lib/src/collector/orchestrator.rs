//! Detection cycle orchestration
//!
//! One cycle fetches every enabled metric over the lookback window, runs
//! the detectors in order, aggregates the anomalies and optionally hands
//! the batch to an enricher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{SourceError, TimeSeriesSource};
use crate::anomaly::{Detector, ThresholdBounds};
use crate::enrich::{AnomalyEnricher, EnrichError};
use crate::models::{Anomaly, MetricKind, Series, Severity};
use crate::observability::AgentMetrics;
use crate::sink::{AnomalyReport, ReportContext};

/// A metric the agent analyzes every cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    /// Query sent to the metrics store
    pub name: String,
    pub enabled: bool,
    pub kind: MetricKind,
    pub unit: String,
    /// Detectors to run on this metric; empty means all
    pub detectors: Vec<String>,
    /// Exact-name threshold bounds for this metric
    pub thresholds: Option<ThresholdBounds>,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            kind: MetricKind::Gauge,
            unit: String::new(),
            detectors: Vec::new(),
            thresholds: None,
        }
    }
}

impl MetricConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn runs(&self, detector: &str) -> bool {
        self.detectors.is_empty() || self.detectors.iter().any(|d| d == detector)
    }
}

/// Longest lookback window a cycle accepts
pub const MAX_LOOKBACK: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Timing settings for a cycle
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lookback: Duration,
    pub step: Duration,
    pub fetch_timeout: Duration,
    /// Enrichment budget per anomaly; the batch gets this times its length
    pub enrich_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(3600),
            step: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(30),
            enrich_timeout: Duration::from_secs(60),
        }
    }
}

/// Where the current (or last) cycle is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Fetching,
    Detecting,
    Aggregated,
    Enriching,
    Done,
}

/// What happened to one metric during a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricOutcome {
    Analyzed {
        metric: String,
        samples: usize,
        anomalies: usize,
    },
    Skipped {
        metric: String,
        reason: String,
    },
}

/// What happened during the enrichment stage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    NotConfigured,
    Disabled,
    NothingToEnrich,
    Applied { anomalies: usize },
    FellBack { reason: String },
}

/// Result of one detection cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub metrics: Vec<MetricOutcome>,
    pub enrichment: EnrichmentOutcome,
    pub anomalies: Vec<Anomaly>,
    #[serde(skip)]
    contexts: BTreeMap<String, ReportContext>,
    #[serde(skip)]
    lookback_secs: u64,
}

impl CycleReport {
    /// Anomalies in orchestrator wire format
    pub fn reports(&self) -> Vec<AnomalyReport> {
        self.anomalies
            .iter()
            .map(|anomaly| {
                let context = self
                    .contexts
                    .get(anomaly.metric_name())
                    .cloned()
                    .unwrap_or_else(|| ReportContext::new("unknown", "", self.lookback_secs));
                AnomalyReport::from_anomaly(anomaly, &context)
            })
            .collect()
    }

    pub fn count_by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for anomaly in &self.anomalies {
            *counts.entry(anomaly.severity()).or_insert(0) += 1;
        }
        counts
    }

    pub fn analyzed_count(&self) -> usize {
        self.metrics
            .iter()
            .filter(|m| matches!(m, MetricOutcome::Analyzed { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.metrics.len() - self.analyzed_count()
    }
}

/// Result of analyzing a single metric outside a cycle
#[derive(Debug, Clone, Serialize)]
pub struct MetricAnalysis {
    pub metric: String,
    /// Whether the metric is in the monitored list
    pub configured: bool,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub samples: usize,
    pub anomalies: Vec<Anomaly>,
    #[serde(skip)]
    context: ReportContext,
}

impl MetricAnalysis {
    pub fn reports(&self) -> Vec<AnomalyReport> {
        self.anomalies
            .iter()
            .map(|anomaly| AnomalyReport::from_anomaly(anomaly, &self.context))
            .collect()
    }
}

/// Runs detection cycles over the configured metrics
pub struct DetectionOrchestrator {
    source: Arc<dyn TimeSeriesSource>,
    detectors: Vec<Arc<dyn Detector>>,
    metrics: Vec<MetricConfig>,
    enricher: Option<Arc<dyn AnomalyEnricher>>,
    config: OrchestratorConfig,
    lookback: chrono::Duration,
    state: RwLock<CycleState>,
    cycle_lock: Mutex<()>,
    telemetry: AgentMetrics,
}

impl DetectionOrchestrator {
    pub fn builder() -> DetectionOrchestratorBuilder {
        DetectionOrchestratorBuilder::new()
    }

    pub fn metrics(&self) -> &[MetricConfig] {
        &self.metrics
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Detector names in run order
    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    pub fn state(&self) -> CycleState {
        self.state.read().map(|s| *s).unwrap_or(CycleState::Idle)
    }

    fn set_state(&self, next: CycleState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    /// Run a cycle ending now
    pub async fn run_one_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run a cycle whose window ends at `now`
    ///
    /// Cycles never overlap: a second caller waits for the running cycle.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;
        let started = Instant::now();
        let started_at = Utc::now();
        let cycle_id = Uuid::new_v4();

        let window_start = now - self.lookback;

        info!(
            cycle_id = %cycle_id,
            metrics = self.metrics.iter().filter(|m| m.enabled).count(),
            window_start = %window_start,
            window_end = %now,
            "Starting detection cycle"
        );

        let mut anomalies = Vec::new();
        let mut outcomes = Vec::new();
        let mut contexts = BTreeMap::new();

        for metric in self.metrics.iter().filter(|m| m.enabled) {
            self.set_state(CycleState::Fetching);
            let series = match self.fetch(metric, window_start, now).await {
                Ok(series) => series,
                Err(e) => {
                    match &e {
                        SourceError::NotFound(_) => {
                            warn!(metric = %metric.name, "No data returned for metric, skipping")
                        }
                        _ => warn!(metric = %metric.name, error = %e, "Failed to fetch metric, skipping"),
                    }
                    self.telemetry.inc_fetch_errors();
                    outcomes.push(MetricOutcome::Skipped {
                        metric: metric.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            self.set_state(CycleState::Detecting);
            let found = self.detect(metric, &series);
            outcomes.push(MetricOutcome::Analyzed {
                metric: metric.name.clone(),
                samples: series.len(),
                anomalies: found.len(),
            });
            contexts.insert(
                metric.name.clone(),
                ReportContext::new(metric.kind.as_str(), &metric.unit, self.config.lookback.as_secs()),
            );
            anomalies.extend(found);
        }

        self.set_state(CycleState::Aggregated);
        let (anomalies, enrichment) = self.enrich(anomalies).await;
        self.set_state(CycleState::Done);

        let elapsed = started.elapsed();
        self.telemetry
            .observe_cycle(elapsed.as_secs_f64(), anomalies.len());

        info!(
            cycle_id = %cycle_id,
            anomalies = anomalies.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Detection cycle complete"
        );

        CycleReport {
            cycle_id,
            window_start,
            window_end: now,
            started_at,
            finished_at: Utc::now(),
            metrics: outcomes,
            enrichment,
            anomalies,
            contexts,
            lookback_secs: self.config.lookback.as_secs(),
        }
    }

    /// Fetch one metric over the lookback window ending at `now` and run
    /// the detectors on it
    ///
    /// A monitored metric keeps its detector filter and context; any other
    /// name is treated as a gauge checked by every detector. Nothing is
    /// enriched and the cycle state is left alone.
    pub async fn analyze_metric(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<MetricAnalysis, SourceError> {
        let configured = self.metrics.iter().find(|m| m.name == name);
        let metric = configured
            .cloned()
            .unwrap_or_else(|| MetricConfig::new(name));
        let window_start = now - self.lookback;

        let series = self.fetch(&metric, window_start, now).await?;
        let anomalies = self.detect(&metric, &series);

        info!(
            metric = %metric.name,
            samples = series.len(),
            anomalies = anomalies.len(),
            "Single metric analysis complete"
        );

        Ok(MetricAnalysis {
            metric: metric.name.clone(),
            configured: configured.is_some(),
            window_start,
            window_end: now,
            samples: series.len(),
            anomalies,
            context: ReportContext::new(
                metric.kind.as_str(),
                &metric.unit,
                self.config.lookback.as_secs(),
            ),
        })
    }

    async fn fetch(
        &self,
        metric: &MetricConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Series, SourceError> {
        let fetch_start = Instant::now();
        let result = timeout(
            self.config.fetch_timeout,
            self.source
                .fetch_range(&metric.name, start, end, self.config.step),
        )
        .await;
        self.telemetry
            .observe_fetch_latency(fetch_start.elapsed().as_secs_f64());

        let mut series = result.map_err(|_| SourceError::Timeout(self.config.fetch_timeout))??;
        if series.is_empty() {
            return Err(SourceError::NotFound(metric.name.clone()));
        }
        series.kind = metric.kind;
        Ok(series)
    }

    fn detect(&self, metric: &MetricConfig, series: &Series) -> Vec<Anomaly> {
        let mut found = Vec::new();

        for detector in self.detectors.iter().filter(|d| metric.runs(d.name())) {
            match detector.detect(series) {
                Ok(anomalies) => {
                    debug!(
                        metric = %metric.name,
                        detector = detector.name(),
                        anomalies = anomalies.len(),
                        "Detector finished"
                    );
                    for anomaly in &anomalies {
                        self.telemetry
                            .inc_anomalies_detected(detector.name(), anomaly.severity());
                    }
                    found.extend(anomalies);
                }
                Err(e) => {
                    error!(
                        metric = %metric.name,
                        detector = detector.name(),
                        error = %e,
                        "Detector produced an invalid anomaly, discarding its output"
                    );
                }
            }
        }

        found
    }

    async fn enrich(&self, batch: Vec<Anomaly>) -> (Vec<Anomaly>, EnrichmentOutcome) {
        let Some(enricher) = &self.enricher else {
            return (batch, EnrichmentOutcome::NotConfigured);
        };
        if !enricher.is_enabled() {
            return (batch, EnrichmentOutcome::Disabled);
        }
        if batch.is_empty() {
            return (batch, EnrichmentOutcome::NothingToEnrich);
        }

        self.set_state(CycleState::Enriching);
        let budget = self.enrich_budget(batch.len());
        match timeout(budget, enricher.enrich(&batch)).await {
            Ok(Ok(enriched)) if enriched.len() == batch.len() => {
                info!(anomalies = enriched.len(), "Anomalies enriched");
                let count = enriched.len();
                (enriched, EnrichmentOutcome::Applied { anomalies: count })
            }
            Ok(Ok(enriched)) => {
                let reason = format!(
                    "enricher returned {} anomalies for a batch of {}",
                    enriched.len(),
                    batch.len()
                );
                self.fall_back(batch, reason)
            }
            Ok(Err(e)) => self.fall_back(batch, e.to_string()),
            Err(_) => {
                let reason = EnrichError::Timeout(budget).to_string();
                self.fall_back(batch, reason)
            }
        }
    }

    fn enrich_budget(&self, batch_len: usize) -> Duration {
        let scale = u32::try_from(batch_len).unwrap_or(u32::MAX).max(1);
        self.config.enrich_timeout.saturating_mul(scale)
    }

    fn fall_back(&self, batch: Vec<Anomaly>, reason: String) -> (Vec<Anomaly>, EnrichmentOutcome) {
        warn!(
            anomalies = batch.len(),
            reason = %reason,
            "Enrichment failed, keeping original anomalies"
        );
        self.telemetry.inc_enrichment_fallbacks();
        (batch, EnrichmentOutcome::FellBack { reason })
    }
}

/// Builder for [`DetectionOrchestrator`]
pub struct DetectionOrchestratorBuilder {
    source: Option<Arc<dyn TimeSeriesSource>>,
    detectors: Vec<Arc<dyn Detector>>,
    metrics: Vec<MetricConfig>,
    enricher: Option<Arc<dyn AnomalyEnricher>>,
    config: OrchestratorConfig,
}

impl DetectionOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            detectors: Vec::new(),
            metrics: Vec::new(),
            enricher: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn source(mut self, source: Arc<dyn TimeSeriesSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Detectors run in the order given
    pub fn detectors(mut self, detectors: Vec<Arc<dyn Detector>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn metrics(mut self, metrics: Vec<MetricConfig>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn AnomalyEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> anyhow::Result<DetectionOrchestrator> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Time series source is required"))?;

        if self.config.lookback.is_zero() || self.config.lookback > MAX_LOOKBACK {
            anyhow::bail!(
                "Lookback window must be between 1s and {}s, got {}s",
                MAX_LOOKBACK.as_secs(),
                self.config.lookback.as_secs()
            );
        }
        let lookback = chrono::Duration::from_std(self.config.lookback)?;

        let telemetry = AgentMetrics::new();
        telemetry.set_metrics_monitored(self.metrics.iter().filter(|m| m.enabled).count() as i64);

        Ok(DetectionOrchestrator {
            source,
            detectors: self.detectors,
            metrics: self.metrics,
            enricher: self.enricher,
            config: self.config,
            lookback,
            state: RwLock::new(CycleState::Idle),
            cycle_lock: Mutex::new(()),
            telemetry,
        })
    }
}

impl Default for DetectionOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
