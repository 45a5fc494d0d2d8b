//! Metric collection and detection cycles
//!
//! This module fetches series from a time-series store, runs the
//! configured detectors over them and schedules the cycles.

mod r#loop;
mod orchestrator;
mod prometheus_source;


pub use orchestrator::{
    CycleReport, CycleState, DetectionOrchestrator, DetectionOrchestratorBuilder,
    EnrichmentOutcome, MetricAnalysis, MetricConfig, MetricOutcome, OrchestratorConfig,
    MAX_LOOKBACK,
};
pub use prometheus_source::PrometheusSource;
pub use r#loop::{CollectionConfig, CollectionLoop, CollectionLoopBuilder};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::models::Series;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no data for query '{0}'")]
    NotFound(String),
    #[error("metrics source unavailable: {0}")]
    Transient(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response from metrics source: {0}")]
    Decode(String),
}

/// Trait for time-series store implementations
#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    /// Fetch `query` between `start` and `end` at `step` resolution
    ///
    /// Samples come back in chronological order.
    async fn fetch_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Series, SourceError>;
}
