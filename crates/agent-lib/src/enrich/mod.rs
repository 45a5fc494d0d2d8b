//! Optional post-processing of detected anomalies
//!
//! An enricher receives the aggregated batch of a cycle and returns the
//! same anomalies with extra metadata. Failures are never fatal: the
//! orchestrator keeps the original batch.

mod llm;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::Anomaly;

pub use llm::{LlmConfig, LlmEnricher};

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment transport error: {0}")]
    Transport(String),
    #[error("enrichment API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("unexpected enrichment response: {0}")]
    Decode(String),
    #[error("enrichment timed out after {0:?}")]
    Timeout(Duration),
    #[error("enrichment is disabled")]
    Disabled,
}

#[async_trait]
pub trait AnomalyEnricher: Send + Sync {
    /// Whether the enricher is configured and has credentials
    fn is_enabled(&self) -> bool;

    /// Return the batch with enrichment metadata added
    ///
    /// Output length and order match the input. Any failure fails the
    /// whole batch.
    async fn enrich(&self, anomalies: &[Anomaly]) -> Result<Vec<Anomaly>, EnrichError>;
}
