//! Agent library for metrics anomaly detection
//!
//! This crate provides the core functionality for:
//! - Fetching metric series from a time-series store
//! - Spike, statistical, threshold and pattern detection
//! - Optional LLM enrichment of detected anomalies
//! - Report delivery to a downstream orchestrator
//! - Health checks and observability

pub mod anomaly;
pub mod collector;
pub mod enrich;
pub mod health;
pub mod models;
pub mod observability;
pub mod sink;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
