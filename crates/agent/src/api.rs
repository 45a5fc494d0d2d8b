//! HTTP API for health checks, Prometheus metrics and manual analysis

use agent_lib::{
    anomaly::DetectorsConfig,
    collector::{DetectionOrchestrator, SourceError},
    health::{ComponentStatus, HealthRegistry},
    observability::AgentMetrics,
    sink::AnomalyReport,
    MetricKind, Severity,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::{AgentConfig, AgentSection, PrometheusSection};
use crate::service::ReportHandler;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub orchestrator: Arc<DetectionOrchestrator>,
    pub reports: Arc<ReportHandler>,
}

impl AppState {
    pub fn new(
        config: Arc<AgentConfig>,
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        orchestrator: Arc<DetectionOrchestrator>,
        reports: Arc<ReportHandler>,
    ) -> Self {
        Self {
            config,
            health_registry,
            metrics,
            orchestrator,
            reports,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub success: bool,
    pub cycle_id: String,
    pub timestamp: String,
    pub duration_ms: f64,
    pub metrics_analyzed: usize,
    pub metrics_skipped: usize,
    pub anomalies_count: usize,
    pub anomalies: Vec<AnomalyReport>,
}

#[derive(Debug, Serialize)]
pub struct AnomaliesResponse {
    /// Completion time of the cycle the reports come from
    pub timestamp: Option<String>,
    pub count: usize,
    pub anomalies: Vec<AnomalyReport>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnomalyQuery {
    /// Minimum severity to include
    pub severity: Option<Severity>,
    pub metric: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DetectorInfo {
    pub name: String,
    pub position: usize,
}

#[derive(Debug, Serialize)]
pub struct DetectorsResponse {
    pub count: usize,
    pub detectors: Vec<DetectorInfo>,
}

#[derive(Debug, Serialize)]
pub struct MetricInfo {
    pub name: String,
    pub enabled: bool,
    pub kind: MetricKind,
    pub unit: String,
    pub detectors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub count: usize,
    pub metrics: Vec<MetricInfo>,
}

/// Effective configuration; LLM and orchestrator credentials are left out
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub agent: AgentSection,
    pub prometheus: PrometheusSection,
    pub detectors: DetectorsConfig,
    pub metrics_monitored: Vec<String>,
    pub check_interval_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct MetricAnalysisResponse {
    pub metric_name: String,
    pub timestamp: String,
    pub configured: bool,
    pub data_available: bool,
    pub samples: usize,
    pub window_start: String,
    pub window_end: String,
    pub anomalies_count: usize,
    pub anomalies: Vec<AnomalyReport>,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Run one detection cycle now
async fn analyze(State(state): State<Arc<AppState>>) -> Json<AnalysisResponse> {
    info!("Manual analysis requested");

    let started = std::time::Instant::now();
    let report = state.orchestrator.run_one_cycle().await;
    let report = state.reports.handle(report).await;
    let anomalies = report.reports();

    Json(AnalysisResponse {
        success: true,
        cycle_id: report.cycle_id.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        metrics_analyzed: report.analyzed_count(),
        metrics_skipped: report.skipped_count(),
        anomalies_count: anomalies.len(),
        anomalies,
    })
}

/// Reports from the latest cycle
async fn anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomalyQuery>,
) -> Json<AnomaliesResponse> {
    let Some(report) = state.reports.latest().await else {
        return Json(AnomaliesResponse {
            timestamp: None,
            count: 0,
            anomalies: Vec::new(),
        });
    };

    let anomalies: Vec<AnomalyReport> = report
        .reports()
        .into_iter()
        .filter(|r| query.severity.map_or(true, |min| r.severity >= min))
        .filter(|r| query.metric.as_deref().map_or(true, |m| r.metric_name == m))
        .collect();

    Json(AnomaliesResponse {
        timestamp: Some(report.finished_at.to_rfc3339()),
        count: anomalies.len(),
        anomalies,
    })
}

/// Active detectors in run order
async fn detectors(State(state): State<Arc<AppState>>) -> Json<DetectorsResponse> {
    let detectors: Vec<DetectorInfo> = state
        .orchestrator
        .detector_names()
        .into_iter()
        .enumerate()
        .map(|(position, name)| DetectorInfo {
            name: name.to_string(),
            position,
        })
        .collect();

    Json(DetectorsResponse {
        count: detectors.len(),
        detectors,
    })
}

/// Monitored metrics with the detectors that run on each
async fn monitored_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let active = state.orchestrator.detector_names();
    let metrics: Vec<MetricInfo> = state
        .orchestrator
        .metrics()
        .iter()
        .map(|m| MetricInfo {
            name: m.name.clone(),
            enabled: m.enabled,
            kind: m.kind,
            unit: m.unit.clone(),
            detectors: active
                .iter()
                .filter(|d| m.detectors.is_empty() || m.detectors.iter().any(|n| n == *d))
                .map(|d| d.to_string())
                .collect(),
        })
        .collect();

    Json(MetricsResponse {
        count: metrics.len(),
        metrics,
    })
}

async fn agent_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let config = &state.config;
    Json(ConfigResponse {
        agent: config.agent.clone(),
        prometheus: config.prometheus.clone(),
        detectors: config.detectors.clone(),
        metrics_monitored: config.metrics.iter().map(|m| m.name.clone()).collect(),
        check_interval_secs: config.agent.check_interval_secs,
    })
}

/// Fetch and analyze one metric without delivering anything
async fn analyze_metric(
    State(state): State<Arc<AppState>>,
    Path(metric_name): Path<String>,
) -> Result<Json<MetricAnalysisResponse>, (StatusCode, String)> {
    info!(metric = %metric_name, "Single metric analysis requested");

    let analysis = state
        .orchestrator
        .analyze_metric(&metric_name, Utc::now())
        .await
        .map_err(|e| match e {
            SourceError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                format!("Metric '{}' not found in the metrics store", metric_name),
            ),
            other => (StatusCode::BAD_GATEWAY, other.to_string()),
        })?;

    let anomalies = analysis.reports();
    Ok(Json(MetricAnalysisResponse {
        metric_name: analysis.metric,
        timestamp: Utc::now().to_rfc3339(),
        configured: analysis.configured,
        data_available: analysis.samples > 0,
        samples: analysis.samples,
        window_start: analysis.window_start.to_rfc3339(),
        window_end: analysis.window_end.to_rfc3339(),
        anomalies_count: anomalies.len(),
        anomalies,
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/analyze", post(analyze))
        .route("/api/v1/anomalies", get(anomalies))
        .route("/api/v1/detectors", get(detectors))
        .route("/api/v1/metrics", get(monitored_metrics))
        .route("/api/v1/metrics/:name/analyze", post(analyze_metric))
        .route("/api/v1/config", get(agent_config))
        .with_state(state)
}

/// Start the API server, stopping when `shutdown` fires
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
