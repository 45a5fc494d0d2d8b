//! Integration tests for the agent API endpoints

use agent_lib::{
    anomaly::{Detector, SpikeDetector},
    collector::{DetectionOrchestrator, MetricConfig, SourceError, TimeSeriesSource},
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    sink::{AnomalyReport, AnomalySink, SinkError},
    MetricKind, Sample, Series,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_agent::{
    api::{create_router, AppState},
    config::AgentConfig,
    service::{ReportHandler, SOURCE_UNHEALTHY_AFTER},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Serves fixed values for `cpu_usage`, nothing for other queries
struct FixedSource {
    values: Vec<f64>,
}

#[async_trait]
impl TimeSeriesSource for FixedSource {
    async fn fetch_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Series, SourceError> {
        if query != "cpu_usage" {
            return Err(SourceError::Transient("connection refused".to_string()));
        }
        let step = chrono::Duration::from_std(step).unwrap();
        let samples = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(start + step * i as i32, *v))
            .collect();
        Ok(Series::new(query, MetricKind::Gauge).with_samples(samples))
    }
}

struct RecordingSink {
    deliveries: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl AnomalySink for RecordingSink {
    async fn deliver(&self, _reports: &[AnomalyReport]) -> Result<(), SinkError> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(SinkError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    sink: Arc<RecordingSink>,
}

async fn setup_test_app_with(metrics: Vec<MetricConfig>, sink_fails: bool) -> TestApp {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SOURCE).await;
    health_registry.register(components::SINK).await;

    let source = FixedSource {
        values: vec![10.0, 10.0, 10.0, 30.0, 10.0],
    };
    let mut config = AgentConfig::default();
    config.agent.name = "test-agent".to_string();
    config.metrics = metrics.clone();

    let orchestrator = DetectionOrchestrator::builder()
        .source(Arc::new(source))
        .detectors(vec![Arc::new(SpikeDetector::default()) as Arc<dyn Detector>])
        .metrics(metrics)
        .build()
        .unwrap();

    let sink = Arc::new(RecordingSink {
        deliveries: AtomicUsize::new(0),
        fail: sink_fails,
    });
    let metrics = AgentMetrics::new();
    let reports = Arc::new(ReportHandler::new(
        health_registry.clone(),
        metrics.clone(),
        StructuredLogger::new("test-agent"),
        Some(sink.clone() as Arc<dyn AnomalySink>),
    ));

    let state = Arc::new(AppState::new(
        Arc::new(config),
        health_registry,
        metrics,
        Arc::new(orchestrator),
        reports,
    ));
    TestApp {
        router: create_router(state.clone()),
        state,
        sink,
    }
}

async fn setup_test_app() -> TestApp {
    let mut cpu = MetricConfig::new("cpu_usage");
    cpu.unit = "percent".to_string();
    setup_test_app_with(vec![cpu], false).await
}

async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app().await;

    let (status, health) = send(&app.router, "GET", "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["source"].is_object());
    assert!(health["components"]["sink"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app().await;
    app.state
        .health_registry
        .set_degraded(components::SOURCE, "High latency")
        .await;

    let (status, health) = send(&app.router, "GET", "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let app = setup_test_app().await;
    app.state
        .health_registry
        .set_unhealthy(components::SOURCE, "Prometheus unreachable")
        .await;

    let (status, health) = send(&app.router, "GET", "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_first_cycle() {
    let app = setup_test_app().await;

    let (status, readiness) = send(&app.router, "GET", "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_after_analysis() {
    let app = setup_test_app().await;

    send(&app.router, "POST", "/api/v1/analyze").await;
    let (status, readiness) = send(&app.router, "GET", "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let app = setup_test_app().await;
    send(&app.router, "POST", "/api/v1/analyze").await;

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("metrics_agent_cycles_total"));
    assert!(metrics_text.contains("metrics_agent_cycle_duration_seconds_bucket"));
    assert!(metrics_text.contains("metrics_agent_anomalies_detected_total"));
}

#[tokio::test]
async fn test_analyze_runs_a_cycle_and_delivers() {
    let app = setup_test_app().await;

    let (status, body) = send(&app.router, "POST", "/api/v1/analyze").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["metrics_analyzed"], 1);
    assert_eq!(body["anomalies_count"], 2);

    let anomalies = body["anomalies"].as_array().unwrap();
    assert_eq!(anomalies[0]["anomaly_type"], "spike");
    assert_eq!(anomalies[0]["severity"], "critical");
    assert_eq!(anomalies[0]["observed_value"], 30.0);
    assert_eq!(anomalies[0]["context"]["unit"], "percent");
    assert_eq!(anomalies[0]["suggested_category"], "performance");
    assert_eq!(anomalies[1]["anomaly_type"], "drop");

    assert_eq!(app.sink.deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(
        app.state.health_registry.status_of(components::SINK).await,
        Some(agent_lib::ComponentStatus::Healthy)
    );
}

#[tokio::test]
async fn test_sink_failure_degrades_health() {
    let mut cpu = MetricConfig::new("cpu_usage");
    cpu.unit = "percent".to_string();
    let app = setup_test_app_with(vec![cpu], true).await;

    let (status, body) = send(&app.router, "POST", "/api/v1/analyze").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["anomalies_count"], 2);

    assert_eq!(app.sink.deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(
        app.state.health_registry.status_of(components::SINK).await,
        Some(agent_lib::ComponentStatus::Degraded)
    );

    let (status, health) = send(&app.router, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_all_fetches_failing_degrades_source() {
    let app = setup_test_app_with(vec![MetricConfig::new("memory_usage")], false).await;

    let (_, body) = send(&app.router, "POST", "/api/v1/analyze").await;

    assert_eq!(body["metrics_analyzed"], 0);
    assert_eq!(body["metrics_skipped"], 1);
    assert_eq!(body["anomalies_count"], 0);
    assert_eq!(app.sink.deliveries.load(Ordering::SeqCst), 0);
    assert_eq!(
        app.state.health_registry.status_of(components::SOURCE).await,
        Some(agent_lib::ComponentStatus::Degraded)
    );
}

#[tokio::test]
async fn test_repeated_fetch_failures_make_source_unhealthy() {
    let app = setup_test_app_with(vec![MetricConfig::new("memory_usage")], false).await;

    for _ in 0..SOURCE_UNHEALTHY_AFTER {
        let (status, _) = send(&app.router, "POST", "/api/v1/analyze").await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, health) = send(&app.router, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["components"]["source"]["status"], "unhealthy");

    let (status, readiness) = send(&app.router, "GET", "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Metrics source unreachable");
}

#[tokio::test]
async fn test_successful_fetch_restores_unhealthy_source() {
    let app = setup_test_app().await;
    app.state
        .health_registry
        .set_unhealthy(components::SOURCE, "connection refused")
        .await;

    send(&app.router, "POST", "/api/v1/analyze").await;

    let (status, health) = send(&app.router, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["components"]["source"]["status"], "healthy");
}

#[tokio::test]
async fn test_anomalies_empty_before_first_cycle() {
    let app = setup_test_app().await;

    let (status, body) = send(&app.router, "GET", "/api/v1/anomalies").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert!(body["timestamp"].is_null());
    assert!(body["anomalies"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_anomalies_returns_latest_cycle() {
    let app = setup_test_app().await;
    send(&app.router, "POST", "/api/v1/analyze").await;

    let (status, body) = send(&app.router, "GET", "/api/v1/anomalies").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert!(body["timestamp"].is_string());

    let (_, body) = send(&app.router, "GET", "/api/v1/anomalies?severity=high").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["anomalies"][0]["severity"], "critical");

    let (_, body) = send(&app.router, "GET", "/api/v1/anomalies?metric=memory_usage").await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_anomalies_rejects_unknown_severity() {
    let app = setup_test_app().await;

    let (status, _) = send(&app.router, "GET", "/api/v1/anomalies?severity=urgent").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_detectors_lists_run_order() {
    let app = setup_test_app().await;

    let (status, body) = send(&app.router, "GET", "/api/v1/detectors").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["detectors"][0]["name"], "spike_detector");
    assert_eq!(body["detectors"][0]["position"], 0);
}

#[tokio::test]
async fn test_metrics_lists_monitored_metrics() {
    let mut cpu = MetricConfig::new("cpu_usage");
    cpu.kind = MetricKind::Gauge;
    cpu.unit = "percent".to_string();
    let mut latency = MetricConfig::new("request_latency");
    latency.detectors = vec!["pattern_detector".to_string()];
    let app = setup_test_app_with(vec![cpu, latency], false).await;

    let (status, body) = send(&app.router, "GET", "/api/v1/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["metrics"][0]["name"], "cpu_usage");
    assert_eq!(body["metrics"][0]["kind"], "gauge");
    assert_eq!(body["metrics"][0]["detectors"][0], "spike_detector");
    // pattern_detector is not active, so nothing runs on this metric
    assert!(body["metrics"][1]["detectors"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_config_returns_effective_settings() {
    let app = setup_test_app().await;

    let (status, body) = send(&app.router, "GET", "/api/v1/config").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agent"]["name"], "test-agent");
    assert_eq!(body["prometheus"]["url"], "http://localhost:9090");
    assert_eq!(body["check_interval_secs"], 60);
    assert_eq!(body["metrics_monitored"], serde_json::json!(["cpu_usage"]));
    assert_eq!(body["detectors"]["spike_detector"]["min_change_percent"], 50.0);
    assert!(body.get("llm").is_none());
}

#[tokio::test]
async fn test_analyze_single_metric() {
    let app = setup_test_app().await;

    let (status, body) = send(&app.router, "POST", "/api/v1/metrics/cpu_usage/analyze").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metric_name"], "cpu_usage");
    assert_eq!(body["configured"], true);
    assert_eq!(body["data_available"], true);
    assert_eq!(body["samples"], 5);
    assert_eq!(body["anomalies_count"], 2);
    assert_eq!(body["anomalies"][0]["context"]["unit"], "percent");

    // nothing is delivered or stored as the latest cycle
    assert_eq!(app.sink.deliveries.load(Ordering::SeqCst), 0);
    let (_, latest) = send(&app.router, "GET", "/api/v1/anomalies").await;
    assert_eq!(latest["count"], 0);
}

#[tokio::test]
async fn test_analyze_single_metric_reports_store_errors() {
    let app = setup_test_app().await;

    let (status, _) = send(&app.router, "POST", "/api/v1/metrics/memory_usage/analyze").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let app = setup_test_app().await;

    let (status, _) = send(&app.router, "GET", "/api/v1/unknown").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
