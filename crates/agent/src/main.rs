//! Metrics Agent - anomaly detection over Prometheus metrics
//!
//! Periodically fetches the configured metrics, runs the detectors and
//! forwards the resulting anomalies to the orchestrator.

use agent_lib::{
    collector::{CollectionLoop, DetectionOrchestrator, PrometheusSource},
    enrich::{AnomalyEnricher, LlmEnricher},
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    sink::{AnomalySink, HttpSink},
};
use anyhow::{Context, Result};
use metrics_agent::{
    api,
    config::{AgentConfig, LogFormat},
    service::ReportHandler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing(config: &AgentConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
}

/// Resolves on SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = sigterm.recv() => "SIGTERM received",
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT received"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT received"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load().context("Failed to load configuration")?;
    init_tracing(&config);

    info!(agent = %config.agent.name, "Starting metrics-agent");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SOURCE).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.agent.name);

    // Metrics store
    let source = PrometheusSource::new(
        &config.prometheus.url,
        Duration::from_secs(config.prometheus.timeout_secs),
    )
    .context("Invalid prometheus.url")?;
    match source.check_connection().await {
        Ok(()) => info!(url = %source.base_url(), "Connected to Prometheus"),
        Err(e) => {
            // the first cycle that fetches anything marks the source healthy again
            warn!(url = %source.base_url(), error = %e, "Prometheus not reachable, continuing");
            health_registry
                .set_unhealthy(components::SOURCE, e.to_string())
                .await;
        }
    }

    let detectors = config.build_detectors()?;

    let mut builder = DetectionOrchestrator::builder()
        .source(Arc::new(source))
        .detectors(detectors)
        .metrics(config.metrics.clone())
        .config(config.orchestrator_config());

    if config.llm.enabled {
        let enricher = LlmEnricher::new(config.llm.clone()).context("Invalid llm configuration")?;
        if enricher.is_enabled() {
            health_registry.register(components::ENRICHER).await;
        }
        builder = builder.enricher(Arc::new(enricher));
    }

    let orchestrator = Arc::new(builder.build()?);

    let sink: Option<Arc<dyn AnomalySink>> = if config.orchestrator.enabled {
        let sink = HttpSink::new(
            &config.orchestrator.endpoint,
            &config.agent.name,
            Duration::from_secs(config.orchestrator.timeout_secs),
        )
        .context("Invalid orchestrator.endpoint")?;
        info!(endpoint = %sink.endpoint(), "Reporting anomalies to orchestrator");
        health_registry.register(components::SINK).await;
        Some(Arc::new(sink) as Arc<dyn AnomalySink>)
    } else {
        None
    };

    logger.log_startup(
        AGENT_VERSION,
        orchestrator.metrics().iter().filter(|m| m.enabled).count(),
        &orchestrator.detector_names(),
    );

    let reports = Arc::new(ReportHandler::new(
        health_registry.clone(),
        metrics.clone(),
        logger.clone(),
        sink,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start health, metrics and analysis API
    let app_state = Arc::new(api::AppState::new(
        Arc::new(config.clone()),
        health_registry.clone(),
        metrics.clone(),
        orchestrator.clone(),
        reports.clone(),
    ));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Start scheduled detection
    let (collection_loop, mut report_rx) = CollectionLoop::builder()
        .orchestrator(orchestrator.clone())
        .interval(config.check_interval())
        .build()?;
    let loop_handle = tokio::spawn(collection_loop.run(shutdown_tx.subscribe()));

    let consumer = reports.clone();
    let consumer_handle = tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            consumer.handle(report).await;
        }
    });

    // Wait for shutdown signal
    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    let _ = loop_handle.await;
    let _ = consumer_handle.await;
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutting down");
    Ok(())
}
