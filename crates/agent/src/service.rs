//! Cycle report handling
//!
//! Every finished cycle, scheduled or manual, goes through
//! [`ReportHandler::handle`]: component health is updated, anomalies are
//! logged, reports are delivered downstream and the report becomes the
//! one served by the API.

use agent_lib::collector::{CycleReport, EnrichmentOutcome};
use agent_lib::health::{components, HealthRegistry};
use agent_lib::observability::{AgentMetrics, StructuredLogger};
use agent_lib::sink::AnomalySink;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Consecutive cycles without a single successful fetch before the
/// source is reported unhealthy
pub const SOURCE_UNHEALTHY_AFTER: u32 = 3;

pub struct ReportHandler {
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    sink: Option<Arc<dyn AnomalySink>>,
    latest: RwLock<Option<Arc<CycleReport>>>,
    failed_cycles: AtomicU32,
}

impl ReportHandler {
    pub fn new(
        health: HealthRegistry,
        metrics: AgentMetrics,
        logger: StructuredLogger,
        sink: Option<Arc<dyn AnomalySink>>,
    ) -> Self {
        Self {
            health,
            metrics,
            logger,
            sink,
            latest: RwLock::new(None),
            failed_cycles: AtomicU32::new(0),
        }
    }

    /// Most recent cycle report, if any cycle has completed
    pub async fn latest(&self) -> Option<Arc<CycleReport>> {
        self.latest.read().await.clone()
    }

    /// Process a finished cycle and store it as the latest report
    pub async fn handle(&self, report: CycleReport) -> Arc<CycleReport> {
        self.update_health(&report).await;

        for anomaly in &report.anomalies {
            self.logger.log_anomaly(anomaly);
        }
        self.logger
            .log_cycle_summary(report.anomalies.len(), &report.count_by_severity());

        if report.anomalies.is_empty() {
            info!(cycle_id = %report.cycle_id, "No anomalies detected in this cycle");
        } else {
            self.deliver(&report).await;
        }

        let report = Arc::new(report);
        *self.latest.write().await = Some(report.clone());
        self.health.set_ready(true).await;
        report
    }

    async fn update_health(&self, report: &CycleReport) {
        if !report.metrics.is_empty() && report.analyzed_count() == 0 {
            let failed = self.failed_cycles.fetch_add(1, Ordering::SeqCst) + 1;
            let message = format!("All metric fetches failed in the last {} cycle(s)", failed);
            if failed >= SOURCE_UNHEALTHY_AFTER {
                self.health.set_unhealthy(components::SOURCE, message).await;
            } else {
                self.health.set_degraded(components::SOURCE, message).await;
            }
        } else if report.analyzed_count() > 0 {
            self.failed_cycles.store(0, Ordering::SeqCst);
            self.health.set_healthy(components::SOURCE).await;
        }

        match &report.enrichment {
            EnrichmentOutcome::FellBack { reason } => {
                self.health
                    .set_degraded(components::ENRICHER, reason.clone())
                    .await;
            }
            EnrichmentOutcome::Applied { .. } => {
                self.health.set_healthy(components::ENRICHER).await;
            }
            _ => {}
        }
    }

    async fn deliver(&self, report: &CycleReport) {
        let Some(sink) = &self.sink else {
            return;
        };

        let reports = report.reports();
        match sink.deliver(&reports).await {
            Ok(()) => {
                self.logger.log_delivery(true, reports.len());
                self.health.set_healthy(components::SINK).await;
            }
            Err(e) => {
                error!(
                    cycle_id = %report.cycle_id,
                    anomalies = reports.len(),
                    error = %e,
                    "Failed to deliver anomalies"
                );
                self.logger.log_delivery(false, reports.len());
                self.metrics.inc_sink_failures();
                self.health
                    .set_degraded(components::SINK, e.to_string())
                    .await;
            }
        }
    }
}
