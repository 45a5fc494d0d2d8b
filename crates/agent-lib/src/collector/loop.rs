//! Detection loop
//!
//! Runs a detection cycle on a fixed interval and publishes each
//! [`CycleReport`] on a channel.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{CycleReport, DetectionOrchestrator};

/// Configuration for the detection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Time between cycle starts (default: 60 seconds)
    pub interval: Duration,
    /// Channel buffer size for cycle reports
    pub buffer_size: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            buffer_size: 16,
        }
    }
}

/// Periodically runs detection cycles
pub struct CollectionLoop {
    orchestrator: Arc<DetectionOrchestrator>,
    config: CollectionConfig,
    reports_tx: mpsc::Sender<CycleReport>,
}

impl CollectionLoop {
    pub fn new(
        orchestrator: Arc<DetectionOrchestrator>,
        config: CollectionConfig,
    ) -> (Self, mpsc::Receiver<CycleReport>) {
        let (reports_tx, reports_rx) = mpsc::channel(config.buffer_size.max(1));

        let loop_instance = Self {
            orchestrator,
            config,
            reports_tx,
        };

        (loop_instance, reports_rx)
    }

    pub fn builder() -> CollectionLoopBuilder {
        CollectionLoopBuilder::new()
    }

    /// Run cycles until `shutdown` fires
    ///
    /// The first cycle starts immediately. A running cycle finishes before
    /// the shutdown signal is observed.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting detection loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycle_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.orchestrator.run_one_cycle().await;
                    cycle_count += 1;

                    debug!(
                        cycle = cycle_count,
                        analyzed = report.analyzed_count(),
                        skipped = report.skipped_count(),
                        anomalies = report.anomalies.len(),
                        "Cycle report ready"
                    );

                    if let Err(e) = self.reports_tx.send(report).await {
                        warn!(error = %e, "Failed to publish cycle report, receiver dropped");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!(cycles = cycle_count, "Shutting down detection loop");
                    break;
                }
            }
        }
    }
}

/// Builder for the detection loop
pub struct CollectionLoopBuilder {
    orchestrator: Option<Arc<DetectionOrchestrator>>,
    config: CollectionConfig,
}

impl CollectionLoopBuilder {
    pub fn new() -> Self {
        Self {
            orchestrator: None,
            config: CollectionConfig::default(),
        }
    }

    pub fn orchestrator(mut self, orchestrator: Arc<DetectionOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn build(self) -> Result<(CollectionLoop, mpsc::Receiver<CycleReport>)> {
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| anyhow::anyhow!("Orchestrator is required"))?;

        Ok(CollectionLoop::new(orchestrator, self.config))
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
