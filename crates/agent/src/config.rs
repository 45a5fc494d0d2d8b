//! Agent configuration
//!
//! Values come from a YAML file (`config/config.yaml`, or the path in
//! `METRICS_AGENT_CONFIG`) overlaid with `AGENT__SECTION__KEY` environment
//! variables. Every section has defaults, so the file is optional.

use agent_lib::anomaly::{build_detectors, Detector, DetectorsConfig, ThresholdRule};
use agent_lib::collector::{MetricConfig, OrchestratorConfig, MAX_LOOKBACK};
use agent_lib::enrich::LlmConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the config file path
pub const CONFIG_PATH_ENV: &str = "METRICS_AGENT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Name reported to the orchestrator
    pub name: String,
    pub check_interval_secs: u64,
    pub lookback_window_seconds: u64,
    pub step_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: "metrics-agent".to_string(),
            check_interval_secs: 60,
            lookback_window_seconds: 3600,
            step_secs: 60,
            fetch_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusSection {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for PrometheusSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Downstream orchestrator that receives anomaly reports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:8000/api/anomalies".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    /// API server port for health, metrics and manual analysis
    pub api_port: u16,
    pub prometheus: PrometheusSection,
    pub orchestrator: OrchestratorSection,
    pub logging: LoggingSection,
    pub detectors: DetectorsConfig,
    pub llm: LlmConfig,
    pub metrics: Vec<MetricConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentSection::default(),
            api_port: 8080,
            prometheus: PrometheusSection::default(),
            orchestrator: OrchestratorSection::default(),
            logging: LoggingSection::default(),
            detectors: DetectorsConfig::default(),
            llm: LlmConfig::default(),
            metrics: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load configuration from `path` (which may not exist) and environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: AgentConfig = settings
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.check_interval_secs == 0 {
            anyhow::bail!("agent.check_interval_secs must be greater than 0");
        }
        if self.agent.step_secs == 0 {
            anyhow::bail!("agent.step_secs must be greater than 0");
        }
        if self.agent.lookback_window_seconds < self.agent.step_secs {
            anyhow::bail!("agent.lookback_window_seconds must cover at least one step");
        }
        if self.agent.lookback_window_seconds > MAX_LOOKBACK.as_secs() {
            anyhow::bail!(
                "agent.lookback_window_seconds must not exceed {}",
                MAX_LOOKBACK.as_secs()
            );
        }
        if let Some(metric) = self.metrics.iter().find(|m| m.name.trim().is_empty()) {
            anyhow::bail!("metric with empty name (unit '{}')", metric.unit);
        }
        self.detectors
            .validate()
            .context("Invalid detector configuration")?;
        Ok(())
    }

    /// Per-metric threshold bounds as exact-name rules
    pub fn threshold_rules(&self) -> Vec<ThresholdRule> {
        self.metrics
            .iter()
            .filter_map(|m| {
                m.thresholds
                    .as_ref()
                    .map(|bounds| ThresholdRule::new(m.name.clone(), bounds.clone()))
            })
            .collect()
    }

    /// Build the enabled detectors in configured order
    pub fn build_detectors(&self) -> Result<Vec<Arc<dyn Detector>>> {
        build_detectors(&self.detectors, self.threshold_rules())
            .context("Invalid detector configuration")
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            lookback: Duration::from_secs(self.agent.lookback_window_seconds),
            step: Duration::from_secs(self.agent.step_secs),
            fetch_timeout: Duration::from_secs(self.agent.fetch_timeout_secs),
            // a primary call plus a possible fallback-model retry per anomaly
            enrich_timeout: Duration::from_secs(self.llm.timeout_secs.max(1).saturating_mul(2)),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.agent.check_interval_secs)
    }
}
