//! API client for communicating with the metrics agent

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the metrics agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        // A manual analysis runs a full cycle, so allow for slow stores
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_with_query(path, &[] as &[(&str, &str)]).await
    }

    /// Make a GET request with query parameters
    pub async fn get_with_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Make a POST request without a body
    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.post_url(url).await
    }

    /// Analyze a single metric by name
    pub async fn analyze_metric(&self, metric: &str) -> Result<MetricAnalysis> {
        let url = self.metric_analysis_url(metric)?;
        self.post_url(url).await
    }

    /// URL of a metric's analysis endpoint, with the name as one path segment
    fn metric_analysis_url(&self, metric: &str) -> Result<Url> {
        let mut url = self.base_url.join("api/v1/metrics").context("Invalid path")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("API URL cannot have a path"))?
            .push(metric)
            .push("analyze");
        Ok(url)
    }

    async fn post_url<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .client
            .post(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// GET a health endpoint whose body is meaningful on 503 too
    pub async fn get_with_status<T: DeserializeOwned>(&self, path: &str) -> Result<(u16, T)> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status().as_u16();
        let body = response.json().await.context("Failed to parse response")?;
        Ok((status, body))
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportContext {
    pub metric_type: String,
    pub unit: String,
    pub lookback_window: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEntry {
    pub anomaly_id: String,
    pub metric_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub detector: String,
    pub anomaly_type: String,
    pub severity: String,
    pub description: String,
    pub observed_value: f64,
    pub expected_value: Option<f64>,
    pub threshold: Option<f64>,
    pub confidence: f64,
    pub start_time: String,
    pub end_time: String,
    pub context: ReportContext,
    pub suggested_category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_validated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_analysis: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub success: bool,
    pub cycle_id: String,
    pub timestamp: String,
    pub duration_ms: f64,
    pub metrics_analyzed: usize,
    pub metrics_skipped: usize,
    pub anomalies_count: usize,
    pub anomalies: Vec<AnomalyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricAnalysis {
    pub metric_name: String,
    pub timestamp: String,
    pub configured: bool,
    pub data_available: bool,
    pub samples: usize,
    pub window_start: String,
    pub window_end: String,
    pub anomalies_count: usize,
    pub anomalies: Vec<AnomalyEntry>,
}

/// Effective agent configuration; sections are kept as raw JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent: serde_json::Value,
    pub prometheus: serde_json::Value,
    pub detectors: serde_json::Value,
    pub metrics_monitored: Vec<String>,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyList {
    pub timestamp: Option<String>,
    pub count: usize,
    pub anomalies: Vec<AnomalyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorEntry {
    pub name: String,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorList {
    pub count: usize,
    pub detectors: Vec<DetectorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEntry {
    pub name: String,
    pub enabled: bool,
    pub kind: String,
    pub unit: String,
    pub detectors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricList {
    pub count: usize,
    pub metrics: Vec<MetricEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
