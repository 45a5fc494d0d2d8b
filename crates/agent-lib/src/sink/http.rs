//! HTTP delivery to the orchestrator

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{AnomalyReport, AnomalySink, ReportBatch, SinkError};

/// Posts each cycle's reports as one JSON batch
pub struct HttpSink {
    client: Client,
    endpoint: Url,
    agent_name: String,
}

impl HttpSink {
    pub fn new(endpoint: &str, agent_name: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let endpoint = Url::parse(endpoint)?;

        Ok(Self {
            client,
            endpoint,
            agent_name: agent_name.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl AnomalySink for HttpSink {
    async fn deliver(&self, reports: &[AnomalyReport]) -> Result<(), SinkError> {
        let batch = ReportBatch {
            agent: self.agent_name.clone(),
            timestamp: Utc::now().to_rfc3339(),
            anomalies: reports.to_vec(),
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&batch)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status { status, body });
        }

        debug!(
            endpoint = %self.endpoint,
            anomalies = reports.len(),
            "Reports delivered"
        );
        Ok(())
    }
}
