//! LLM-backed anomaly validation
//!
//! Sends each anomaly to an OpenAI-compatible chat completions endpoint
//! and attaches the model's verdict as metadata.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AnomalyEnricher, EnrichError};
use crate::models::Anomaly;

const SYSTEM_PROMPT: &str = "You are an expert in metrics and monitoring.";
const TOP_P: f64 = 0.9;

/// Error codes that make a retry with the fallback model worthwhile
const FALLBACK_TRIGGERS: [&str; 2] = ["model_decommissioned", "model_not_found"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub fallback_model: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            model: "openai/gpt-oss-120b".to_string(),
            fallback_model: Some("llama-3.3-70b-versatile".to_string()),
            api_key_env: "GROQ_API_KEY".to_string(),
            timeout_secs: 30,
            temperature: 0.3,
            max_tokens: 500,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Validates anomalies with a language model
pub struct LlmEnricher {
    client: Client,
    config: LlmConfig,
    api_key: Option<String>,
}

impl LlmEnricher {
    /// Create an enricher reading the API key from the configured variable
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: LlmConfig, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        if config.enabled && api_key.is_none() {
            warn!(
                api_key_env = %config.api_key_env,
                "LLM enrichment enabled but no API key found, enrichment disabled"
            );
        } else if config.enabled {
            info!(model = %config.model, "LLM enrichment initialized");
        }

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn build_prompt(anomaly: &Anomaly) -> String {
        let expected = anomaly
            .expected_value()
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "N/A".to_string());

        format!(
            "You are validating an anomaly reported by a monitoring agent.\n\
             Decide whether it is real and provide a short analysis.\n\n\
             DETECTED ANOMALY:\n\
             - Metric: {metric}\n\
             - Type: {kind}\n\
             - Observed value: {value:.2}\n\
             - Expected value: {expected}\n\
             - Severity: {severity}\n\
             - Detector confidence: {confidence:.2}\n\
             - Initial description: {description}\n\n\
             QUESTIONS:\n\
             1. Is this anomaly real (yes/no) and why?\n\
             2. What is the potential impact on the service?\n\
             3. Which actions would you recommend to investigate?\n\
             4. Could this be a false positive?\n\n\
             Be precise and concise.",
            metric = anomaly.metric_name(),
            kind = anomaly.kind(),
            value = anomaly.value(),
            expected = expected,
            severity = anomaly.severity(),
            confidence = anomaly.confidence(),
            description = anomaly.description(),
        )
    }

    async fn call_model(&self, model: &str, prompt: &str) -> Result<String, EnrichError> {
        let api_key = self.api_key.as_deref().ok_or(EnrichError::Disabled)?;
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: TOP_P,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EnrichError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EnrichError::Api { status, body });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| EnrichError::Decode(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| EnrichError::Decode("response contained no message".to_string()))
    }

    /// Analysis text and the model that produced it
    async fn analyze(&self, anomaly: &Anomaly) -> Result<(String, String), EnrichError> {
        let prompt = Self::build_prompt(anomaly);

        match self.call_model(&self.config.model, &prompt).await {
            Ok(analysis) => Ok((analysis, self.config.model.clone())),
            Err(EnrichError::Api { status, body })
                if FALLBACK_TRIGGERS.iter().any(|code| body.contains(code)) =>
            {
                let Some(fallback) = self.config.fallback_model.as_deref() else {
                    return Err(EnrichError::Api { status, body });
                };
                warn!(
                    model = %self.config.model,
                    fallback = %fallback,
                    "Model unavailable, retrying with fallback model"
                );
                let analysis = self.call_model(fallback, &prompt).await?;
                Ok((analysis, fallback.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AnomalyEnricher for LlmEnricher {
    fn is_enabled(&self) -> bool {
        self.config.enabled && self.api_key.is_some()
    }

    async fn enrich(&self, anomalies: &[Anomaly]) -> Result<Vec<Anomaly>, EnrichError> {
        if !self.is_enabled() {
            return Err(EnrichError::Disabled);
        }

        let mut enriched = Vec::with_capacity(anomalies.len());
        let mut validated = 0;
        let mut first_error = None;
        for anomaly in anomalies {
            let mut annotated = anomaly.clone();
            match self.analyze(anomaly).await {
                Ok((analysis, model)) => {
                    debug!(
                        anomaly_id = %anomaly.id(),
                        model = %model,
                        "LLM validation complete"
                    );
                    annotated.annotate("llm_validated", true);
                    annotated.annotate("llm_analysis", analysis);
                    annotated.annotate("llm_model", model);
                    validated += 1;
                }
                Err(e) => {
                    warn!(
                        anomaly_id = %anomaly.id(),
                        metric = %anomaly.metric_name(),
                        error = %e,
                        "LLM validation failed for anomaly"
                    );
                    annotated.annotate("llm_validated", false);
                    annotated.annotate("llm_error", e.to_string());
                    first_error.get_or_insert(e);
                }
            }
            enriched.push(annotated);
        }

        // nothing got through: report the enricher as failing
        if validated == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(enriched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnomalyKind, Severity};
    use chrono::Utc;
    use mockito::Matcher;
    use serde_json::json;

    fn anomaly() -> Anomaly {
        Anomaly::builder("cpu_usage", "spike_detector", AnomalyKind::Spike)
            .at(Utc::now(), 300.0)
            .expected(100.0)
            .severity(Severity::Critical)
            .confidence(0.8)
            .description("Spike detected")
            .build()
            .unwrap()
    }

    fn config(endpoint: String) -> LlmConfig {
        LlmConfig {
            enabled: true,
            endpoint,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn completion(content: &str) -> String {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
            .to_string()
    }

    #[test]
    fn test_disabled_without_api_key() {
        let enricher = LlmEnricher::with_api_key(config("http://localhost".into()), None).unwrap();
        assert!(!enricher.is_enabled());

        let enricher = LlmEnricher::with_api_key(
            LlmConfig {
                enabled: false,
                ..Default::default()
            },
            Some("key".into()),
        )
        .unwrap();
        assert!(!enricher.is_enabled());
    }

    #[test]
    fn test_prompt_mentions_anomaly_fields() {
        let prompt = LlmEnricher::build_prompt(&anomaly());
        assert!(prompt.contains("cpu_usage"));
        assert!(prompt.contains("spike"));
        assert!(prompt.contains("300.00"));
        assert!(prompt.contains("100.00"));
        assert!(prompt.contains("critical"));
    }

    #[tokio::test]
    async fn test_enrich_annotates_each_anomaly() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(json!({ "model": "openai/gpt-oss-120b" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("Yes, this is a real spike."))
            .expect(2)
            .create_async()
            .await;

        let enricher = LlmEnricher::with_api_key(
            config(format!("{}/v1/chat/completions", server.url())),
            Some("secret".into()),
        )
        .unwrap();

        let input = vec![anomaly(), anomaly()];
        let output = enricher.enrich(&input).await.unwrap();

        mock.assert_async().await;
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].id(), input[0].id());
        assert_eq!(output[0].metadata()["llm_validated"], json!(true));
        assert_eq!(
            output[0].metadata()["llm_analysis"],
            json!("Yes, this is a real spike.")
        );
        assert_eq!(output[1].metadata()["llm_model"], json!("openai/gpt-oss-120b"));
    }

    #[tokio::test]
    async fn test_falls_back_on_decommissioned_model() {
        let mut server = mockito::Server::new_async().await;
        let primary = server
            .mock("POST", "/chat")
            .match_body(Matcher::PartialJson(json!({ "model": "old-model" })))
            .with_status(400)
            .with_body(r#"{"error":{"code":"model_decommissioned"}}"#)
            .create_async()
            .await;
        let fallback = server
            .mock("POST", "/chat")
            .match_body(Matcher::PartialJson(json!({ "model": "new-model" })))
            .with_status(200)
            .with_body(completion("Likely real."))
            .create_async()
            .await;

        let enricher = LlmEnricher::with_api_key(
            LlmConfig {
                model: "old-model".into(),
                fallback_model: Some("new-model".into()),
                ..config(format!("{}/chat", server.url()))
            },
            Some("secret".into()),
        )
        .unwrap();

        let output = enricher.enrich(&[anomaly()]).await.unwrap();

        primary.assert_async().await;
        fallback.assert_async().await;
        assert_eq!(output[0].metadata()["llm_model"], json!("new-model"));
    }

    #[tokio::test]
    async fn test_failed_request_is_annotated_and_kept() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/chat")
            .match_body(Matcher::Regex("cpu_usage".into()))
            .with_status(200)
            .with_body(completion("Real spike."))
            .create_async()
            .await;
        let failing = server
            .mock("POST", "/chat")
            .match_body(Matcher::Regex("memory_usage".into()))
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let enricher = LlmEnricher::with_api_key(
            config(format!("{}/chat", server.url())),
            Some("secret".into()),
        )
        .unwrap();

        let memory = Anomaly::builder("memory_usage", "spike_detector", AnomalyKind::Drop)
            .at(Utc::now(), 10.0)
            .severity(Severity::Medium)
            .confidence(0.6)
            .build()
            .unwrap();
        let input = vec![anomaly(), memory];
        let output = enricher.enrich(&input).await.unwrap();

        ok.assert_async().await;
        failing.assert_async().await;
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].metadata()["llm_validated"], json!(true));
        assert_eq!(output[1].id(), input[1].id());
        assert_eq!(output[1].metadata()["llm_validated"], json!(false));
        assert!(output[1].metadata()["llm_error"]
            .as_str()
            .unwrap()
            .contains("500"));
        assert!(!output[1].metadata().contains_key("llm_analysis"));
    }

    #[tokio::test]
    async fn test_batch_fails_when_every_request_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let enricher = LlmEnricher::with_api_key(
            config(format!("{}/chat", server.url())),
            Some("secret".into()),
        )
        .unwrap();

        let result = enricher.enrich(&[anomaly()]).await;
        assert!(matches!(result, Err(EnrichError::Api { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_empty_choices_is_a_decode_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let enricher = LlmEnricher::with_api_key(
            config(format!("{}/chat", server.url())),
            Some("secret".into()),
        )
        .unwrap();

        let result = enricher.enrich(&[anomaly()]).await;
        assert!(matches!(result, Err(EnrichError::Decode(_))));
    }
}
