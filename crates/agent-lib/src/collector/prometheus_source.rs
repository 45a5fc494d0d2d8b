//! Prometheus range query client

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{SourceError, TimeSeriesSource};
use crate::models::{MetricKind, Sample, Series};

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<RangeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangeData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Reads series from the Prometheus HTTP API
pub struct PrometheusSource {
    client: Client,
    base_url: Url,
}

impl PrometheusSource {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        // Keep any path prefix when joining API paths
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|e| SourceError::Decode(format!("invalid API path '{}': {}", path, e)))
    }

    /// Verify the server answers its build info endpoint
    pub async fn check_connection(&self) -> Result<(), SourceError> {
        let url = self.api_url("api/v1/status/buildinfo")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SourceError::Transient(format!(
                "HTTP {} from {}",
                response.status(),
                self.base_url
            )));
        }
        Ok(())
    }

    fn to_series(query: &str, body: ApiResponse) -> Result<Series, SourceError> {
        if body.status != "success" {
            return Err(SourceError::Transient(
                body.error.unwrap_or_else(|| format!("query status '{}'", body.status)),
            ));
        }
        let data = body
            .data
            .ok_or_else(|| SourceError::Decode("missing data".to_string()))?;
        if data.result_type != "matrix" {
            return Err(SourceError::Decode(format!(
                "expected matrix result, got '{}'",
                data.result_type
            )));
        }

        let total = data.result.len();
        let first = data
            .result
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound(query.to_string()))?;
        if total > 1 {
            debug!(query = %query, series = total, "Query matched several series, using the first");
        }

        let mut series = Series::new(query, MetricKind::Gauge);
        let mut dropped = 0usize;
        for (ts, raw) in first.values {
            let timestamp = timestamp_from_secs(ts)
                .ok_or_else(|| SourceError::Decode(format!("invalid timestamp {}", ts)))?;
            let value: f64 = raw
                .parse()
                .map_err(|_| SourceError::Decode(format!("invalid sample value '{}'", raw)))?;
            if !value.is_finite() {
                dropped += 1;
                continue;
            }
            series
                .samples
                .push(Sample::new(timestamp, value).with_labels(first.metric.clone()));
        }

        if dropped > 0 {
            warn!(query = %query, dropped = dropped, "Dropped non-finite samples");
        }
        if series.is_empty() {
            return Err(SourceError::NotFound(query.to_string()));
        }
        Ok(series)
    }
}

fn timestamp_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}

#[async_trait]
impl TimeSeriesSource for PrometheusSource {
    async fn fetch_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Series, SourceError> {
        let url = self.api_url("api/v1/query_range")?;
        let params = [
            ("query", query.to_string()),
            ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("step", format!("{}s", step.as_secs().max(1))),
        ];

        let response = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // Query errors come back as JSON with a 4xx status
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("HTTP {}: {}", status, body));
            return Err(SourceError::Transient(message));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        Self::to_series(query, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;
    use serde_json::json;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        (end - chrono::Duration::hours(1), end)
    }

    fn matrix(values: serde_json::Value) -> String {
        json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{ "metric": { "instance": "node-1" }, "values": values }]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_fetch_range_parses_matrix() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("query".into(), "cpu_usage".into()),
                Matcher::UrlEncoded("step".into(), "60s".into()),
                Matcher::UrlEncoded("start".into(), "2024-01-01T00:00:00Z".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(matrix(json!([[1704067200, "1.5"], [1704067260, "2"]])))
            .create_async()
            .await;

        let source = PrometheusSource::new(&server.url(), Duration::from_secs(5)).unwrap();
        let (start, end) = window();
        let series = source
            .fetch_range("cpu_usage", start, end, Duration::from_secs(60))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(series.name, "cpu_usage");
        assert_eq!(series.values(), vec![1.5, 2.0]);
        assert_eq!(series.samples[0].timestamp, start);
        assert_eq!(series.samples[0].labels["instance"], "node-1");
    }

    #[tokio::test]
    async fn test_empty_result_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({ "status": "success", "data": { "resultType": "matrix", "result": [] } })
                    .to_string(),
            )
            .create_async()
            .await;

        let source = PrometheusSource::new(&server.url(), Duration::from_secs(5)).unwrap();
        let (start, end) = window();
        let err = source
            .fetch_range("missing_metric", start, end, Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::NotFound(q) if q == "missing_metric"));
    }

    #[tokio::test]
    async fn test_non_finite_samples_dropped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(matrix(json!([
                [1704067200, "1"],
                [1704067260, "NaN"],
                [1704067320, "+Inf"],
                [1704067380, "4"]
            ])))
            .create_async()
            .await;

        let source = PrometheusSource::new(&server.url(), Duration::from_secs(5)).unwrap();
        let (start, end) = window();
        let series = source
            .fetch_range("cpu_usage", start, end, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(series.values(), vec![1.0, 4.0]);
    }

    #[tokio::test]
    async fn test_query_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#)
            .create_async()
            .await;

        let source = PrometheusSource::new(&server.url(), Duration::from_secs(5)).unwrap();
        let (start, end) = window();
        let err = source
            .fetch_range("rate(", start, end, Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::Transient(msg) if msg == "parse error"));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let source = PrometheusSource::new(&server.url(), Duration::from_secs(5)).unwrap();
        let (start, end) = window();
        let err = source
            .fetch_range("up", start, end, Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::Transient(_)));
    }

    #[tokio::test]
    async fn test_check_connection() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/prometheus/api/v1/status/buildinfo")
            .with_status(200)
            .with_body(r#"{"status":"success","data":{"version":"2.48.0"}}"#)
            .create_async()
            .await;

        let source = PrometheusSource::new(
            &format!("{}/prometheus", server.url()),
            Duration::from_secs(5),
        )
        .unwrap();

        source.check_connection().await.unwrap();
        mock.assert_async().await;
    }
}
