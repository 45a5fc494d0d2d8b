//! Analysis and anomaly listing commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{AnalysisResult, AnomalyEntry, AnomalyList, ApiClient, MetricAnalysis};
use crate::output::{
    color_severity, format_confidence, format_timestamp, format_value, print_info, print_json,
    print_success, print_table, print_warning, OutputFormat,
};

/// Row for anomalies table
#[derive(Tabled)]
struct AnomalyRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Observed")]
    observed: String,
    #[tabled(rename = "Expected")]
    expected: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Detector")]
    detector: String,
}

impl From<&AnomalyEntry> for AnomalyRow {
    fn from(entry: &AnomalyEntry) -> Self {
        let unit = &entry.context.unit;
        Self {
            time: format_timestamp(&entry.start_time),
            metric: entry.metric_name.clone(),
            kind: entry.anomaly_type.clone(),
            severity: color_severity(&entry.severity),
            observed: format_value(entry.observed_value, unit),
            expected: entry
                .expected_value
                .map(|v| format_value(v, unit))
                .unwrap_or_else(|| "-".to_string()),
            confidence: format_confidence(entry.confidence),
            detector: entry.detector.clone(),
        }
    }
}

fn print_anomalies(anomalies: &[AnomalyEntry]) {
    print_table(anomalies.iter().map(AnomalyRow::from).collect());

    for entry in anomalies.iter().filter(|a| a.severity == "critical") {
        println!(
            "  {} {}: {}",
            "!".red().bold(),
            entry.metric_name.bold(),
            entry.description
        );
    }
    for entry in anomalies {
        if let Some(analysis) = &entry.llm_analysis {
            println!("\n{} {}", entry.metric_name.cyan(), "analysis:".bold());
            println!("  {}", analysis);
        }
    }
}

/// Trigger one detection cycle now
pub async fn analyze(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let result: AnalysisResult = client.post("api/v1/analyze").await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            print_success(&format!(
                "Cycle {} finished in {:.0}ms",
                result.cycle_id, result.duration_ms
            ));
            println!(
                "Metrics analyzed: {}  skipped: {}",
                result.metrics_analyzed, result.metrics_skipped
            );
            if result.metrics_skipped > 0 {
                print_warning("Some metrics were skipped; check the agent logs for the reason");
            }
            println!();

            if result.anomalies.is_empty() {
                print_info("No anomalies detected");
                return Ok(());
            }
            print_anomalies(&result.anomalies);
            println!("\nTotal: {} anomalies", result.anomalies_count);
        }
    }

    Ok(())
}

/// Fetch and analyze one metric without reporting anything downstream
pub async fn analyze_metric(client: &ApiClient, metric: &str, format: OutputFormat) -> Result<()> {
    let result: MetricAnalysis = client.analyze_metric(metric).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            print_success(&format!(
                "{} samples for {} between {} and {}",
                result.samples,
                result.metric_name.bold(),
                format_timestamp(&result.window_start),
                format_timestamp(&result.window_end)
            ));
            if !result.configured {
                print_warning("Metric is not monitored; all detectors were applied");
            }
            println!();

            if result.anomalies.is_empty() {
                print_info("No anomalies detected");
                return Ok(());
            }
            print_anomalies(&result.anomalies);
            println!("\nTotal: {} anomalies", result.anomalies_count);
        }
    }

    Ok(())
}

/// List anomalies from the latest cycle
pub async fn list_anomalies(
    client: &ApiClient,
    severity: Option<String>,
    metric: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut query = Vec::new();
    if let Some(severity) = &severity {
        query.push(("severity", severity.as_str()));
    }
    if let Some(metric) = &metric {
        query.push(("metric", metric.as_str()));
    }

    let result: AnomalyList = client.get_with_query("api/v1/anomalies", &query).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            let Some(timestamp) = &result.timestamp else {
                print_warning("No detection cycle has completed yet");
                return Ok(());
            };

            println!("{}", "Latest Anomalies".bold());
            println!("{}", "=".repeat(60));
            println!("Cycle finished: {}", format_timestamp(timestamp).cyan());
            println!();

            if result.anomalies.is_empty() {
                print_info("No anomalies match the given filters");
                return Ok(());
            }
            print_anomalies(&result.anomalies);
            println!("\nTotal: {} anomalies", result.count);
        }
    }

    Ok(())
}
