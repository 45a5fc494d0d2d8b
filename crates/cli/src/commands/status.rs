//! Detector, metric and health inspection commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{AgentSettings, ApiClient, DetectorList, HealthStatus, MetricList, Readiness};
use crate::output::{color_status, print_json, print_table, print_warning, OutputFormat};

/// Row for detectors table
#[derive(Tabled)]
struct DetectorRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Detector")]
    name: String,
}

/// Row for metrics table
#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Detectors")]
    detectors: String,
}

/// Row for component health table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Show active detectors in run order
pub async fn show_detectors(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let result: DetectorList = client.get("api/v1/detectors").await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            if result.detectors.is_empty() {
                print_warning("No detectors are enabled");
                return Ok(());
            }
            print_table(
                result
                    .detectors
                    .into_iter()
                    .map(|d| DetectorRow {
                        position: d.position + 1,
                        name: d.name,
                    })
                    .collect(),
            );
        }
    }

    Ok(())
}

/// Show monitored metrics
pub async fn show_metrics(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let result: MetricList = client.get("api/v1/metrics").await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            print_table(
                result
                    .metrics
                    .into_iter()
                    .map(|m| MetricRow {
                        name: m.name,
                        kind: m.kind,
                        unit: if m.unit.is_empty() { "-".to_string() } else { m.unit },
                        enabled: if m.enabled {
                            "yes".green().to_string()
                        } else {
                            "no".red().to_string()
                        },
                        detectors: if m.detectors.is_empty() {
                            "none".dimmed().to_string()
                        } else {
                            m.detectors.join(", ")
                        },
                    })
                    .collect(),
            );
            println!("\nTotal: {} metrics", result.count);
        }
    }

    Ok(())
}

/// Show the agent's effective configuration
pub async fn show_config(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let result: AgentSettings = client.get("api/v1/config").await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            let field = |section: &serde_json::Value, key: &str| match &section[key] {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => "-".to_string(),
                other => other.to_string(),
            };

            println!("{}", "Agent Configuration".bold());
            println!("{}", "=".repeat(50));
            println!("Name:            {}", field(&result.agent, "name").cyan());
            println!("Prometheus:      {}", field(&result.prometheus, "url"));
            println!("Check interval:  {}s", result.check_interval_secs);
            println!(
                "Lookback window: {}s",
                field(&result.agent, "lookback_window_seconds")
            );
            println!("Step:            {}s", field(&result.agent, "step_secs"));
            println!("Detector order:  {}", field(&result.detectors, "order"));
            println!();

            if result.metrics_monitored.is_empty() {
                print_warning("No metrics are configured");
            } else {
                println!("{}", "Monitored metrics".bold());
                for metric in &result.metrics_monitored {
                    println!("  - {}", metric);
                }
            }
        }
    }

    Ok(())
}

/// Show agent health and readiness
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (_, health): (u16, HealthStatus) = client.get_with_status("healthz").await?;
    let (_, readiness): (u16, Readiness) = client.get_with_status("readyz").await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "health": health,
            "readiness": readiness,
        }))?,
        OutputFormat::Table => {
            println!("{}", "Agent Health".bold());
            println!("{}", "=".repeat(50));
            println!("Status:     {}", color_status(&health.status));
            let ready = if readiness.ready { "ready" } else { "not ready" };
            match &readiness.reason {
                Some(reason) => println!("Readiness:  {} ({})", color_status(ready), reason),
                None => println!("Readiness:  {}", color_status(ready)),
            }
            println!();

            print_table(
                health
                    .components
                    .into_iter()
                    .map(|(name, c)| ComponentRow {
                        name,
                        status: color_status(&c.status),
                        message: c.message.unwrap_or_else(|| "-".to_string()),
                    })
                    .collect(),
            );
        }
    }

    Ok(())
}
