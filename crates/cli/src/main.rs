//! Metrics Agent CLI
//!
//! A command-line tool for triggering analyses and inspecting the
//! anomalies, detectors, configuration and health of a running metrics
//! agent.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{anomalies, status};

/// Metrics Agent CLI
#[derive(Parser)]
#[command(name = "mactl")]
#[command(author, version, about = "CLI for the Metrics Anomaly Agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via MACTL_API_URL env var)
    #[arg(long, env = "MACTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one detection cycle now
    Analyze,

    /// Fetch and analyze a single metric without reporting it
    AnalyzeMetric {
        /// Metric name or query, as sent to the metrics store
        metric: String,
    },

    /// Show anomalies from the latest cycle
    Anomalies {
        /// Minimum severity to show
        #[arg(long, short, value_parser = ["low", "medium", "high", "critical"])]
        severity: Option<String>,

        /// Only show anomalies for this metric
        #[arg(long, short)]
        metric: Option<String>,
    },

    /// List active detectors in run order
    Detectors,

    /// List monitored metrics
    Metrics,

    /// Show agent health and readiness
    Health,

    /// Show the agent's effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize client
    let client = client::ApiClient::new(&cli.api_url)?;

    // Execute command
    match cli.command {
        Commands::Analyze => anomalies::analyze(&client, cli.format).await?,
        Commands::AnalyzeMetric { metric } => {
            anomalies::analyze_metric(&client, &metric, cli.format).await?
        }
        Commands::Anomalies { severity, metric } => {
            anomalies::list_anomalies(&client, severity, metric, cli.format).await?
        }
        Commands::Detectors => status::show_detectors(&client, cli.format).await?,
        Commands::Metrics => status::show_metrics(&client, cli.format).await?,
        Commands::Health => status::show_health(&client, cli.format).await?,
        Commands::Config => status::show_config(&client, cli.format).await?,
    }

    Ok(())
}
