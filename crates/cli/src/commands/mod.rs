//! Subcommand implementations

pub mod anomalies;
pub mod status;
