//! Metrics anomaly agent
//!
//! Process layer around `agent-lib`: configuration loading, the HTTP API
//! and the handling of finished detection cycles.

pub mod api;
pub mod config;
pub mod service;
