// src/utils/mod.rs
//! Configuration and error types shared across the crate

pub mod config;
pub mod errors;

pub use config::{
    AlertThresholds, DegradationConfig, LoggingConfig, MonitorConfig, OrchestratorConfig,
    ResourceConfig, RetryConfig, WorkflowConfig,
};
pub use errors::{OrchestratorError, Result};
