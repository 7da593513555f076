// src/monitor/mod.rs
//! Performance monitoring
//!
//! - **Sampler**: periodic samples of queue depth, worker utilization and
//!   per-resource latency/success rate, kept in a bounded ring buffer
//! - **Alerts**: rolling-window threshold checks with a per-type cooldown
//! - **Exporter**: JSON snapshot file for external consumers
//!
//! # Architecture
//!
//! ```text
//! MetricsSource ──tick──▶ PerformanceSample ──▶ ring buffer (retention)
//!                                                   │ last N samples
//!                                                   ▼
//!                                      evaluate ──▶ AlertManager (cooldown)
//!                                                   │
//!                          on_alert callbacks ◀─────┼────▶ broadcast subscribers
//! ```

pub mod alerts;
pub mod exporter;
pub mod sampler;

pub use alerts::{Alert, AlertManager, AlertType, Severity};
pub use exporter::MetricsExporter;
pub use sampler::{
    MetricsSnapshot, MetricsSource, PerformanceMonitor, PerformanceSample, ResourceSample,
    WindowAverages,
};
