// src/lib.rs
//! MCP Orchestrator Library
//!
//! Bounded-concurrency orchestration core for running many agent tasks
//! against a small set of rate-limited MCP servers without overloading them.
//!
//! # Architecture
//!
//! - **resource**: per-server gates with FIFO waiting and circuit breakers
//! - **task**: task model, priority queue, retry policy
//! - **runtime**: worker pool, handler contract, live task tracking
//! - **orchestrator**: admission control, workflows, cancellation
//! - **monitor**: sampling, threshold alerts, JSON export
//! - **observability**: tracing and Prometheus setup
//! - **utils**: configuration and errors

pub mod monitor;
pub mod observability;
pub mod orchestrator;
pub mod resource;
pub mod runtime;
pub mod task;
pub mod utils;

// Re-export commonly used types
pub use monitor::{Alert, PerformanceMonitor};
pub use orchestrator::{Orchestrator, TaskHandle, Workflow, WorkflowDefinition, WorkflowReport};
pub use resource::{GateRegistry, ResourceGate, ResourcePermit};
pub use runtime::{handler_fn, TaskContext, TaskHandler};
pub use task::{Priority, Task, TaskId, TaskOutcome, TaskState};
pub use utils::config::OrchestratorConfig;
pub use utils::errors::{OrchestratorError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
