// src/orchestrator/mod.rs
//! Orchestration entry points
//!
//! - **Coordinator**: admission, submission, cancellation, shutdown
//! - **Workflow**: parallel, sequential and dependency-aware batches
//! - **Definition**: workflows loaded from YAML
//!
//! # Submission path
//!
//! ```text
//! submit_task ─▶ admission cap ─▶ TaskQueue ─▶ WorkerPool ─▶ handler
//!      │ SystemOverloaded    │ QueueFull            │
//!      ▼                     ▼                      ▼
//!   rejected              rejected          TaskHandle::outcome()
//! ```

pub mod coordinator;
pub mod definition;
pub mod workflow;

pub use coordinator::{Orchestrator, OrchestratorStatus, TaskHandle};
pub use definition::{StrategyKind, TaskDefinition, WorkflowDefinition};
pub use workflow::{
    Workflow, WorkflowReport, WorkflowStrategy, WorkflowSummary, WorkflowTask, WorkflowTaskOutcome,
};
