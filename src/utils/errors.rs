// src/utils/errors.rs
//! Error taxonomy for the orchestrator
//!
//! Every per-task failure is folded into a [`TaskOutcome`](crate::task::TaskOutcome)
//! rather than propagated, so the error type is `Clone` and serializable.

use crate::task::TaskId;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator errors
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorError {
    /// Gate at capacity and its wait queue is full
    #[error("Resource exhausted: {resource} (capacity and wait queue full)")]
    ResourceExhausted { resource: String },

    /// Breaker for the resource has tripped
    #[error("Circuit open for resource: {resource}")]
    CircuitOpen { resource: String },

    /// Global admission cap exceeded
    #[error("System overloaded: {in_flight} tasks in flight (cap {cap})")]
    SystemOverloaded { in_flight: usize, cap: usize },

    /// Handler exceeded its deadline
    #[error("Task timed out after {timeout_ms}ms")]
    TaskTimeout { timeout_ms: u64 },

    /// Handler's own logic failed
    #[error("Handler error: {message}")]
    HandlerError { message: String },

    /// Task queue at capacity
    #[error("Task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Task cancelled by the caller or by workflow propagation
    #[error("Task cancelled")]
    Cancelled,

    /// A live task already uses this id
    #[error("Task {task_id} is already submitted")]
    DuplicateTask { task_id: TaskId },

    #[error("Unknown resource: {name}")]
    UnknownResource { name: String },

    #[error("No handler registered for task kind: {kind}")]
    UnknownTaskKind { kind: String },

    #[error("Invalid workflow: {reason}")]
    InvalidWorkflow { reason: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Export failed: {message}")]
    ExportFailed { message: String },

    /// Orchestrator stopped before the task settled
    #[error("Orchestrator is shut down")]
    ShutDown,
}

impl OrchestratorError {
    /// Wrap a handler failure
    pub fn handler(message: impl Into<String>) -> Self {
        Self::HandlerError {
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::TaskTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub fn invalid_workflow(reason: impl Into<String>) -> Self {
        Self::InvalidWorkflow {
            reason: reason.into(),
        }
    }

    /// Whether the core retries a task that failed with this error.
    ///
    /// Admission errors (`QueueFull`, `SystemOverloaded`) are deliberate
    /// backpressure and are left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::CircuitOpen { .. }
                | Self::TaskTimeout { .. }
                | Self::HandlerError { .. }
        )
    }

    /// Stable short name, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::SystemOverloaded { .. } => "system_overloaded",
            Self::TaskTimeout { .. } => "task_timeout",
            Self::HandlerError { .. } => "handler_error",
            Self::QueueFull { .. } => "queue_full",
            Self::Cancelled => "cancelled",
            Self::DuplicateTask { .. } => "duplicate_task",
            Self::UnknownResource { .. } => "unknown_resource",
            Self::UnknownTaskKind { .. } => "unknown_task_kind",
            Self::InvalidWorkflow { .. } => "invalid_workflow",
            Self::ConfigError { .. } => "config_error",
            Self::ExportFailed { .. } => "export_failed",
            Self::ShutDown => "shut_down",
        }
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::invalid_workflow(format!("YAML parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OrchestratorError::handler("boom").is_retryable());
        assert!(OrchestratorError::timeout(Duration::from_secs(1)).is_retryable());
        assert!(OrchestratorError::CircuitOpen { resource: "linear".into() }.is_retryable());
        assert!(!OrchestratorError::QueueFull { capacity: 1 }.is_retryable());
        assert!(!OrchestratorError::SystemOverloaded { in_flight: 3, cap: 3 }.is_retryable());
        assert!(!OrchestratorError::Cancelled.is_retryable());
        assert!(!OrchestratorError::DuplicateTask { task_id: TaskId::new() }.is_retryable());
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let err = OrchestratorError::ResourceExhausted {
            resource: "github".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "resource_exhausted");
        assert_eq!(json["resource"], "github");
        assert_eq!(err.kind(), "resource_exhausted");
    }

    #[test]
    fn test_timeout_display() {
        let err = OrchestratorError::timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Task timed out after 1500ms");
    }
}
