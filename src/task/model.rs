// src/task/model.rs
//! Task data model
//!
//! A task is an opaque unit of agent work: the orchestrator only reads its
//! scheduling attributes and hands the payload to the handler registered
//! for its `kind`.

use crate::utils::errors::OrchestratorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Opaque unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task priority; `High` is dequeued first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities in dequeue order
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Queue tier index (0 = dequeued first)
    pub fn tier(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// A unit of work submitted to the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Unique task ID
    pub id: TaskId,

    /// Handler kind (task type / owning agent)
    pub kind: String,

    pub priority: Priority,

    /// Handler input, opaque to the orchestrator
    pub payload: serde_json::Value,

    /// Resource gate the handler will call through, if any
    pub target_resource: Option<String>,

    /// Attempts before the task is terminally failed; `None` uses the configured default
    pub max_attempts: Option<u32>,

    /// Per-attempt deadline; `None` uses the configured default
    #[serde(skip)]
    pub timeout: Option<Duration>,

    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            kind: kind.into(),
            priority: Priority::Normal,
            payload: serde_json::Value::Null,
            target_resource: None,
            max_attempts: None,
            timeout: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.target_resource = Some(resource.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result reported to the submitter
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub kind: String,
    pub state: TaskState,
    /// Attempts actually started (0 when rejected or cancelled while queued)
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<OrchestratorError>,
    /// Wall time from admission to the terminal state
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// Outcome for a task that never ran
    pub fn not_run(task: &Task, state: TaskState, error: OrchestratorError) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind.clone(),
            state,
            attempts: 0,
            output: None,
            error: Some(error),
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = Task::new("code-assessment")
            .with_priority(Priority::High)
            .with_resource("linear")
            .with_max_attempts(0)
            .with_timeout(Duration::from_secs(5))
            .with_payload(serde_json::json!({"scope": "src/"}));

        assert_eq!(task.kind, "code-assessment");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.target_resource.as_deref(), Some("linear"));
        // At least one attempt is always made
        assert_eq!(task.max_attempts, Some(1));
        assert_eq!(task.timeout, Some(Duration::from_secs(5)));
        assert_eq!(task.payload["scope"], "src/");
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new("a");
        let b = Task::new("a");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_priority_tiers() {
        assert!(Priority::High.tier() < Priority::Normal.tier());
        assert!(Priority::Normal.tier() < Priority::Low.tier());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_outcome_serialization() {
        let task = Task::new("fix-implementation");
        let outcome =
            TaskOutcome::not_run(&task, TaskState::Cancelled, OrchestratorError::Cancelled);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"], "cancelled");
        assert_eq!(json["attempts"], 0);
        assert_eq!(json["error"]["type"], "cancelled");
    }
}
