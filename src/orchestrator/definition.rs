// src/orchestrator/definition.rs
//! Declarative workflow files
//!
//! ```yaml
//! name: release
//! strategy: dependency_aware
//! tasks:
//!   - key: build
//!     kind: command
//!     resource: build-server
//!     payload: { command: cargo, args: [build, --release] }
//!   - key: publish
//!     kind: command
//!     depends_on: [build]
//!     timeout_ms: 60000
//!     payload: { command: ./publish.sh }
//! ```

use crate::orchestrator::workflow::{Workflow, WorkflowStrategy, WorkflowTask};
use crate::task::{Priority, Task};
use crate::utils::config::WorkflowConfig;
use crate::utils::errors::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Parallel,
    Sequential,
    DependencyAware,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub key: String,
    pub kind: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Parallel only; falls back to `workflow.parallel_success_ratio`
    #[serde(default)]
    pub min_success_ratio: Option<f64>,
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::invalid_workflow(format!("cannot read {:?}: {}", path, e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Build a validated [`Workflow`]
    pub fn into_workflow(self, defaults: &WorkflowConfig) -> Result<Workflow> {
        let strategy = match self.strategy {
            StrategyKind::Parallel => WorkflowStrategy::Parallel {
                min_success_ratio: self
                    .min_success_ratio
                    .unwrap_or(defaults.parallel_success_ratio),
            },
            StrategyKind::Sequential => WorkflowStrategy::Sequential,
            StrategyKind::DependencyAware => WorkflowStrategy::DependencyAware,
        };

        let mut workflow = Workflow::new(self.name, strategy);
        for def in self.tasks {
            let mut task = Task::new(def.kind)
                .with_priority(def.priority)
                .with_payload(def.payload);
            if let Some(resource) = def.resource {
                task = task.with_resource(resource);
            }
            if let Some(max_attempts) = def.max_attempts {
                task = task.with_max_attempts(max_attempts);
            }
            if let Some(timeout_ms) = def.timeout_ms {
                task = task.with_timeout(Duration::from_millis(timeout_ms));
            }

            let mut entry = WorkflowTask::new(def.key, task).depends_on(def.depends_on);
            if def.optional {
                entry = entry.optional();
            }
            workflow = workflow.with_task(entry);
        }

        workflow.validate()?;
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = r#"
name: release
strategy: dependency_aware
tasks:
  - key: build
    kind: command
    priority: high
    resource: build-server
    payload:
      command: cargo
      args: [build]
  - key: lint
    kind: command
    optional: true
    payload: { command: cargo, args: [clippy] }
  - key: publish
    kind: command
    depends_on: [build]
    max_attempts: 2
    timeout_ms: 1500
"#;

    #[test]
    fn test_parse_dependency_workflow() {
        let workflow = WorkflowDefinition::from_yaml_str(RELEASE)
            .unwrap()
            .into_workflow(&WorkflowConfig::default())
            .unwrap();

        assert_eq!(workflow.name, "release");
        assert_eq!(workflow.strategy, WorkflowStrategy::DependencyAware);
        assert_eq!(workflow.tasks.len(), 3);

        let build = &workflow.tasks[0];
        assert_eq!(build.task.priority, Priority::High);
        assert_eq!(build.task.target_resource.as_deref(), Some("build-server"));
        assert_eq!(build.task.payload["args"][0], "build");

        assert!(workflow.tasks[1].optional);

        let publish = &workflow.tasks[2];
        assert_eq!(publish.depends_on, vec!["build"]);
        assert_eq!(publish.task.max_attempts, Some(2));
        assert_eq!(publish.task.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(publish.task.priority, Priority::Normal);
    }

    #[test]
    fn test_parallel_ratio_default() {
        let yaml = "name: fanout\ntasks:\n  - { key: a, kind: noop }\n";
        let defaults = WorkflowConfig {
            parallel_success_ratio: 0.8,
        };
        let workflow = WorkflowDefinition::from_yaml_str(yaml)
            .unwrap()
            .into_workflow(&defaults)
            .unwrap();
        assert_eq!(
            workflow.strategy,
            WorkflowStrategy::Parallel { min_success_ratio: 0.8 }
        );
    }

    #[test]
    fn test_rejects_invalid() {
        let err = WorkflowDefinition::from_yaml_str("name: [unterminated").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflow { .. }));
        assert!(err.to_string().contains("YAML parse error"));

        let cycle = r#"
name: loop
strategy: dependency_aware
tasks:
  - { key: a, kind: noop, depends_on: [b] }
  - { key: b, kind: noop, depends_on: [a] }
"#;
        let err = WorkflowDefinition::from_yaml_str(cycle)
            .unwrap()
            .into_workflow(&WorkflowConfig::default())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflow { .. }));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.yaml");
        std::fs::write(&path, RELEASE).unwrap();

        let def = WorkflowDefinition::from_file(&path).await.unwrap();
        assert_eq!(def.tasks.len(), 3);
        assert_eq!(def.strategy, StrategyKind::DependencyAware);

        assert!(WorkflowDefinition::from_file(dir.path().join("missing.yaml")).await.is_err());
    }
}
