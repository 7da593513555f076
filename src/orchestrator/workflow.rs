// src/orchestrator/workflow.rs
//! Workflow execution
//!
//! A workflow is a batch of related tasks run under one completion
//! strategy:
//!
//! - **Parallel**: submit everything, wait for everything; succeeds when the
//!   completed share of required tasks reaches `min_success_ratio`
//! - **Sequential**: one task at a time in declaration order; the first
//!   required task that does not complete cancels the rest
//! - **DependencyAware**: a task is submitted once all of its dependencies
//!   completed; a dependency that ends any other way cancels its dependents
//!   (transitively) while independent branches keep going
//!
//! Every task appears in the report with its own outcome, whatever the
//! verdict.

use crate::orchestrator::coordinator::Orchestrator;
use crate::task::{Task, TaskOutcome, TaskState};
use crate::utils::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStrategy {
    Parallel { min_success_ratio: f64 },
    Sequential,
    DependencyAware,
}

impl WorkflowStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStrategy::Parallel { .. } => "parallel",
            WorkflowStrategy::Sequential => "sequential",
            WorkflowStrategy::DependencyAware => "dependency_aware",
        }
    }
}

/// A task inside a workflow
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    /// Unique key within the workflow, used by `depends_on`
    pub key: String,
    pub task: Task,
    pub depends_on: Vec<String>,
    /// Optional tasks do not count toward the verdict
    pub optional: bool,
}

impl WorkflowTask {
    pub fn new(key: impl Into<String>, task: Task) -> Self {
        Self {
            key: key.into(),
            task,
            depends_on: Vec::new(),
            optional: false,
        }
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub strategy: WorkflowStrategy,
    pub tasks: Vec<WorkflowTask>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, strategy: WorkflowStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: WorkflowTask) -> Self {
        self.tasks.push(task);
        self
    }

    /// Check keys, dependency references, the parallel ratio, and (for
    /// dependency-aware workflows) that the graph is acyclic
    pub fn validate(&self) -> Result<()> {
        if let WorkflowStrategy::Parallel { min_success_ratio } = self.strategy {
            if !(0.0..=1.0).contains(&min_success_ratio) {
                return Err(OrchestratorError::invalid_workflow(format!(
                    "min_success_ratio {} outside 0..=1",
                    min_success_ratio
                )));
            }
        }

        let mut keys = HashSet::new();
        for task in &self.tasks {
            if !keys.insert(task.key.as_str()) {
                return Err(OrchestratorError::invalid_workflow(format!(
                    "duplicate task key '{}'",
                    task.key
                )));
            }
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !keys.contains(dep.as_str()) {
                    return Err(OrchestratorError::invalid_workflow(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.key, dep
                    )));
                }
                if dep == &task.key {
                    return Err(OrchestratorError::invalid_workflow(format!(
                        "task '{}' depends on itself",
                        task.key
                    )));
                }
            }
        }

        if self.strategy == WorkflowStrategy::DependencyAware {
            self.topological_order()?;
        }
        Ok(())
    }

    /// Task indices in dependency order (Kahn's algorithm)
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.tasks.len()];
        let mut dependents = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let d = *index.get(dep.as_str()).ok_or_else(|| {
                    OrchestratorError::invalid_workflow(format!("unknown dependency '{}'", dep))
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck: Vec<&str> = (0..self.tasks.len())
                .filter(|i| !order.contains(i))
                .map(|i| self.tasks[i].key.as_str())
                .collect();
            return Err(OrchestratorError::invalid_workflow(format!(
                "dependency cycle among: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

/// One task's entry in a workflow report
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowTaskOutcome {
    pub key: String,
    pub optional: bool,
    pub outcome: TaskOutcome,
}

/// Counts by terminal state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl WorkflowSummary {
    fn from_outcomes(outcomes: &[WorkflowTaskOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Default::default()
        };
        for entry in outcomes {
            match entry.outcome.state {
                TaskState::Completed => summary.completed += 1,
                TaskState::TimedOut => summary.timed_out += 1,
                TaskState::Cancelled => summary.cancelled += 1,
                _ => summary.failed += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub name: String,
    pub strategy: WorkflowStrategy,
    pub success: bool,
    pub summary: WorkflowSummary,
    /// Per-task outcomes in declaration order
    pub tasks: Vec<WorkflowTaskOutcome>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowReport {
    pub fn outcome(&self, key: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.key == key).map(|t| &t.outcome)
    }
}

pub(crate) async fn execute(
    orchestrator: &Orchestrator,
    workflow: Workflow,
) -> Result<WorkflowReport> {
    workflow.validate()?;

    let started_at = Utc::now();
    let started = Instant::now();
    info!(
        "Executing workflow '{}' ({} tasks, {})",
        workflow.name,
        workflow.tasks.len(),
        workflow.strategy.as_str()
    );

    let outcomes = match workflow.strategy {
        WorkflowStrategy::Parallel { .. } => run_parallel(orchestrator, &workflow).await,
        WorkflowStrategy::Sequential => run_sequential(orchestrator, &workflow).await,
        WorkflowStrategy::DependencyAware => run_dependency_aware(orchestrator, &workflow).await,
    };

    let tasks: Vec<WorkflowTaskOutcome> = workflow
        .tasks
        .iter()
        .zip(outcomes)
        .map(|(wt, outcome)| WorkflowTaskOutcome {
            key: wt.key.clone(),
            optional: wt.optional,
            outcome,
        })
        .collect();

    let success = verdict(workflow.strategy, &tasks);
    let summary = WorkflowSummary::from_outcomes(&tasks);

    if success {
        info!(
            "Workflow '{}' succeeded ({}/{} completed)",
            workflow.name, summary.completed, summary.total
        );
    } else {
        warn!(
            "Workflow '{}' failed: {} completed, {} failed, {} timed out, {} cancelled",
            workflow.name, summary.completed, summary.failed, summary.timed_out, summary.cancelled
        );
    }

    Ok(WorkflowReport {
        name: workflow.name,
        strategy: workflow.strategy,
        success,
        summary,
        tasks,
        started_at,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn verdict(strategy: WorkflowStrategy, tasks: &[WorkflowTaskOutcome]) -> bool {
    let required: Vec<&WorkflowTaskOutcome> = tasks.iter().filter(|t| !t.optional).collect();
    let completed = required.iter().filter(|t| t.outcome.is_success()).count();

    match strategy {
        WorkflowStrategy::Parallel { min_success_ratio } => {
            if required.is_empty() {
                return true;
            }
            completed as f64 / required.len() as f64 >= min_success_ratio
        }
        WorkflowStrategy::Sequential | WorkflowStrategy::DependencyAware => {
            completed == required.len()
        }
    }
}

fn rejected(task: &Task, error: OrchestratorError) -> TaskOutcome {
    TaskOutcome::not_run(task, TaskState::Failed, error)
}

fn skipped(task: &Task) -> TaskOutcome {
    TaskOutcome::not_run(task, TaskState::Cancelled, OrchestratorError::Cancelled)
}

async fn run_parallel(orchestrator: &Orchestrator, workflow: &Workflow) -> Vec<TaskOutcome> {
    let mut pending = FuturesUnordered::new();
    let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; workflow.tasks.len()];

    for (i, wt) in workflow.tasks.iter().enumerate() {
        match orchestrator.submit_task(wt.task.clone()) {
            Ok(handle) => pending.push(async move { (i, handle.outcome().await) }),
            Err(e) => {
                debug!("Workflow task '{}' rejected: {}", wt.key, e);
                outcomes[i] = Some(rejected(&wt.task, e));
            }
        }
    }

    while let Some((i, outcome)) = pending.next().await {
        outcomes[i] = Some(outcome);
    }

    outcomes.into_iter().flatten().collect()
}

async fn run_sequential(orchestrator: &Orchestrator, workflow: &Workflow) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::with_capacity(workflow.tasks.len());
    let mut aborted = false;

    for wt in &workflow.tasks {
        if aborted {
            outcomes.push(skipped(&wt.task));
            continue;
        }

        let outcome = orchestrator.run_task(wt.task.clone()).await;
        if !outcome.is_success() && !wt.optional {
            debug!(
                "Workflow '{}' stopping after '{}' ended {}",
                workflow.name, wt.key, outcome.state
            );
            aborted = true;
        }
        outcomes.push(outcome);
    }

    outcomes
}

async fn run_dependency_aware(
    orchestrator: &Orchestrator,
    workflow: &Workflow,
) -> Vec<TaskOutcome> {
    let n = workflow.tasks.len();
    let index: HashMap<&str, usize> = workflow
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.key.as_str(), i))
        .collect();
    let deps: Vec<Vec<usize>> = workflow
        .tasks
        .iter()
        .map(|t| t.depends_on.iter().map(|d| index[d.as_str()]).collect())
        .collect();

    let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; n];
    let mut submitted = vec![false; n];
    let mut pending = FuturesUnordered::new();

    loop {
        // Settle everything decidable before waiting again; a cancellation
        // can unblock further cancellations in the same pass
        let mut progressed = true;
        while progressed {
            progressed = false;
            for i in 0..n {
                if submitted[i] || outcomes[i].is_some() {
                    continue;
                }
                let wt = &workflow.tasks[i];

                // One failed dependency is enough; don't wait for slow siblings
                let failed_dep = deps[i].iter().copied().find(|&d| {
                    outcomes[d]
                        .as_ref()
                        .map(|o| !o.is_success())
                        .unwrap_or(false)
                });
                if let Some(d) = failed_dep {
                    debug!(
                        "Cancelling '{}': dependency '{}' did not complete",
                        wt.key, workflow.tasks[d].key
                    );
                    outcomes[i] = Some(skipped(&wt.task));
                    progressed = true;
                    continue;
                }

                if deps[i].iter().any(|&d| outcomes[d].is_none()) {
                    continue;
                }

                match orchestrator.submit_task(wt.task.clone()) {
                    Ok(handle) => {
                        submitted[i] = true;
                        pending.push(async move { (i, handle.outcome().await) });
                    }
                    Err(e) => {
                        debug!("Workflow task '{}' rejected: {}", wt.key, e);
                        outcomes[i] = Some(rejected(&wt.task, e));
                        progressed = true;
                    }
                }
            }
        }

        match pending.next().await {
            Some((i, outcome)) => outcomes[i] = Some(outcome),
            None => break,
        }
    }

    outcomes
        .into_iter()
        .zip(&workflow.tasks)
        .map(|(outcome, wt)| outcome.unwrap_or_else(|| skipped(&wt.task)))
        .collect()
}
