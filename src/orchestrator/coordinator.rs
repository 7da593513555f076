// src/orchestrator/coordinator.rs
//! Top-level coordinator
//!
//! Owns the task queue, the worker pool, the gate registry and the live task
//! table. Submission passes three admission checks in order: the task kind
//! and target resource must be known, the system-wide in-flight cap must
//! have room, and the queue must not be full.

use crate::monitor::{Alert, MetricsSource, PerformanceMonitor, Severity};
use crate::orchestrator::workflow::{self, Workflow, WorkflowReport};
use crate::resource::{GateRegistry, GateSnapshot};
use crate::runtime::{
    HandlerRegistry, Job, TaskCounts, TaskHandler, TaskTracker, WorkerInfo, WorkerPool,
    WorkerPoolConfig, WorkerPoolStats,
};
use crate::task::{Task, TaskId, TaskOutcome, TaskQueue, TaskQueueStats, TaskState};
use crate::utils::config::{DegradationConfig, OrchestratorConfig};
use crate::utils::errors::{OrchestratorError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pending result of a submitted task
pub struct TaskHandle {
    id: TaskId,
    kind: String,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task's terminal outcome
    pub async fn outcome(self) -> TaskOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome {
                task_id: self.id,
                kind: self.kind,
                state: TaskState::Cancelled,
                attempts: 0,
                output: None,
                error: Some(OrchestratorError::ShutDown),
                duration_ms: 0,
                finished_at: Utc::now(),
            },
        }
    }
}

/// Temporary admission tightening after a critical alert
struct Degradation {
    config: DegradationConfig,
    until: Mutex<Option<Instant>>,
}

impl Degradation {
    fn is_active(&self) -> bool {
        self.until
            .lock()
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn cap(&self, base: usize) -> usize {
        if self.is_active() {
            ((base as f64 * self.config.admission_factor).floor() as usize).max(1)
        } else {
            base
        }
    }

    fn trigger(&self) {
        let duration = Duration::from_millis(self.config.duration_ms);
        *self.until.lock() = Some(Instant::now() + duration);
    }
}

/// Orchestrator status
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub accepting: bool,
    pub degraded: bool,
    pub admission_cap: usize,
    pub queue: TaskQueueStats,
    pub pool: WorkerPoolStats,
    pub workers: Vec<WorkerInfo>,
    pub tasks: TaskCounts,
    pub resources: Vec<GateSnapshot>,
}

/// Bounded-concurrency task orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<TaskQueue<Job>>,
    tracker: Arc<TaskTracker>,
    handlers: Arc<HandlerRegistry>,
    gates: Arc<GateRegistry>,
    pool: Arc<WorkerPool>,
    degradation: Degradation,
    accepting: AtomicBool,
}

impl Orchestrator {
    /// Build the gates from configuration and start the workers
    pub fn start(config: OrchestratorConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let gates = Arc::new(GateRegistry::from_configs(&config.resources)?);
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let tracker = Arc::new(TaskTracker::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let pool = WorkerPool::new(
            WorkerPoolConfig::from_config(&config),
            Arc::clone(&queue),
            Arc::clone(&tracker),
            Arc::clone(&handlers),
            Arc::clone(&gates),
        );
        pool.start();

        info!(
            "Orchestrator started: {} workers, {} resources, queue capacity {}, admission cap {}",
            config.worker_pool_size,
            gates.len(),
            config.queue_capacity,
            config.max_in_flight
        );

        Ok(Arc::new(Self {
            degradation: Degradation {
                config: config.degradation.clone(),
                until: Mutex::new(None),
            },
            config,
            queue,
            tracker,
            handlers,
            gates,
            pool,
            accepting: AtomicBool::new(true),
        }))
    }

    pub fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.register(kind, handler);
    }

    /// Admit a task and return a handle to its outcome
    pub fn submit_task(&self, task: Task) -> Result<TaskHandle> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(OrchestratorError::ShutDown);
        }
        if !self.handlers.contains(&task.kind) {
            return Err(OrchestratorError::UnknownTaskKind {
                kind: task.kind.clone(),
            });
        }
        if let Some(resource) = task.target_resource.as_deref() {
            if !self.gates.contains(resource) {
                return Err(OrchestratorError::UnknownResource {
                    name: resource.to_string(),
                });
            }
        }

        let cap = self.admission_cap();
        if let Err(e) = self.tracker.try_reserve(cap) {
            debug!("Rejected task {} ({}): {}", task.id, task.kind, e);
            metrics::counter!("orchestrator_admission_rejections_total", "reason" => e.kind())
                .increment(1);
            return Err(e);
        }

        let id = task.id;
        let kind = task.kind.clone();
        let (cancel, rx) = match self.tracker.register(&task) {
            Ok(registered) => registered,
            Err(e) => {
                debug!("Rejected task {} ({}): {}", id, kind, e);
                metrics::counter!("orchestrator_admission_rejections_total", "reason" => e.kind())
                    .increment(1);
                return Err(e);
            }
        };
        let priority = task.priority;

        if let Err(e) = self.queue.enqueue(Job::new(task, cancel)) {
            self.tracker.discard(id);
            debug!("Rejected task {} ({}): {}", id, kind, e);
            metrics::counter!("orchestrator_admission_rejections_total", "reason" => e.kind())
                .increment(1);
            return Err(e);
        }

        debug!("Task {} ({}) queued at {} priority", id, kind, priority.as_str());
        metrics::counter!("orchestrator_tasks_submitted_total").increment(1);
        Ok(TaskHandle { id, kind, rx })
    }

    /// Submit and wait; admission failures become a `Failed` outcome with no attempts
    pub async fn run_task(&self, task: Task) -> TaskOutcome {
        let fallback = TaskOutcome::not_run(&task, TaskState::Failed, OrchestratorError::Cancelled);
        match self.submit_task(task) {
            Ok(handle) => handle.outcome().await,
            Err(e) => TaskOutcome {
                error: Some(e),
                ..fallback
            },
        }
    }

    /// Cancel a queued or running task. Returns false if it is unknown or already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        if let Some(job) = self.queue.remove(id) {
            debug!("Cancelled task {} while queued", id);
            self.pool
                .finish(&job, TaskState::Cancelled, None, Some(OrchestratorError::Cancelled));
            return true;
        }
        match self.tracker.cancel_token(id) {
            Some(token) => {
                debug!("Signalled cancellation for task {}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Live state, `None` once the outcome has been delivered
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tracker.state(id)
    }

    pub async fn execute_workflow(&self, workflow: Workflow) -> Result<WorkflowReport> {
        workflow::execute(self, workflow).await
    }

    /// React to a monitor alert. Critical alerts tighten admission for a while.
    pub fn apply_alert(&self, alert: &Alert) {
        if alert.severity != Severity::Critical {
            return;
        }
        self.degradation.trigger();
        warn!(
            "Critical {} alert; admission cap reduced to {} for {}ms",
            alert.alert_type.as_str(),
            self.admission_cap(),
            self.degradation.config.duration_ms
        );
    }

    /// Create a performance monitor sampling this orchestrator, feed its
    /// alerts back into admission, and start it
    pub fn start_monitor(self: &Arc<Self>) -> Arc<PerformanceMonitor> {
        let monitor = PerformanceMonitor::new(self.config.monitor.clone());
        let weak: Weak<Self> = Arc::downgrade(self);
        monitor.on_alert(move |alert| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.apply_alert(alert);
            }
        });
        monitor.start(self.probe());
        monitor
    }

    /// This orchestrator as a monitor metrics source
    pub fn probe(self: &Arc<Self>) -> Arc<dyn MetricsSource> {
        Arc::clone(self) as Arc<dyn MetricsSource>
    }

    /// Effective system-wide admission cap
    pub fn admission_cap(&self) -> usize {
        self.degradation.cap(self.config.max_in_flight)
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation.is_active()
    }

    pub fn gates(&self) -> &Arc<GateRegistry> {
        &self.gates
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            accepting: self.accepting.load(Ordering::Acquire),
            degraded: self.is_degraded(),
            admission_cap: self.admission_cap(),
            queue: self.queue.stats(),
            pool: self.pool.stats(),
            workers: self.pool.status(),
            tasks: self.tracker.counts(),
            resources: self.gates.snapshots(),
        }
    }

    /// Stop accepting tasks, cancel everything outstanding, and stop the workers
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down orchestrator ({} tasks in flight)", self.in_flight());

        self.tracker.cancel_all();
        self.pool.shutdown().await;

        for job in self.queue.drain() {
            self.pool
                .finish(&job, TaskState::Cancelled, None, Some(OrchestratorError::ShutDown));
        }
        info!("Orchestrator stopped");
    }
}

impl MetricsSource for Orchestrator {
    fn queue_depth(&self) -> usize {
        self.queue.size()
    }

    fn active_workers(&self) -> usize {
        self.pool.running()
    }

    fn worker_count(&self) -> usize {
        self.pool.size()
    }

    fn resources(&self) -> Vec<GateSnapshot> {
        self.gates.snapshots()
    }

    fn task_counts(&self) -> TaskCounts {
        self.tracker.counts()
    }
}
