// src/runtime/worker_pool.rs
//! Fixed-size worker pool
//!
//! A small number of long-lived workers pull jobs from the shared task queue
//! and run one at a time each. Every attempt runs under a deadline, panics
//! are caught at the worker boundary, and failed attempts are re-enqueued
//! after a backoff delay without holding a worker.
//!
//! # Architecture
//!
//! ```text
//! TaskQueue<Job> ──next()──▶ Worker 0 ─┐
//!                ──next()──▶ Worker 1 ─┼─▶ handler(ctx) ──▶ ResourceGate
//!                ──next()──▶ Worker 2 ─┘        │
//!       ▲                                       ▼
//!       │ requeue after backoff          Completed / Failed / TimedOut / Cancelled
//!       └────────────── retry timer ◀── retryable failure, attempts remain
//! ```

use crate::resource::GateRegistry;
use crate::runtime::handler::{HandlerRegistry, TaskContext};
use crate::runtime::tracker::TaskTracker;
use crate::task::{
    Priority, Queueable, RetryPolicy, Task, TaskId, TaskOutcome, TaskQueue, TaskState,
};
use crate::utils::config::OrchestratorConfig;
use crate::utils::errors::{OrchestratorError, Result};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers (default: 3)
    pub size: usize,

    /// Per-attempt deadline for tasks without their own timeout
    pub default_timeout: Duration,

    /// Attempts for tasks that do not set `max_attempts`
    pub default_max_attempts: u32,

    /// How long a cancelled handler may keep running before it is dropped
    pub cancel_grace: Duration,

    pub retry: RetryPolicy,
}

impl WorkerPoolConfig {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            size: config.worker_pool_size,
            default_timeout: config.default_timeout(),
            default_max_attempts: config.default_max_attempts,
            cancel_grace: config.cancel_grace(),
            retry: RetryPolicy::new(&config.retry),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// An admitted task travelling between the queue and the workers
pub struct Job {
    task: Arc<Task>,
    cancel: CancellationToken,
    /// Attempts already started
    attempts: u32,
    admitted_at: Instant,
}

impl Job {
    pub(crate) fn new(task: Task, cancel: CancellationToken) -> Self {
        Self {
            task: Arc::new(task),
            cancel,
            attempts: 0,
            admitted_at: Instant::now(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn outcome(
        &self,
        state: TaskState,
        output: Option<Value>,
        error: Option<OrchestratorError>,
    ) -> TaskOutcome {
        TaskOutcome {
            task_id: self.task.id,
            kind: self.task.kind.clone(),
            state,
            attempts: self.attempts,
            output,
            error,
            duration_ms: self.admitted_at.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        }
    }
}

impl Queueable for Job {
    fn priority(&self) -> Priority {
        self.task.priority
    }

    fn task_id(&self) -> TaskId {
        self.task.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: usize,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub tasks_run: u64,
}

#[derive(Default)]
struct WorkerSlot {
    current: Mutex<Option<TaskId>>,
    tasks_run: AtomicU64,
}

/// Worker pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub size: usize,
    pub running: usize,
    pub peak_running: usize,
    pub pending_retries: usize,
    pub utilization_pct: f64,
}

/// Fixed set of workers executing queued jobs
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<TaskQueue<Job>>,
    tracker: Arc<TaskTracker>,
    handlers: Arc<HandlerRegistry>,
    gates: Arc<GateRegistry>,
    workers: Vec<WorkerSlot>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    pending_retries: AtomicUsize,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<TaskQueue<Job>>,
        tracker: Arc<TaskTracker>,
        handlers: Arc<HandlerRegistry>,
        gates: Arc<GateRegistry>,
    ) -> Arc<Self> {
        let size = config.size.max(1);
        Arc::new(Self {
            config,
            queue,
            tracker,
            handlers,
            gates,
            workers: (0..size).map(|_| WorkerSlot::default()).collect(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            pending_retries: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker loops
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        info!("Starting worker pool with {} workers", self.workers.len());
        for id in 0..self.workers.len() {
            handles.push(tokio::spawn(Arc::clone(self).run_worker(id)));
        }
    }

    /// Stop pulling new jobs and wait for running ones to settle
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn run_worker(self: Arc<Self>, id: usize) {
        debug!("Worker {} started", id);
        while let Some(job) = self.queue.next(&self.shutdown).await {
            if job.cancel.is_cancelled() {
                self.finish(&job, TaskState::Cancelled, None, Some(OrchestratorError::Cancelled));
                continue;
            }

            self.mark_busy(id, job.task.id);
            self.execute(job).await;
            self.mark_idle(id);
        }
        debug!("Worker {} stopped", id);
    }

    fn mark_busy(&self, id: usize, task_id: TaskId) {
        *self.workers[id].current.lock() = Some(task_id);
        let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_running.fetch_max(running, Ordering::AcqRel);
        metrics::gauge!("orchestrator_workers_busy").set(running as f64);
    }

    fn mark_idle(&self, id: usize) {
        let slot = &self.workers[id];
        *slot.current.lock() = None;
        slot.tasks_run.fetch_add(1, Ordering::Relaxed);
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!("orchestrator_workers_busy").set(running as f64);
    }

    async fn execute(self: &Arc<Self>, mut job: Job) {
        job.attempts += 1;
        let attempt = job.attempts;
        let max_attempts = job
            .task
            .max_attempts
            .unwrap_or(self.config.default_max_attempts)
            .max(1);

        self.tracker.set_state(job.task.id, TaskState::Running);
        debug!(
            "Running task {} ({}) attempt {}/{}",
            job.task.id, job.task.kind, attempt, max_attempts
        );

        let result = self.run_attempt(&job, attempt).await;

        let error = match result {
            Ok(output) => {
                debug!("Task {} completed", job.task.id);
                self.finish(&job, TaskState::Completed, Some(output), None);
                return;
            }
            Err(_) if job.cancel.is_cancelled() => OrchestratorError::Cancelled,
            Err(e) => e,
        };

        let state = terminal_state(&error);
        if state != TaskState::Cancelled
            && !self.shutdown.is_cancelled()
            && self.config.retry.should_retry(&error, attempt, max_attempts)
        {
            let delay = self.config.retry.delay_for(attempt, &error);
            warn!(
                "Task {} ({}) attempt {}/{} failed: {}; retrying in {:?}",
                job.task.id, job.task.kind, attempt, max_attempts, error, delay
            );
            self.tracker.set_state(job.task.id, TaskState::Queued);
            self.tracker.record_retry();
            self.schedule_retry(job, delay);
            return;
        }

        debug!("Task {} finished {}: {}", job.task.id, state, error);
        self.finish(&job, state, None, Some(error));
    }

    async fn run_attempt(&self, job: &Job, attempt: u32) -> Result<Value> {
        let handler = self.handlers.get(&job.task.kind)?;

        // Fail fast while the target's circuit is open
        if let Some(resource) = job.task.target_resource.as_deref() {
            let gate = self.gates.get(resource)?;
            if gate.breaker().is_rejecting() {
                return Err(OrchestratorError::CircuitOpen {
                    resource: resource.to_string(),
                });
            }
        }

        let ctx = TaskContext::new(
            Arc::clone(&job.task),
            attempt,
            job.cancel.clone(),
            Arc::clone(&self.gates),
        );
        let timeout = job.task.timeout.unwrap_or(self.config.default_timeout);
        let grace = self.config.cancel_grace;
        let cancel = job.cancel.clone();

        let handler_fut = AssertUnwindSafe(handler.handle(ctx))
            .catch_unwind()
            .map(|result| result.unwrap_or_else(|panic| Err(panic_error(panic))));
        tokio::pin!(handler_fut);

        let supervised = async {
            tokio::select! {
                result = &mut handler_fut => result,
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(grace, &mut handler_fut).await {
                        Ok(Ok(value)) => Ok(value),
                        _ => Err(OrchestratorError::Cancelled),
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, supervised).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::timeout(timeout)),
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: Job, delay: Duration) {
        let pool = Arc::clone(self);
        self.pending_retries.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = job.cancel.cancelled() => true,
                _ = pool.shutdown.cancelled() => true,
            };
            pool.pending_retries.fetch_sub(1, Ordering::AcqRel);

            if interrupted {
                let error = if job.cancel.is_cancelled() {
                    OrchestratorError::Cancelled
                } else {
                    OrchestratorError::ShutDown
                };
                pool.finish(&job, TaskState::Cancelled, None, Some(error));
            } else {
                let id = job.task.id;
                pool.queue.requeue(job);
                // Shutdown raced the timer; nobody will dequeue it
                if pool.shutdown.is_cancelled() {
                    if let Some(job) = pool.queue.remove(id) {
                        pool.finish(
                            &job,
                            TaskState::Cancelled,
                            None,
                            Some(OrchestratorError::ShutDown),
                        );
                    }
                }
            }
        });
    }

    /// Report a job's terminal outcome
    pub(crate) fn finish(
        &self,
        job: &Job,
        state: TaskState,
        output: Option<Value>,
        error: Option<OrchestratorError>,
    ) {
        self.tracker.finish(job.outcome(state, output, error));
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Workers currently executing a task
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::Acquire)
    }

    /// Failed attempts waiting out their backoff
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Vec<WorkerInfo> {
        self.workers
            .iter()
            .enumerate()
            .map(|(id, slot)| {
                let current = *slot.current.lock();
                WorkerInfo {
                    id,
                    status: if current.is_some() {
                        WorkerStatus::Busy
                    } else {
                        WorkerStatus::Idle
                    },
                    current_task: current,
                    tasks_run: slot.tasks_run.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let running = self.running();
        WorkerPoolStats {
            size: self.size(),
            running,
            peak_running: self.peak_running(),
            pending_retries: self.pending_retries(),
            utilization_pct: running as f64 / self.size() as f64 * 100.0,
        }
    }
}

fn terminal_state(error: &OrchestratorError) -> TaskState {
    match error {
        OrchestratorError::TaskTimeout { .. } => TaskState::TimedOut,
        OrchestratorError::Cancelled | OrchestratorError::ShutDown => TaskState::Cancelled,
        _ => TaskState::Failed,
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> OrchestratorError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    OrchestratorError::handler(format!("handler panicked: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handler::handler_fn;
    use crate::utils::config::{ResourceConfig, RetryConfig};
    use serde_json::json;
    use tokio::sync::oneshot;

    struct Fixture {
        pool: Arc<WorkerPool>,
        queue: Arc<TaskQueue<Job>>,
        tracker: Arc<TaskTracker>,
        handlers: Arc<HandlerRegistry>,
        gates: Arc<GateRegistry>,
    }

    impl Fixture {
        fn new(size: usize) -> Self {
            let config = WorkerPoolConfig {
                size,
                default_timeout: Duration::from_secs(5),
                default_max_attempts: 1,
                cancel_grace: Duration::from_millis(50),
                retry: RetryPolicy::new(&RetryConfig {
                    base_delay_ms: 30,
                    max_delay_ms: 1_000,
                    multiplier: 2.0,
                    jitter: false,
                    circuit_open_delay_ms: 30,
                }),
            };
            let queue = Arc::new(TaskQueue::new(100));
            let tracker = Arc::new(TaskTracker::new());
            let handlers = Arc::new(HandlerRegistry::new());
            let gates = Arc::new(
                GateRegistry::from_configs(&[
                    ResourceConfig::new("linear", 2).with_breaker(2, Duration::from_secs(60))
                ])
                .unwrap(),
            );
            let pool = WorkerPool::new(
                config,
                Arc::clone(&queue),
                Arc::clone(&tracker),
                Arc::clone(&handlers),
                Arc::clone(&gates),
            );
            pool.start();
            Self {
                pool,
                queue,
                tracker,
                handlers,
                gates,
            }
        }

        fn submit(&self, task: Task) -> oneshot::Receiver<TaskOutcome> {
            self.tracker.try_reserve(usize::MAX).unwrap();
            let (cancel, rx) = self.tracker.register(&task).unwrap();
            self.queue.enqueue(Job::new(task, cancel)).unwrap();
            rx
        }
    }

    #[tokio::test]
    async fn test_runs_task_to_completion() {
        let fx = Fixture::new(3);
        fx.handlers.register(
            "echo",
            handler_fn(|ctx| async move { Ok(json!({"echo": ctx.payload().clone()})) }),
        );

        let outcome = fx
            .submit(Task::new("echo").with_payload(json!("hi")))
            .await
            .unwrap();
        assert_eq!(outcome.state, TaskState::Completed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.output.unwrap()["echo"], "hi");
        assert_eq!(fx.tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_worker_survives() {
        let fx = Fixture::new(1);
        fx.handlers
            .register("boom", handler_fn(|_ctx| async move { panic!("bad input") }));
        fx.handlers
            .register("ok", handler_fn(|_ctx| async move { Ok(Value::Null) }));

        let outcome = fx.submit(Task::new("boom")).await.unwrap();
        assert_eq!(outcome.state, TaskState::Failed);
        match outcome.error {
            Some(OrchestratorError::HandlerError { message }) => {
                assert!(message.contains("bad input"))
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // The only worker is still alive
        let outcome = fx.submit(Task::new("ok")).await.unwrap();
        assert_eq!(outcome.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_timeout_releases_permit() {
        let fx = Fixture::new(1);
        fx.handlers.register(
            "hang",
            handler_fn(|ctx| async move {
                let _permit = ctx.acquire().await?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        );

        let outcome = fx
            .submit(
                Task::new("hang")
                    .with_resource("linear")
                    .with_timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.state, TaskState::TimedOut);
        assert!(matches!(outcome.error, Some(OrchestratorError::TaskTimeout { .. })));
        assert_eq!(fx.gates.get("linear").unwrap().in_flight(), 0);
        assert_eq!(fx.pool.running(), 0);
    }

    #[tokio::test]
    async fn test_retries_until_attempts_exhausted() {
        let fx = Fixture::new(2);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&starts);
        fx.handlers.register(
            "flaky",
            handler_fn(move |_ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(Instant::now());
                    Err(OrchestratorError::handler("always fails"))
                }
            }),
        );

        let outcome = fx
            .submit(Task::new("flaky").with_max_attempts(3))
            .await
            .unwrap();

        assert_eq!(outcome.state, TaskState::Failed);
        assert_eq!(outcome.attempts, 3);
        let starts = starts.lock().clone();
        assert_eq!(starts.len(), 3);
        assert!(starts[1] - starts[0] >= Duration::from_millis(30));
        assert!(starts[2] - starts[1] >= Duration::from_millis(60));
        assert_eq!(fx.tracker.counts().retried, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let fx = Fixture::new(1);
        let outcome = fx
            .submit(Task::new("unregistered").with_max_attempts(3))
            .await
            .unwrap();
        assert_eq!(outcome.state, TaskState::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.error, Some(OrchestratorError::UnknownTaskKind { .. })));
    }

    #[tokio::test]
    async fn test_running_never_exceeds_pool_size() {
        let fx = Fixture::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            fx.handlers.register(
                "work",
                handler_fn(move |_ctx| {
                    let active = Arc::clone(&active);
                    let max_seen = Arc::clone(&max_seen);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }),
            );
        }

        let receivers: Vec<_> = (0..20).map(|_| fx.submit(Task::new("work"))).collect();
        for rx in receivers {
            assert_eq!(rx.await.unwrap().state, TaskState::Completed);
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(fx.pool.peak_running() <= 3);
        assert_eq!(fx.pool.running(), 0);
        assert_eq!(
            fx.pool.status().iter().map(|w| w.tasks_run).sum::<u64>(),
            20
        );
    }

    #[tokio::test]
    async fn test_cooperative_cancel_while_running() {
        let fx = Fixture::new(1);
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));
        fx.handlers.register(
            "wait",
            handler_fn(move |ctx| {
                let started_tx = Arc::clone(&started_tx);
                async move {
                    if let Some(tx) = started_tx.lock().take() {
                        let _ = tx.send(());
                    }
                    ctx.cancelled().await;
                    Err(OrchestratorError::Cancelled)
                }
            }),
        );

        let task = Task::new("wait").with_max_attempts(3);
        let id = task.id;
        let rx = fx.submit(task);
        started_rx.await.unwrap();
        assert_eq!(fx.tracker.state(id), Some(TaskState::Running));

        fx.tracker.cancel_token(id).unwrap().cancel();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.state, TaskState::Cancelled);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_uncooperative_handler_dropped_after_grace() {
        let fx = Fixture::new(1);
        fx.handlers.register(
            "stubborn",
            handler_fn(|ctx| async move {
                let _permit = ctx.acquire().await?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        );

        let task = Task::new("stubborn").with_resource("linear");
        let id = task.id;
        let rx = fx.submit(task);
        while fx.gates.get("linear").unwrap().in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        fx.tracker.cancel_token(id).unwrap().cancel();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.state, TaskState::Cancelled);

        let gate = fx.gates.get("linear").unwrap();
        assert_eq!(gate.in_flight(), 0);
        // Cancelled calls do not count against the breaker
        assert_eq!(gate.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_handler() {
        let fx = Fixture::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            fx.handlers.register(
                "call",
                handler_fn(move |_ctx| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(Value::Null) }
                }),
            );
        }

        let gate = fx.gates.get("linear").unwrap();
        gate.acquire().await.unwrap().failure();
        gate.acquire().await.unwrap().failure();

        let outcome = fx
            .submit(Task::new("call").with_resource("linear"))
            .await
            .unwrap();
        assert_eq!(outcome.state, TaskState::Failed);
        assert!(matches!(outcome.error, Some(OrchestratorError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let fx = Fixture::new(2);
        fx.pool.shutdown().await;
        assert!(fx.pool.is_shut_down());
        assert!(fx.pool.status().iter().all(|w| w.status == WorkerStatus::Idle));
    }
}
