// src/runtime/tracker.rs
//! Live task table
//!
//! Tracks every admitted, non-terminal task: its state, its cancellation
//! token, and the channel its outcome is delivered on. Also owns the
//! system-wide in-flight counter that admission is checked against.

use crate::task::{Task, TaskId, TaskOutcome, TaskState};
use crate::utils::errors::{OrchestratorError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct TrackedTask {
    state: TaskState,
    cancel: CancellationToken,
    responder: Option<oneshot::Sender<TaskOutcome>>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

/// Task totals since startup
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCounts {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub retried: u64,
    /// Admitted tasks not yet terminal
    pub in_flight: usize,
}

#[derive(Default)]
pub struct TaskTracker {
    tasks: DashMap<TaskId, TrackedTask>,
    in_flight: AtomicUsize,
    counters: Counters,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an in-flight slot against the system-wide cap
    pub fn try_reserve(&self, cap: usize) -> Result<()> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= cap {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(OrchestratorError::SystemOverloaded {
                    in_flight: current,
                    cap,
                });
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Start tracking a task that holds a reservation.
    ///
    /// An id that is already live is rejected with `DuplicateTask` and the
    /// caller's reservation is given back.
    pub fn register(
        &self,
        task: &Task,
    ) -> Result<(CancellationToken, oneshot::Receiver<TaskOutcome>)> {
        let slot = match self.tasks.entry(task.id) {
            Entry::Occupied(_) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(OrchestratorError::DuplicateTask { task_id: task.id });
            }
            Entry::Vacant(slot) => slot,
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        slot.insert(TrackedTask {
            state: TaskState::Queued,
            cancel: cancel.clone(),
            responder: Some(tx),
        });
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok((cancel, rx))
    }

    /// Undo `register` + `try_reserve` for a task that never made it into the queue
    pub fn discard(&self, id: TaskId) {
        if self.tasks.remove(&id).is_some() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.counters.submitted.fetch_sub(1, Ordering::Relaxed);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_state(&self, id: TaskId, state: TaskState) {
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            trace!("Task {} {} -> {}", id, entry.state, state);
            entry.state = state;
        }
    }

    /// Current state, `None` once the task has been reported and discarded
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|entry| entry.state)
    }

    pub fn cancel_token(&self, id: TaskId) -> Option<CancellationToken> {
        self.tasks.get(&id).map(|entry| entry.cancel.clone())
    }

    /// Signal cancellation of every live task
    pub fn cancel_all(&self) {
        for entry in self.tasks.iter() {
            entry.cancel.cancel();
        }
    }

    pub fn record_retry(&self) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliver a terminal outcome and forget the task
    pub fn finish(&self, outcome: TaskOutcome) {
        let Some((_, mut tracked)) = self.tasks.remove(&outcome.task_id) else {
            return;
        };
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        let counter = match outcome.state {
            TaskState::Completed => &self.counters.completed,
            TaskState::TimedOut => &self.counters.timed_out,
            TaskState::Cancelled => &self.counters.cancelled,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("orchestrator_tasks_finished_total", "state" => outcome.state.as_str())
            .increment(1);

        if let Some(responder) = tracked.responder.take() {
            // Submitter may have stopped listening
            let _ = responder.send(outcome);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Live tasks currently in `state`
    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|e| e.state == state).count()
    }

    pub fn counts(&self) -> TaskCounts {
        TaskCounts {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}
