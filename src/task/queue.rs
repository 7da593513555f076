// src/task/queue.rs
//! Bounded priority task queue
//!
//! Strict priority across tiers (high, normal, low) and strict FIFO within a
//! tier. `enqueue` fails fast with `QueueFull` at capacity; that rejection is
//! the system's backpressure signal.
//!
//! # Architecture
//!
//! ```text
//! enqueue ─┬─▶ [high   ] ─┐
//!          ├─▶ [normal ] ─┼─▶ dequeue / next()  ─▶ Worker
//!          └─▶ [low    ] ─┘
//! requeue (deferred retry) re-enters the task's own tier
//! ```

use crate::task::model::{Priority, Task, TaskId};
use crate::utils::errors::{OrchestratorError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Anything the queue can order
pub trait Queueable: Send {
    fn priority(&self) -> Priority;
    fn task_id(&self) -> TaskId;
}

impl Queueable for Task {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn task_id(&self) -> TaskId {
        self.id
    }
}

struct QueueInner<T> {
    tiers: [VecDeque<T>; 3],
    len: usize,
}

impl<T: Queueable> QueueInner<T> {
    fn push(&mut self, item: T) {
        self.tiers[item.priority().tier()].push_back(item);
        self.len += 1;
    }
}

/// Bounded priority queue shared by the orchestrator and the worker pool
pub struct TaskQueue<T = Task> {
    inner: Mutex<QueueInner<T>>,
    capacity: usize,
    notify: Notify,
    enqueued: AtomicU64,
    rejected: AtomicU64,
}

impl<T: Queueable> TaskQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                len: 0,
            }),
            capacity,
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Add an item, failing with `QueueFull` at capacity
    pub fn enqueue(&self, item: T) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.len >= self.capacity {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(OrchestratorError::QueueFull {
                    capacity: self.capacity,
                });
            }
            trace!("Enqueuing task {} ({})", item.task_id(), item.priority().as_str());
            inner.push(item);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Re-insert an already admitted item at the back of its tier.
    ///
    /// Bypasses the capacity check: the item was accounted for at admission
    /// and dropping it here would lose a task the caller is awaiting.
    pub fn requeue(&self, item: T) {
        trace!("Requeuing task {} ({})", item.task_id(), item.priority().as_str());
        self.inner.lock().push(item);
        self.notify.notify_one();
    }

    /// Take the next item by priority, FIFO within a tier
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.tiers.iter_mut().find_map(|tier| tier.pop_front());
        if item.is_some() {
            inner.len -= 1;
        }
        item
    }

    /// Wait for the next item, or `None` once `shutdown` fires
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.dequeue() {
                return Some(item);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Remove a specific item (cancellation while queued)
    pub fn remove(&self, id: TaskId) -> Option<T> {
        let mut inner = self.inner.lock();
        let mut found = None;
        for tier in inner.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|item| item.task_id() == id) {
                found = tier.remove(pos);
                break;
            }
        }
        if found.is_some() {
            inner.len -= 1;
        }
        found
    }

    /// Drain everything (shutdown)
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.len = 0;
        inner
            .tiers
            .iter_mut()
            .flat_map(|tier| tier.drain(..))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue statistics
    pub fn stats(&self) -> TaskQueueStats {
        let inner = self.inner.lock();
        TaskQueueStats {
            high: inner.tiers[0].len(),
            normal: inner.tiers[1].len(),
            low: inner.tiers[2].len(),
            capacity: self.capacity,
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskQueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub capacity: usize,
    pub enqueued_total: u64,
    pub rejected_total: u64,
}

impl TaskQueueStats {
    pub fn depth(&self) -> usize {
        self.high + self.normal + self.low
    }

    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.depth() as f64 / self.capacity as f64) * 100.0
    }
}
