// src/task/mod.rs
//! Task model and scheduling primitives
//!
//! - **Model**: task identity, priority, lifecycle state, terminal outcome
//! - **Queue**: bounded priority queue (backpressure point)
//! - **Retry**: backoff policy for failed attempts
//!
//! # Lifecycle
//!
//! ```text
//! Queued ─▶ Running ─▶ Completed
//!   ▲          ├─────▶ Failed ──┐
//!   │          ├─────▶ TimedOut ┤ (attempts remain, retryable)
//!   │          └─────▶ Cancelled│
//!   └──────── backoff ◀─────────┘
//! ```

pub mod model;
pub mod queue;
pub mod retry;

pub use model::{Priority, Task, TaskId, TaskOutcome, TaskState};
pub use queue::{Queueable, TaskQueue, TaskQueueStats};
pub use retry::RetryPolicy;
