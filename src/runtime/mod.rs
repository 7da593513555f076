// src/runtime/mod.rs
//! Task execution runtime
//!
//! This module provides the execution side of the orchestrator:
//!
//! - **Handlers**: per-kind business logic and the context it runs in
//! - **Worker Pool**: fixed set of workers pulling from the task queue
//! - **Tracker**: live task table, in-flight reservation, outcome delivery
//! - **Command**: handler that runs external programs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Worker Pool (3)                       │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐              │
//! │  │ Worker 0 │  │ Worker 1 │  │ Worker 2 │              │
//! │  └──────────┘  └──────────┘  └──────────┘              │
//! │         ▲            ▲            ▲                     │
//! │         └────────────┴────────────┘                     │
//! │                      │                                  │
//! │          TaskQueue (high / normal / low)                │
//! │                      │                                  │
//! │     TaskTracker (states, cancel tokens, outcomes)       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod command;
pub mod handler;
pub mod tracker;
pub mod worker_pool;

pub use command::CommandHandler;
pub use handler::{handler_fn, FnHandler, HandlerRegistry, TaskContext, TaskHandler};
pub use tracker::{TaskCounts, TaskTracker};
pub use worker_pool::{Job, WorkerInfo, WorkerPool, WorkerPoolConfig, WorkerPoolStats, WorkerStatus};
