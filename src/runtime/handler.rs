// src/runtime/handler.rs
//! Task handlers and the context they run in
//!
//! A handler is the opaque business logic behind a task kind. It receives a
//! [`TaskContext`] that exposes the task's input, scoped access to resource
//! gates, and the cooperative cancellation signal.

use crate::resource::{GateRegistry, ResourceGate, ResourcePermit};
use crate::task::{Priority, Task, TaskId};
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Business logic for one task kind
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt of the task.
    ///
    /// Handlers must tolerate being retried and must acquire resource
    /// permits through the context so they are released on timeout.
    async fn handle(&self, ctx: TaskContext) -> Result<Value>;
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, ctx: TaskContext) -> Result<Value> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Maps task kinds to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the kind
    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let kind = kind.into();
        debug!("Registered handler for kind '{}'", kind);
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(kind)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::UnknownTaskKind {
                kind: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }
}

/// What a handler sees while running one attempt
#[derive(Clone)]
pub struct TaskContext {
    task: Arc<Task>,
    attempt: u32,
    cancel: CancellationToken,
    gates: Arc<GateRegistry>,
}

impl TaskContext {
    pub(crate) fn new(
        task: Arc<Task>,
        attempt: u32,
        cancel: CancellationToken,
        gates: Arc<GateRegistry>,
    ) -> Self {
        Self {
            task,
            attempt,
            cancel,
            gates,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn kind(&self) -> &str {
        &self.task.kind
    }

    pub fn priority(&self) -> Priority {
        self.task.priority
    }

    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    pub fn target_resource(&self) -> Option<&str> {
        self.task.target_resource.as_deref()
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acquire a permit on the task's target resource
    pub async fn acquire(&self) -> Result<ResourcePermit> {
        let name = self.target_resource().ok_or_else(|| {
            OrchestratorError::handler(format!("task '{}' has no target resource", self.task.kind))
        })?;
        let gate = self.gates.get(name)?;
        self.acquire_gate(&gate).await
    }

    /// Acquire a permit on any registered resource
    pub async fn acquire_named(&self, name: &str) -> Result<ResourcePermit> {
        let gate = self.gates.get(name)?;
        self.acquire_gate(&gate).await
    }

    /// Exclusive lock on a file path, held until the permit is dropped
    pub async fn path_lock(&self, path: &str) -> Result<ResourcePermit> {
        let gate = self.gates.path_lock(path);
        self.acquire_gate(&gate).await
    }

    /// Run `f` while holding a permit on the task's target resource
    pub async fn with_resource<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire().await?;
        Self::settle(permit, f().await)
    }

    /// Run `f` while holding a permit on the named resource
    pub async fn with_named_resource<F, Fut, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire_named(name).await?;
        Self::settle(permit, f().await)
    }

    fn settle<T>(permit: ResourcePermit, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => permit.success(),
            // Dropped unsettled; released without a breaker signal
            Err(OrchestratorError::Cancelled) => drop(permit),
            Err(_) => permit.failure(),
        }
        result
    }

    async fn acquire_gate(&self, gate: &Arc<ResourceGate>) -> Result<ResourcePermit> {
        self.checkpoint()?;
        let permit = tokio::select! {
            permit = gate.acquire() => permit?,
            _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
        };
        Ok(permit.bind_cancellation(self.cancel.clone()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the task is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Return `Err(Cancelled)` if cancellation was requested
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::ResourceConfig;
    use serde_json::json;

    fn context(task: Task) -> (TaskContext, Arc<GateRegistry>, CancellationToken) {
        let gates = Arc::new(
            GateRegistry::from_configs(&[ResourceConfig::new("linear", 1).with_max_waiters(4)])
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        let ctx = TaskContext::new(Arc::new(task), 1, cancel.clone(), Arc::clone(&gates));
        (ctx, gates, cancel)
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = HandlerRegistry::new();
        registry.register("echo", handler_fn(|ctx| async move { Ok(ctx.payload().clone()) }));

        assert!(registry.contains("echo"));
        assert!(matches!(
            registry.get("missing"),
            Err(OrchestratorError::UnknownTaskKind { .. })
        ));

        let (ctx, _, _) = context(Task::new("echo").with_payload(json!({"n": 1})));
        let output = registry.get("echo").unwrap().handle(ctx).await.unwrap();
        assert_eq!(output, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_with_resource_releases_and_records() {
        let (ctx, gates, _) = context(Task::new("fix").with_resource("linear"));

        let value = ctx
            .with_resource(|| async {
                assert_eq!(gates.get("linear").unwrap().in_flight(), 1);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let gate = gates.get("linear").unwrap();
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.snapshot().total_calls, 1);
    }

    #[tokio::test]
    async fn test_acquire_without_target_fails() {
        let (ctx, _, _) = context(Task::new("fix"));
        assert!(matches!(
            ctx.acquire().await,
            Err(OrchestratorError::HandlerError { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_gate_wait() {
        let (ctx, gates, cancel) = context(Task::new("fix").with_resource("linear"));
        let held = gates.get("linear").unwrap().acquire().await.unwrap();

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.acquire().await })
        };
        while gates.get("linear").unwrap().waiting() == 0 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(OrchestratorError::Cancelled)));
        assert_eq!(gates.get("linear").unwrap().waiting(), 0);

        held.success();
        assert_eq!(gates.get("linear").unwrap().in_flight(), 0);
        assert!(ctx.checkpoint().is_err());
    }

    #[tokio::test]
    async fn test_path_lock_serializes_writers() {
        let (ctx, gates, _) = context(Task::new("write"));
        let first = ctx.path_lock("/tmp/out.md").await.unwrap();

        let second = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            ctx.path_lock("/tmp/out.md"),
        )
        .await;
        assert!(second.is_err());

        first.success();
        assert_eq!(gates.path_lock("/tmp/out.md").in_flight(), 0);
    }
}
