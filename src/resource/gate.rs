// src/resource/gate.rs
//! Rate-limited resource gate
//!
//! Bounds concurrent calls to one named downstream resource (an MCP server,
//! an API, a file path). Admission goes through the resource's circuit
//! breaker first, then the capacity check, then a bounded FIFO wait queue.
//!
//! # Architecture
//!
//! ```text
//! acquire() ──▶ CircuitBreaker ──open──▶ Err(CircuitOpen)
//!                    │ allowed
//!                    ▼
//!              in_flight < max ──yes──▶ ResourcePermit
//!                    │ no
//!                    ▼
//!              waiters < max_waiters ──no──▶ Err(ResourceExhausted)
//!                    │ yes
//!                    ▼
//!              wait (FIFO) ◀── release() hands the slot over
//! ```
//!
//! Permits are RAII: dropping one releases the slot, so a handler that is
//! timed out, cancelled, or panics can never leak capacity.

use crate::resource::circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
};
use crate::resource::stats::CallStats;
use crate::utils::config::ResourceConfig;
use crate::utils::errors::{OrchestratorError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct GateInner {
    in_flight: usize,
    peak_in_flight: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    acquired_total: u64,
    rejected_total: u64,
}

impl GateInner {
    fn occupy(&mut self) {
        self.in_flight += 1;
        self.acquired_total += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
    }

    /// Hand the slot to the oldest live waiter, or free it
    fn release_slot(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                self.acquired_total += 1;
                return;
            }
        }
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// Admission-control wrapper bounding concurrent use of one resource
pub struct ResourceGate {
    name: String,
    max_concurrent: usize,
    max_waiters: usize,
    breaker: CircuitBreaker,
    inner: Mutex<GateInner>,
    stats: Mutex<CallStats>,
}

impl ResourceGate {
    /// Create a gate from static resource configuration
    pub fn new(config: &ResourceConfig) -> Self {
        let breaker_config = CircuitBreakerConfig::new(
            config.failure_threshold,
            Duration::from_millis(config.reset_timeout_ms),
        )
        .with_failure_window(Duration::from_millis(config.failure_window_ms));

        Self::with_breaker(
            config.name.clone(),
            config.max_concurrent,
            config.max_waiters,
            breaker_config,
            config.stats_window,
        )
    }

    pub fn with_breaker(
        name: impl Into<String>,
        max_concurrent: usize,
        max_waiters: usize,
        breaker: CircuitBreakerConfig,
        stats_window: usize,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), breaker),
            name,
            max_concurrent: max_concurrent.max(1),
            max_waiters,
            inner: Mutex::new(GateInner {
                in_flight: 0,
                peak_in_flight: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                acquired_total: 0,
                rejected_total: 0,
            }),
            stats: Mutex::new(CallStats::new(stats_window)),
        }
    }

    /// Acquire a permit, waiting in FIFO order while the gate is at capacity.
    ///
    /// Fails fast with `CircuitOpen` when the breaker rejects the call and
    /// with `ResourceExhausted` when the wait queue is full. Dropping the
    /// returned future while waiting gives up the place in line (or the
    /// slot, if it was already handed over).
    pub async fn acquire(self: &Arc<Self>) -> Result<ResourcePermit> {
        let admission = match self.breaker.admit() {
            Some(admission) => admission,
            None => {
                trace!("Gate '{}' rejected call: circuit open", self.name);
                metrics::counter!(
                    "orchestrator_gate_rejections_total",
                    "resource" => self.name.clone(),
                    "reason" => "circuit_open"
                )
                .increment(1);
                return Err(OrchestratorError::CircuitOpen {
                    resource: self.name.clone(),
                });
            }
        };
        let trial = admission == Admission::Trial;

        let (id, rx) = {
            let mut inner = self.inner.lock();

            if inner.in_flight < self.max_concurrent {
                inner.occupy();
                trace!(
                    "Gate '{}' acquired ({}/{})",
                    self.name,
                    inner.in_flight,
                    self.max_concurrent
                );
                return Ok(ResourcePermit::new(Arc::clone(self), trial));
            }

            if inner.waiters.len() >= self.max_waiters {
                inner.rejected_total += 1;
                drop(inner);
                if trial {
                    self.breaker.abandon_trial();
                }
                debug!("Gate '{}' exhausted: capacity and wait queue full", self.name);
                metrics::counter!(
                    "orchestrator_gate_rejections_total",
                    "resource" => self.name.clone(),
                    "reason" => "exhausted"
                )
                .increment(1);
                return Err(OrchestratorError::ResourceExhausted {
                    resource: self.name.clone(),
                });
            }

            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { id, tx });
            trace!(
                "Gate '{}' full, waiting ({} in line)",
                self.name,
                inner.waiters.len()
            );
            (id, rx)
        };

        let mut guard = WaitGuard {
            gate: self,
            id,
            trial,
            armed: true,
        };

        let handed_over = rx.await.is_ok();
        guard.armed = false;

        if handed_over {
            Ok(ResourcePermit::new(Arc::clone(self), trial))
        } else {
            if trial {
                self.breaker.abandon_trial();
            }
            Err(OrchestratorError::ResourceExhausted {
                resource: self.name.clone(),
            })
        }
    }

    /// Run `f` under a permit, settling the permit from its result
    pub async fn call<F, Fut, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire().await?;
        let result = f().await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    fn release(&self, outcome: PermitOutcome, latency: Duration, trial: bool) {
        match outcome {
            PermitOutcome::Success => {
                self.breaker.record_success();
                self.stats.lock().record(latency, true);
            }
            PermitOutcome::Failure => {
                self.breaker.record_failure();
                self.stats.lock().record(latency, false);
            }
            PermitOutcome::Abandoned => {
                if trial {
                    self.breaker.abandon_trial();
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.release_slot();
        trace!("Gate '{}' released ({}/{})", self.name, inner.in_flight, self.max_concurrent);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Callers currently waiting for a slot
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Highest `in_flight` ever observed
    pub fn peak_in_flight(&self) -> usize {
        self.inner.lock().peak_in_flight
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let (in_flight, waiting, peak, acquired, rejected) = {
            let inner = self.inner.lock();
            (
                inner.in_flight,
                inner.waiters.len(),
                inner.peak_in_flight,
                inner.acquired_total,
                inner.rejected_total,
            )
        };
        let stats = self.stats.lock().clone();

        GateSnapshot {
            name: self.name.clone(),
            max_concurrent: self.max_concurrent,
            in_flight,
            waiting,
            peak_in_flight: peak,
            avg_latency_ms: stats.avg_latency_ms(),
            success_rate_pct: stats.success_rate_pct(),
            window_calls: stats.window_len(),
            total_calls: stats.total_calls(),
            acquired_total: acquired,
            rejected_total: rejected,
            breaker: self.breaker.snapshot(),
        }
    }
}

/// Cleans up a waiter whose acquire future was dropped
struct WaitGuard<'a> {
    gate: &'a ResourceGate,
    id: u64,
    trial: bool,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut inner = self.gate.inner.lock();
            match inner.waiters.iter().position(|w| w.id == self.id) {
                Some(pos) => {
                    inner.waiters.remove(pos);
                }
                // Slot was already handed to us; pass it on
                None => inner.release_slot(),
            }
        }
        if self.trial {
            self.gate.breaker.abandon_trial();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitOutcome {
    Success,
    Failure,
    Abandoned,
}

/// Scoped right to make one call against a resource.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled counts as a failure, unless the owning task was
/// cancelled, in which case the slot is released without a breaker signal.
pub struct ResourcePermit {
    gate: Arc<ResourceGate>,
    acquired_at: Instant,
    trial: bool,
    settled: bool,
    cancel: Option<CancellationToken>,
}

impl ResourcePermit {
    fn new(gate: Arc<ResourceGate>, trial: bool) -> Self {
        Self {
            gate,
            acquired_at: Instant::now(),
            trial,
            settled: false,
            cancel: None,
        }
    }

    /// Tie the permit to a task's cancellation token
    pub(crate) fn bind_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn resource(&self) -> &str {
        self.gate.name()
    }

    /// Whether this call is the circuit breaker's half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release after a successful call
    pub fn success(mut self) {
        self.settle(PermitOutcome::Success);
    }

    /// Release after a failed call
    pub fn failure(mut self) {
        self.settle(PermitOutcome::Failure);
    }

    fn settle(&mut self, outcome: PermitOutcome) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.gate.release(outcome, self.acquired_at.elapsed(), self.trial);
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        let cancelled = self
            .cancel
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false);
        let outcome = if cancelled {
            PermitOutcome::Abandoned
        } else {
            PermitOutcome::Failure
        };
        self.settle(outcome);
    }
}

impl std::fmt::Debug for ResourcePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePermit")
            .field("resource", &self.gate.name())
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Point-in-time view of a gate
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub name: String,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub peak_in_flight: usize,
    pub avg_latency_ms: f64,
    pub success_rate_pct: f64,
    /// Calls inside the rolling statistics window
    pub window_calls: usize,
    pub total_calls: u64,
    pub acquired_total: u64,
    pub rejected_total: u64,
    pub breaker: BreakerSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::circuit_breaker::CircuitState;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gate(max_concurrent: usize, max_waiters: usize) -> Arc<ResourceGate> {
        Arc::new(ResourceGate::with_breaker(
            "linear",
            max_concurrent,
            max_waiters,
            CircuitBreakerConfig::new(3, Duration::from_secs(30)),
            50,
        ))
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let gate = gate(2, 0);

        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        a.success();
        assert_eq!(gate.in_flight(), 1);
        b.success();
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.snapshot().total_calls, 2);
    }

    #[tokio::test]
    async fn test_exhausted_when_wait_queue_full() {
        let gate = gate(1, 1);
        let held = gate.acquire().await.unwrap();

        let waiting = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.map(|p| p.success()) })
        };
        while gate.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let result = gate.acquire().await;
        assert!(matches!(result, Err(OrchestratorError::ResourceExhausted { .. })));
        // A failed acquire does not change the count
        assert_eq!(gate.in_flight(), 1);

        held.success();
        waiting.await.unwrap().unwrap();
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.snapshot().rejected_total, 1);
    }

    #[tokio::test]
    async fn test_waiters_released_fifo() {
        let gate = gate(1, 10);
        let held = gate.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = vec![];
        for i in 0..5 {
            let gate_clone = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = gate_clone.acquire().await.unwrap();
                order.lock().push(i);
                permit.success();
            }));
            // Make the queueing order deterministic
            while gate.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        held.success();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_queue() {
        let gate = gate(1, 10);
        let held = gate.acquire().await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(result.is_err());
        assert_eq!(gate.waiting(), 0);

        held.success();
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unsettled_permit_released_on_drop() {
        let gate = gate(1, 0);
        {
            let _permit = gate.acquire().await.unwrap();
            assert_eq!(gate.in_flight(), 1);
        }
        assert_eq!(gate.in_flight(), 0);
        // Counted as a failure
        assert_eq!(gate.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_permit_is_abandoned() {
        let gate = gate(1, 0);
        let token = CancellationToken::new();
        let permit = gate.acquire().await.unwrap().bind_cancellation(token.clone());

        token.cancel();
        drop(permit);

        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_permit_released_when_handler_future_times_out() {
        let gate = gate(1, 0);

        let slow = {
            let gate = Arc::clone(&gate);
            async move {
                let _permit = gate.acquire().await?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, OrchestratorError>(())
            }
        };
        assert!(tokio::time::timeout(Duration::from_millis(10), slow).await.is_err());
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_permit_released_when_handler_panics() {
        let gate = gate(1, 0);
        let inner = Arc::clone(&gate);

        let result = tokio::spawn(async move {
            let _permit = inner.acquire().await.unwrap();
            panic!("handler bug");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_fails_fast_then_trial() {
        let gate = gate(2, 10);
        let invoked = AtomicUsize::new(0);

        for _ in 0..3 {
            let result: Result<()> = gate
                .call(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Err(OrchestratorError::handler("downstream 500"))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(gate.breaker().state(), CircuitState::Open);

        // Fourth call fails fast without invoking the body
        let result: Result<()> = gate
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = gate.acquire().await.unwrap();
        assert!(trial.is_trial());
        // Concurrent caller rejected while the trial is in flight
        assert!(matches!(
            gate.acquire().await,
            Err(OrchestratorError::CircuitOpen { .. })
        ));

        trial.success();
        assert_eq!(gate.breaker().state(), CircuitState::Closed);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_recorded() {
        let gate = gate(1, 0);
        gate.acquire().await.unwrap().success();
        gate.acquire().await.unwrap().failure();

        let snapshot = gate.snapshot();
        assert_eq!(snapshot.window_calls, 2);
        assert_eq!(snapshot.success_rate_pct, 50.0);
        assert_eq!(snapshot.breaker.failure_count, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_in_flight_never_exceeds_capacity(
            capacity in 1usize..5,
            holds in proptest::collection::vec(0u64..3, 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let (peak, observed_max, in_flight) = rt.block_on(async move {
                let gate = Arc::new(ResourceGate::with_breaker(
                    "prop",
                    capacity,
                    usize::MAX,
                    CircuitBreakerConfig::never_trips(),
                    10,
                ));
                let observed = Arc::new(AtomicUsize::new(0));

                let handles: Vec<_> = holds
                    .into_iter()
                    .map(|hold_ms| {
                        let gate = Arc::clone(&gate);
                        let observed = Arc::clone(&observed);
                        tokio::spawn(async move {
                            let permit = gate.acquire().await.unwrap();
                            observed.fetch_max(gate.in_flight(), Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                            if hold_ms % 2 == 0 {
                                permit.success();
                            } else {
                                drop(permit);
                            }
                        })
                    })
                    .collect();

                for handle in handles {
                    handle.await.unwrap();
                }
                (gate.peak_in_flight(), observed.load(Ordering::SeqCst), gate.in_flight())
            });

            prop_assert!(peak <= capacity);
            prop_assert!(observed_max <= capacity);
            prop_assert_eq!(in_flight, 0);
        }
    }
}
