// src/resource/circuit_breaker.rs
//! Per-resource circuit breaker
//!
//! ```text
//!            failures >= threshold (within window)
//!   Closed ─────────────────────────────────────▶ Open
//!     ▲                                            │ reset_timeout elapsed
//!     │ trial success                              ▼
//!     └──────────────────────────────────────── HalfOpen ── trial failure ──▶ Open
//! ```
//!
//! While `HalfOpen` exactly one trial call is admitted; every other caller is
//! rejected until the trial resolves.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,

    /// Time spent `Open` before a trial call is admitted
    pub reset_timeout: Duration,

    /// Sliding window for counting failures
    pub failure_window: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            failure_window: Duration::from_secs(60),
        }
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// A breaker that never opens (used for path locks)
    pub fn never_trips() -> Self {
        Self {
            failure_threshold: u32::MAX,
            reset_timeout: Duration::ZERO,
            failure_window: Duration::from_secs(60),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Ordinary call in the `Closed` state
    Normal,
    /// The single `HalfOpen` trial call; its outcome decides the transition
    Trial,
}

struct BreakerInner {
    state: CircuitState,
    /// Failure timestamps inside the sliding window
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
    trips: u64,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Failure-rate switch guarding one resource
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                last_failure_at: None,
                trips: 0,
            }),
        }
    }

    /// Decide whether a call may proceed, and in which role.
    ///
    /// `None` means the circuit rejects the call.
    pub fn admit(&self) -> Option<Admission> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.prune(now, self.config.failure_window);
                Some(Admission::Normal)
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or(Duration::MAX);

                if elapsed >= self.config.reset_timeout {
                    info!("Circuit for '{}' half-open, admitting trial call", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Self::emit_transition(&self.name, CircuitState::HalfOpen);
                    Some(Admission::Trial)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    // Previous trial was abandoned without an outcome
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    /// Whether a call may proceed
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Whether `admit` would reject right now, without changing state
    pub fn is_rejecting(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => inner
                .opened_at
                .map(|opened| opened.elapsed() < self.config.reset_timeout)
                .unwrap_or(false),
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen => {
                info!("Trial call for '{}' succeeded, closing circuit", self.name);
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                Self::emit_transition(&self.name, CircuitState::Closed);
            }
            // Late result from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.prune(now, self.config.failure_window);
                inner.failures.push_back(now);

                if inner.failures.len() as u64 >= self.config.failure_threshold as u64 {
                    warn!(
                        "Circuit for '{}' opened after {} failures",
                        self.name,
                        inner.failures.len()
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.trips += 1;
                    Self::emit_transition(&self.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Trial call for '{}' failed, re-opening circuit", self.name);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                inner.trips += 1;
                Self::emit_transition(&self.name, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Release the trial slot without an outcome (trial cancelled or timed out
    /// before reaching the resource). The next caller becomes the trial.
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures currently counted inside the window
    pub fn failure_count(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.failure_window);
        inner.failures.len() as u32
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Force the circuit closed and forget all failures
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.failure_window);
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            last_failure_at: inner.last_failure_at,
            trips: inner.trips,
        }
    }

    fn emit_transition(name: &str, to: CircuitState) {
        metrics::counter!(
            "orchestrator_breaker_transitions_total",
            "resource" => name.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Times the circuit has opened
    pub trips: u64,
}
