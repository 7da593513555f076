// src/resource/mod.rs
//! Resource admission control
//!
//! - **Gate**: per-resource concurrency cap with a bounded FIFO wait queue
//! - **Circuit breaker**: fails fast while a resource is unhealthy
//! - **Stats**: rolling latency and success rate per resource
//! - **Registry**: named gates plus on-demand path locks

pub mod circuit_breaker;
pub mod gate;
pub mod registry;
pub mod stats;

pub use circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use gate::{GateSnapshot, ResourceGate, ResourcePermit};
pub use registry::GateRegistry;
pub use stats::CallStats;
