// src/utils/config.rs
//! Orchestrator configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `orchestrator.{toml,yaml,json}` file (or the path in
//! `MCP_ORCHESTRATOR_CONFIG`), then `MCP_ORCH__SECTION__KEY` environment
//! variables.

use crate::utils::errors::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "MCP_ORCHESTRATOR_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "MCP_ORCH";

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of worker execution slots (default: 3)
    pub worker_pool_size: usize,

    /// System-wide cap on admitted, unfinished tasks
    pub max_in_flight: usize,

    /// Task queue capacity (backpressure bound)
    pub queue_capacity: usize,

    /// Timeout applied to tasks that do not set one
    pub default_timeout_ms: u64,

    /// Attempts applied to tasks that do not set them
    pub default_max_attempts: u32,

    /// How long a cancelled running handler may take to wind down
    pub cancel_grace_ms: u64,

    pub retry: RetryConfig,

    /// Downstream resources (MCP servers) and their limits
    pub resources: Vec<ResourceConfig>,

    pub monitor: MonitorConfig,

    pub workflow: WorkflowConfig,

    pub degradation: DegradationConfig,

    pub logging: LoggingConfig,

    /// Prometheus scrape address; metrics recorder is skipped when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 3,
            max_in_flight: 100,
            queue_capacity: 50,
            default_timeout_ms: 300_000,
            default_max_attempts: 3,
            cancel_grace_ms: 1_000,
            retry: RetryConfig::default(),
            resources: vec![],
            monitor: MonitorConfig::default(),
            workflow: WorkflowConfig::default(),
            degradation: DegradationConfig::default(),
            logging: LoggingConfig::default(),
            metrics_addr: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "orchestrator".to_string());
        Self::load_from(&path)
    }

    /// Load configuration from `path` (extension optional) plus environment
    pub fn load_from(path: &str) -> Result<Self> {
        debug!("Loading configuration from {}", path);

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(OrchestratorError::config("worker_pool_size cannot be 0"));
        }
        if self.max_in_flight == 0 {
            return Err(OrchestratorError::config("max_in_flight cannot be 0"));
        }
        if self.queue_capacity == 0 {
            return Err(OrchestratorError::config("queue_capacity cannot be 0"));
        }
        if self.default_max_attempts == 0 {
            return Err(OrchestratorError::config("default_max_attempts cannot be 0"));
        }

        let mut seen = std::collections::HashSet::new();
        for resource in &self.resources {
            resource.validate()?;
            if !seen.insert(resource.name.as_str()) {
                return Err(OrchestratorError::config(format!(
                    "duplicate resource '{}'",
                    resource.name
                )));
            }
        }

        self.retry.validate()?;
        self.monitor.validate()?;

        let ratio = self.workflow.parallel_success_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(OrchestratorError::config(
                "workflow.parallel_success_ratio must be within 0.0..=1.0",
            ));
        }

        let factor = self.degradation.admission_factor;
        if !(0.0..=1.0).contains(&factor) || factor == 0.0 {
            return Err(OrchestratorError::config(
                "degradation.admission_factor must be within (0.0, 1.0]",
            ));
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Limits for one downstream resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Resource name (e.g. "linear", "github")
    pub name: String,

    /// Maximum concurrently in-flight calls
    pub max_concurrent: usize,

    /// Callers allowed to wait for a slot before `ResourceExhausted`
    pub max_waiters: usize,

    /// Failures within `failure_window_ms` that trip the breaker
    pub failure_threshold: u32,

    /// Time the breaker stays open before a trial call
    pub reset_timeout_ms: u64,

    /// Sliding window over which failures are counted
    pub failure_window_ms: u64,

    /// Calls kept for rolling latency/success statistics
    pub stats_window: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_concurrent: 2,
            max_waiters: 10,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            failure_window_ms: 60_000,
            stats_window: 100,
        }
    }
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            ..Default::default()
        }
    }

    pub fn with_breaker(mut self, failure_threshold: u32, reset_timeout: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.reset_timeout_ms = reset_timeout.as_millis() as u64;
        self
    }

    pub fn with_max_waiters(mut self, max_waiters: usize) -> Self {
        self.max_waiters = max_waiters;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::config("resource name cannot be empty"));
        }
        if self.max_concurrent == 0 {
            return Err(OrchestratorError::config(format!(
                "resource '{}': max_concurrent cannot be 0",
                self.name
            )));
        }
        if self.failure_threshold == 0 {
            return Err(OrchestratorError::config(format!(
                "resource '{}': failure_threshold cannot be 0",
                self.name
            )));
        }
        if self.stats_window == 0 {
            return Err(OrchestratorError::config(format!(
                "resource '{}': stats_window cannot be 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Retry/backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Add up to 25% random jitter on top of the computed delay
    pub jitter: bool,
    /// Minimum delay after a `CircuitOpen` failure
    pub circuit_open_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            circuit_open_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(OrchestratorError::config("retry.multiplier must be >= 1.0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(OrchestratorError::config(
                "retry.max_delay_ms must be >= retry.base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Alert thresholds compared against rolling averages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Average call latency above which an alert fires
    pub response_time_ms: f64,
    /// Success rate below which an alert fires
    pub success_rate_pct: f64,
    /// Worker utilization above which an alert fires
    pub utilization_pct: f64,
    /// Queue depth above which an alert fires
    pub queue_depth: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time_ms: 5_000.0,
            success_rate_pct: 90.0,
            utilization_pct: 90.0,
            queue_depth: 20,
        }
    }
}

/// Performance monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    /// Samples older than this are purged every tick
    pub retention_ms: u64,
    /// Hard cap on retained samples
    pub max_samples: usize,
    /// Number of recent samples averaged for alerting
    pub window_size: usize,
    /// Minimum gap between two alerts of the same type
    pub cooldown_ms: u64,
    /// Ratio past the threshold at which an alert is critical
    pub critical_multiplier: f64,
    pub thresholds: AlertThresholds,
    /// Write the JSON snapshot here every tick
    pub export_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            retention_ms: 3_600_000,
            max_samples: 1_000,
            window_size: 5,
            cooldown_ms: 300_000,
            critical_multiplier: 2.0,
            thresholds: AlertThresholds::default(),
            export_path: None,
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(OrchestratorError::config("monitor.sample_interval_ms cannot be 0"));
        }
        if self.window_size == 0 || self.max_samples == 0 {
            return Err(OrchestratorError::config(
                "monitor.window_size and monitor.max_samples cannot be 0",
            ));
        }
        if self.critical_multiplier < 1.0 {
            return Err(OrchestratorError::config(
                "monitor.critical_multiplier must be >= 1.0",
            ));
        }
        let pct = |v: f64| (0.0..=100.0).contains(&v);
        if !pct(self.thresholds.success_rate_pct) || !pct(self.thresholds.utilization_pct) {
            return Err(OrchestratorError::config(
                "percentage thresholds must be within 0..=100",
            ));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Fraction of required tasks a parallel workflow must complete
    pub parallel_success_ratio: f64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            parallel_success_ratio: 1.0,
        }
    }
}

/// Admission tightening applied after a critical alert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Multiplier applied to `max_in_flight` while degraded
    pub admission_factor: f64,
    pub duration_ms: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            admission_factor: 0.5,
            duration_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
