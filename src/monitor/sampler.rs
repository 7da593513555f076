// src/monitor/sampler.rs
//! Periodic performance sampling
//!
//! The monitor pulls queue depth, worker utilization and per-resource gate
//! statistics from a [`MetricsSource`] on a fixed interval, keeps them in a
//! bounded ring buffer, and raises alerts from the rolling window.

use crate::monitor::alerts::{self, Alert, AlertManager, ResourceAverages};
use crate::monitor::exporter::MetricsExporter;
use crate::resource::{CircuitState, GateSnapshot};
use crate::runtime::TaskCounts;
use crate::utils::config::MonitorConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Alerts retained for snapshots
const RECENT_ALERTS: usize = 50;

/// Where the monitor reads its figures from
pub trait MetricsSource: Send + Sync {
    fn queue_depth(&self) -> usize;

    /// Workers currently running a task
    fn active_workers(&self) -> usize;

    fn worker_count(&self) -> usize;

    fn resources(&self) -> Vec<GateSnapshot>;

    fn task_counts(&self) -> TaskCounts {
        TaskCounts::default()
    }
}

/// One resource's figures at sampling time
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSample {
    pub name: String,
    pub avg_latency_ms: f64,
    pub success_rate_pct: f64,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub waiting: usize,
    /// Calls inside the gate's statistics window
    pub window_calls: usize,
    pub circuit_state: CircuitState,
}

impl From<GateSnapshot> for ResourceSample {
    fn from(gate: GateSnapshot) -> Self {
        Self {
            name: gate.name,
            avg_latency_ms: gate.avg_latency_ms,
            success_rate_pct: gate.success_rate_pct,
            in_flight: gate.in_flight,
            max_concurrent: gate.max_concurrent,
            waiting: gate.waiting,
            window_calls: gate.window_calls,
            circuit_state: gate.breaker.state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub worker_count: usize,
    pub utilization_pct: f64,
    pub resources: Vec<ResourceSample>,
    pub tasks: TaskCounts,
    #[serde(skip)]
    pub(crate) taken_at: Instant,
}

impl PerformanceSample {
    pub fn collect(source: &dyn MetricsSource) -> Self {
        let worker_count = source.worker_count();
        let active_workers = source.active_workers();
        let utilization_pct = if worker_count == 0 {
            0.0
        } else {
            active_workers as f64 / worker_count as f64 * 100.0
        };

        Self {
            timestamp: Utc::now(),
            queue_depth: source.queue_depth(),
            active_workers,
            worker_count,
            utilization_pct,
            resources: source.resources().into_iter().map(ResourceSample::from).collect(),
            tasks: source.task_counts(),
            taken_at: Instant::now(),
        }
    }
}

/// Rolling-window averages
#[derive(Debug, Clone, Serialize)]
pub struct WindowAverages {
    pub samples: usize,
    pub queue_depth: f64,
    pub utilization_pct: f64,
    pub resources: Vec<(String, ResourceAverages)>,
}

/// Aggregated view handed to exporters and callers
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub latest: PerformanceSample,
    pub window: WindowAverages,
    pub retained_samples: usize,
    pub alerts_emitted: u64,
    pub alerts_suppressed: u64,
    pub recent_alerts: Vec<Alert>,
}

type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

struct MonitorState {
    samples: VecDeque<PerformanceSample>,
    alerts: AlertManager,
    recent_alerts: VecDeque<Alert>,
}

/// Periodic sampler and alert source
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    alert_tx: broadcast::Sender<Alert>,
    callbacks: Mutex<Vec<AlertCallback>>,
    exporter: Option<MetricsExporter>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let (alert_tx, _) = broadcast::channel(64);
        let exporter = config.export_path.clone().map(MetricsExporter::new);
        Arc::new(Self {
            state: Mutex::new(MonitorState {
                samples: VecDeque::new(),
                alerts: AlertManager::new(config.cooldown()),
                recent_alerts: VecDeque::new(),
            }),
            config,
            alert_tx,
            callbacks: Mutex::new(Vec::new()),
            exporter,
            running: Mutex::new(None),
        })
    }

    /// Begin sampling `source` on the configured interval
    pub fn start(self: &Arc<Self>, source: Arc<dyn MetricsSource>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let stop = token.clone();
        let interval = self.config.sample_interval();
        info!("Starting performance monitor (interval {:?})", interval);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.sample_now(source.as_ref()).await;
                    }
                    _ = stop.cancelled() => break,
                }
            }
            debug!("Performance monitor loop exited");
        });

        *running = Some((token, handle));
    }

    /// Stop the sampling loop
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Monitor task exited abnormally: {}", e);
            }
            info!("Performance monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Take one sample, evaluate alerts, and export. Returns the sample.
    pub async fn sample_now(&self, source: &dyn MetricsSource) -> PerformanceSample {
        let sample = PerformanceSample::collect(source);
        publish_gauges(&sample);

        let fired = {
            let mut state = self.state.lock();
            state.samples.push_back(sample.clone());
            self.purge(&mut state.samples);

            let window: Vec<PerformanceSample> = state
                .samples
                .iter()
                .rev()
                .take(self.config.window_size)
                .rev()
                .cloned()
                .collect();
            let candidates = alerts::evaluate(
                &window,
                &self.config.thresholds,
                self.config.critical_multiplier,
            );
            let fired = state.alerts.filter(candidates);

            for alert in &fired {
                if state.recent_alerts.len() == RECENT_ALERTS {
                    state.recent_alerts.pop_front();
                }
                state.recent_alerts.push_back(alert.clone());
            }
            fired
        };

        for alert in &fired {
            self.dispatch(alert);
        }

        if let Some(exporter) = &self.exporter {
            if let Some(snapshot) = self.snapshot() {
                if let Err(e) = exporter.export(&snapshot).await {
                    error!("Metrics export failed: {}", e);
                }
            }
        }

        sample
    }

    fn purge(&self, samples: &mut VecDeque<PerformanceSample>) {
        let retention = self.config.retention();
        while let Some(oldest) = samples.front() {
            if oldest.taken_at.elapsed() > retention || samples.len() > self.config.max_samples {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn dispatch(&self, alert: &Alert) {
        warn!(
            alert_type = alert.alert_type.as_str(),
            resource = alert.resource.as_deref().unwrap_or("-"),
            "{}",
            alert
        );
        metrics::counter!(
            "orchestrator_alerts_total",
            "type" => alert.alert_type.as_str(),
            "severity" => match alert.severity {
                alerts::Severity::Warning => "warning",
                alerts::Severity::Critical => "critical",
            }
        )
        .increment(1);

        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(alert);
        }
        // No subscribers is fine
        let _ = self.alert_tx.send(alert.clone());
    }

    /// Receive alerts as they fire
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alert_tx.subscribe()
    }

    /// Register a synchronous alert callback
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Retained samples, oldest first
    pub fn samples(&self) -> Vec<PerformanceSample> {
        self.state.lock().samples.iter().cloned().collect()
    }

    /// Latest aggregated metrics, `None` before the first sample
    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        let state = self.state.lock();
        let latest = state.samples.back()?.clone();

        let window: Vec<PerformanceSample> = state
            .samples
            .iter()
            .rev()
            .take(self.config.window_size)
            .cloned()
            .collect();
        let n = window.len() as f64;

        Some(MetricsSnapshot {
            generated_at: Utc::now(),
            latest,
            window: WindowAverages {
                samples: window.len(),
                queue_depth: window.iter().map(|s| s.queue_depth as f64).sum::<f64>() / n,
                utilization_pct: window.iter().map(|s| s.utilization_pct).sum::<f64>() / n,
                resources: alerts::resource_averages(&window),
            },
            retained_samples: state.samples.len(),
            alerts_emitted: state.alerts.emitted(),
            alerts_suppressed: state.alerts.suppressed(),
            recent_alerts: state.recent_alerts.iter().cloned().collect(),
        })
    }
}

fn publish_gauges(sample: &PerformanceSample) {
    metrics::gauge!("orchestrator_queue_depth").set(sample.queue_depth as f64);
    metrics::gauge!("orchestrator_worker_utilization_pct").set(sample.utilization_pct);
    for resource in &sample.resources {
        let name = resource.name.clone();
        metrics::gauge!("orchestrator_gate_in_flight", "resource" => name.clone())
            .set(resource.in_flight as f64);
        metrics::gauge!("orchestrator_gate_latency_ms", "resource" => name.clone())
            .set(resource.avg_latency_ms);
        metrics::gauge!("orchestrator_gate_success_rate_pct", "resource" => name)
            .set(resource.success_rate_pct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::alerts::AlertType;
    use crate::resource::{CircuitBreakerConfig, ResourceGate};
    use crate::utils::config::AlertThresholds;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Source backed by a real gate, with adjustable queue depth and workers
    struct FakeSource {
        gate: Arc<ResourceGate>,
        others: Vec<Arc<ResourceGate>>,
        depth: AtomicUsize,
        active: AtomicUsize,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                gate: Arc::new(ResourceGate::with_breaker(
                    "linear",
                    2,
                    10,
                    CircuitBreakerConfig::never_trips(),
                    10,
                )),
                others: Vec::new(),
                depth: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }
        }

        fn with_gate(mut self, name: &str) -> Self {
            self.others.push(Arc::new(ResourceGate::with_breaker(
                name,
                2,
                10,
                CircuitBreakerConfig::never_trips(),
                10,
            )));
            self
        }
    }

    impl MetricsSource for FakeSource {
        fn queue_depth(&self) -> usize {
            self.depth.load(Ordering::SeqCst)
        }

        fn active_workers(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        fn worker_count(&self) -> usize {
            3
        }

        fn resources(&self) -> Vec<GateSnapshot> {
            std::iter::once(&self.gate)
                .chain(&self.others)
                .map(|gate| gate.snapshot())
                .collect()
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            sample_interval_ms: 1_000,
            retention_ms: 60_000,
            max_samples: 100,
            window_size: 3,
            cooldown_ms: 300_000,
            critical_multiplier: 2.0,
            thresholds: AlertThresholds {
                response_time_ms: 100.0,
                success_rate_pct: 90.0,
                utilization_pct: 90.0,
                queue_depth: 5,
            },
            export_path: None,
        }
    }

    async fn slow_call(gate: &Arc<ResourceGate>, latency: Duration) {
        let permit = gate.acquire().await.unwrap();
        tokio::time::advance(latency).await;
        permit.success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_fields() {
        let monitor = PerformanceMonitor::new(config());
        let source = FakeSource::new();
        source.depth.store(4, Ordering::SeqCst);
        source.active.store(3, Ordering::SeqCst);

        let sample = monitor.sample_now(&source).await;
        assert_eq!(sample.queue_depth, 4);
        assert_eq!(sample.active_workers, 3);
        assert_eq!(sample.utilization_pct, 100.0);
        assert_eq!(sample.resources.len(), 1);
        assert_eq!(sample.resources[0].name, "linear");
        assert_eq!(sample.resources[0].circuit_state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_resource_alerts_once_per_cooldown() {
        let monitor = PerformanceMonitor::new(config());
        let mut alerts = monitor.subscribe();
        let callback_count = Arc::new(AtomicUsize::new(0));
        {
            let callback_count = Arc::clone(&callback_count);
            monitor.on_alert(move |alert| {
                assert_eq!(alert.alert_type, AlertType::ResponseTime);
                callback_count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let source = FakeSource::new();
        for _ in 0..10 {
            slow_call(&source.gate, Duration::from_millis(500)).await;
            monitor.sample_now(&source).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(callback_count.load(Ordering::SeqCst), 1);
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.alert_type, AlertType::ResponseTime);
        assert_eq!(alert.resource.as_deref(), Some("linear"));
        assert!(alert.measured_value > 100.0);
        assert!(alerts.try_recv().is_err());

        let snapshot = monitor.snapshot().unwrap();
        assert_eq!(snapshot.alerts_emitted, 1);
        assert_eq!(snapshot.alerts_suppressed, 9);
        assert_eq!(snapshot.recent_alerts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_slow_resources_share_one_cooldown() {
        let monitor = PerformanceMonitor::new(config());
        let mut alerts = monitor.subscribe();
        let source = FakeSource::new().with_gate("github");

        for _ in 0..10 {
            slow_call(&source.gate, Duration::from_millis(500)).await;
            slow_call(&source.others[0], Duration::from_millis(500)).await;
            monitor.sample_now(&source).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.alert_type, AlertType::ResponseTime);
        assert!(alerts.try_recv().is_err());
        assert_eq!(monitor.snapshot().unwrap().alerts_emitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_purges_old_samples() {
        let mut cfg = config();
        cfg.retention_ms = 5_000;
        let monitor = PerformanceMonitor::new(cfg);
        let source = FakeSource::new();

        for _ in 0..10 {
            monitor.sample_now(&source).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        let samples = monitor.samples();
        assert!(samples.len() <= 6);
        assert!(samples.iter().all(|s| s.taken_at.elapsed() <= Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_samples_bound() {
        let mut cfg = config();
        cfg.max_samples = 4;
        let monitor = PerformanceMonitor::new(cfg);
        let source = FakeSource::new();
        for _ in 0..10 {
            monitor.sample_now(&source).await;
        }
        assert_eq!(monitor.samples().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_samples_on_interval() {
        let monitor = PerformanceMonitor::new(config());
        let source: Arc<dyn MetricsSource> = Arc::new(FakeSource::new());

        assert!(monitor.snapshot().is_none());
        monitor.start(source);
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        // Immediate first tick plus one per second
        assert_eq!(monitor.samples().len(), 4);
        let snapshot = monitor.snapshot().unwrap();
        assert_eq!(snapshot.window.samples, 3);
    }
}
