// src/monitor/alerts.rs
//! Threshold alerts
//!
//! Alerts are computed from the rolling average of the most recent samples
//! and passed through an [`AlertManager`] that lets at most one alert of
//! each type out per cooldown window, whichever resource raised it.

use crate::monitor::sampler::PerformanceSample;
use crate::utils::config::AlertThresholds;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ResponseTime,
    SuccessRate,
    Utilization,
    QueueDepth,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ResponseTime => "response_time",
            AlertType::SuccessRate => "success_rate",
            AlertType::Utilization => "utilization",
            AlertType::QueueDepth => "queue_depth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// A threshold breach
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    /// Resource the alert is about; `None` for system-wide metrics
    pub resource: Option<String>,
    pub message: String,
    pub measured_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "[{}] {}", severity, self.message)
    }
}

/// Compare window averages against thresholds.
///
/// Latency and success rate are judged per resource, utilization and queue
/// depth system-wide. A breach is critical once it passes the threshold by
/// `critical_multiplier`: for higher-is-worse metrics the value reaches
/// `threshold * multiplier`; for percentages the remaining margin to the
/// bound shrinks by that factor.
pub fn evaluate(
    window: &[PerformanceSample],
    thresholds: &AlertThresholds,
    critical_multiplier: f64,
) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if window.is_empty() {
        return alerts;
    }
    let n = window.len() as f64;

    let utilization = window.iter().map(|s| s.utilization_pct).sum::<f64>() / n;
    if utilization > thresholds.utilization_pct {
        let critical_at = 100.0 - (100.0 - thresholds.utilization_pct) / critical_multiplier;
        alerts.push(alert(
            AlertType::Utilization,
            severity(utilization >= critical_at),
            None,
            format!(
                "Worker utilization {:.1}% above {:.1}%",
                utilization, thresholds.utilization_pct
            ),
            utilization,
            thresholds.utilization_pct,
        ));
    }

    let depth = window.iter().map(|s| s.queue_depth as f64).sum::<f64>() / n;
    let depth_threshold = thresholds.queue_depth as f64;
    if depth > depth_threshold {
        alerts.push(alert(
            AlertType::QueueDepth,
            severity(depth >= depth_threshold * critical_multiplier),
            None,
            format!("Queue depth {:.1} above {}", depth, thresholds.queue_depth),
            depth,
            depth_threshold,
        ));
    }

    for (resource, stats) in resource_averages(window) {
        if stats.avg_latency_ms > thresholds.response_time_ms {
            alerts.push(alert(
                AlertType::ResponseTime,
                severity(stats.avg_latency_ms >= thresholds.response_time_ms * critical_multiplier),
                Some(resource.clone()),
                format!(
                    "Response time for '{}' {:.0}ms above {:.0}ms",
                    resource, stats.avg_latency_ms, thresholds.response_time_ms
                ),
                stats.avg_latency_ms,
                thresholds.response_time_ms,
            ));
        }

        if stats.success_rate_pct < thresholds.success_rate_pct {
            let allowed_failure = 100.0 - thresholds.success_rate_pct;
            let failure = 100.0 - stats.success_rate_pct;
            alerts.push(alert(
                AlertType::SuccessRate,
                severity(failure >= allowed_failure * critical_multiplier),
                Some(resource.clone()),
                format!(
                    "Success rate for '{}' {:.1}% below {:.1}%",
                    resource, stats.success_rate_pct, thresholds.success_rate_pct
                ),
                stats.success_rate_pct,
                thresholds.success_rate_pct,
            ));
        }
    }

    alerts
}

/// Per-resource averages over a window
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceAverages {
    pub avg_latency_ms: f64,
    pub success_rate_pct: f64,
    pub in_flight: f64,
}

/// Average each resource's figures over the samples in which it had calls.
/// Resources without any calls in the window are left out.
pub fn resource_averages(window: &[PerformanceSample]) -> Vec<(String, ResourceAverages)> {
    let mut sums: HashMap<&str, (ResourceAverages, usize)> = HashMap::new();
    for sample in window {
        for resource in &sample.resources {
            if resource.window_calls == 0 {
                continue;
            }
            let (acc, count) = sums.entry(resource.name.as_str()).or_default();
            acc.avg_latency_ms += resource.avg_latency_ms;
            acc.success_rate_pct += resource.success_rate_pct;
            acc.in_flight += resource.in_flight as f64;
            *count += 1;
        }
    }

    let mut averages: Vec<(String, ResourceAverages)> = sums
        .into_iter()
        .map(|(name, (acc, count))| {
            let n = count as f64;
            (
                name.to_string(),
                ResourceAverages {
                    avg_latency_ms: acc.avg_latency_ms / n,
                    success_rate_pct: acc.success_rate_pct / n,
                    in_flight: acc.in_flight / n,
                },
            )
        })
        .collect();
    averages.sort_by(|a, b| a.0.cmp(&b.0));
    averages
}

fn severity(critical: bool) -> Severity {
    if critical {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

fn alert(
    alert_type: AlertType,
    severity: Severity,
    resource: Option<String>,
    message: String,
    measured_value: f64,
    threshold: f64,
) -> Alert {
    Alert {
        alert_type,
        severity,
        resource,
        message,
        measured_value,
        threshold,
        timestamp: Utc::now(),
    }
}

/// Suppresses repeated alerts inside the cooldown window
pub struct AlertManager {
    cooldown: Duration,
    last_emitted: HashMap<AlertType, Instant>,
    emitted: u64,
    suppressed: u64,
}

impl AlertManager {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_emitted: HashMap::new(),
            emitted: 0,
            suppressed: 0,
        }
    }

    /// Keep only alerts whose type has not fired within the cooldown.
    /// When several resources trip the same type at once the most severe wins.
    pub fn filter(&mut self, mut alerts: Vec<Alert>) -> Vec<Alert> {
        let now = Instant::now();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity));
        alerts
            .into_iter()
            .filter(|alert| self.admit(alert, now))
            .collect()
    }

    fn admit(&mut self, alert: &Alert, now: Instant) -> bool {
        let key = alert.alert_type;
        if let Some(last) = self.last_emitted.get(&key) {
            if now.saturating_duration_since(*last) < self.cooldown {
                self.suppressed += 1;
                return false;
            }
        }
        self.last_emitted.insert(key, now);
        self.emitted += 1;
        true
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
