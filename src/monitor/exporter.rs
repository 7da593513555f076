// src/monitor/exporter.rs
//! Export metrics snapshots as JSON
//!
//! The snapshot is rendered as pretty JSON and written to a sibling temp
//! file first, then renamed over the target so readers never see a partial
//! document.

use crate::monitor::sampler::MetricsSnapshot;
use crate::utils::errors::{OrchestratorError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes metrics snapshots to a file
pub struct MetricsExporter {
    path: PathBuf,
}

impl MetricsExporter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render a snapshot to a JSON string
    pub fn render(snapshot: &MetricsSnapshot) -> Result<String> {
        serde_json::to_string_pretty(snapshot).map_err(|e| OrchestratorError::ExportFailed {
            message: format!("JSON serialization error: {}", e),
        })
    }

    /// Write a snapshot to the export path
    pub async fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let json = Self::render(snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(export_error)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json.as_bytes()).await.map_err(export_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(export_error)?;

        debug!("Exported metrics snapshot to {:?} ({} bytes)", self.path, json.len());
        Ok(())
    }
}

fn export_error(e: std::io::Error) -> OrchestratorError {
    OrchestratorError::ExportFailed {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::sampler::{MetricsSource, PerformanceMonitor};
    use crate::resource::GateSnapshot;
    use crate::utils::config::MonitorConfig;

    struct IdleSource;

    impl MetricsSource for IdleSource {
        fn queue_depth(&self) -> usize {
            2
        }

        fn active_workers(&self) -> usize {
            1
        }

        fn worker_count(&self) -> usize {
            3
        }

        fn resources(&self) -> Vec<GateSnapshot> {
            vec![]
        }
    }

    #[tokio::test]
    async fn test_export_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics").join("snapshot.json");

        let monitor = PerformanceMonitor::new(MonitorConfig {
            export_path: Some(path.clone()),
            ..Default::default()
        });
        monitor.sample_now(&IdleSource).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(json["latest"]["queue_depth"], 2);
        assert_eq!(json["latest"]["active_workers"], 1);
        assert!(json["latest"]["timestamp"].is_string());
        assert!(json["latest"]["resources"].is_array());
        assert_eq!(json["retained_samples"], 1);

        // No temp file left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_export_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let monitor = PerformanceMonitor::new(MonitorConfig {
            export_path: Some(path.clone()),
            ..Default::default()
        });

        monitor.sample_now(&IdleSource).await;
        monitor.sample_now(&IdleSource).await;

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["retained_samples"], 2);
    }
}
