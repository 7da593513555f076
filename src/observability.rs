// src/observability.rs
//! Logging and metrics setup
//!
//! Tracing goes through `tracing-subscriber`; `RUST_LOG` wins over the
//! configured level. Metrics are recorded with the `metrics` facade and
//! exposed by the Prometheus exporter when an address is configured.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{OrchestratorError, Result};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

static METRICS_INSTALLED: OnceCell<Option<SocketAddr>> = OnceCell::new();

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            OrchestratorError::config(format!("invalid log filter '{}': {}", config.level, e))
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| OrchestratorError::config(format!("tracing already initialized: {}", e)))
}

/// Install the Prometheus recorder, serving `/metrics` on `addr`.
///
/// Without an address the `metrics` macros stay no-ops. Calling this more
/// than once keeps the first recorder.
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };

    METRICS_INSTALLED
        .get_or_try_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map(|_| Some(addr))
                .map_err(|e| {
                    OrchestratorError::config(format!(
                        "failed to install metrics exporter on {}: {}",
                        addr, e
                    ))
                })
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        assert!(init_metrics(None).is_ok());
        assert!(METRICS_INSTALLED.get().is_none());
    }
}
