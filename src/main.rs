// src/main.rs
//! MCP Orchestrator
//!
//! Runs the orchestration core with the built-in `command` handler.
//!
//! ```text
//! mcp-orchestrator                 # serve until Ctrl+C
//! mcp-orchestrator workflow.yaml   # run one workflow, print its report
//! ```

use anyhow::{Context, Result};
use mcp_orchestrator::observability::{init_metrics, init_tracing};
use mcp_orchestrator::orchestrator::{Orchestrator, WorkflowDefinition};
use mcp_orchestrator::runtime::CommandHandler;
use mcp_orchestrator::utils::config::OrchestratorConfig;
use mcp_orchestrator::BuildInfo;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = OrchestratorConfig::load().context("failed to load configuration")?;

    init_tracing(&config.logging)?;
    init_metrics(config.metrics_addr)?;

    let build = BuildInfo::current();
    info!("Starting MCP Orchestrator v{} ({})", build.version, build.git_hash);
    info!("Configuration loaded: {:?}", config);

    let orchestrator = Orchestrator::start(config)?;
    orchestrator.register_handler("command", Arc::new(CommandHandler::new()));
    let monitor = orchestrator.start_monitor();

    let exit = match std::env::args().nth(1) {
        Some(path) => run_workflow(&orchestrator, &path).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to install Ctrl+C handler")?;
            info!("Received shutdown signal, cleaning up...");
            Ok(())
        }
    };

    monitor.stop().await;
    orchestrator.shutdown().await;

    if let Err(e) = &exit {
        error!("Orchestrator error: {:#}", e);
    }
    exit
}

async fn run_workflow(orchestrator: &Orchestrator, path: &str) -> Result<()> {
    let workflow = WorkflowDefinition::from_file(path)
        .await?
        .into_workflow(&orchestrator.config().workflow)?;

    let report = orchestrator.execute_workflow(workflow).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success {
        anyhow::bail!("workflow '{}' failed", report.name);
    }
    Ok(())
}
