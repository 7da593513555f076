// src/runtime/command.rs
//! Command task handler
//!
//! Runs an external program as a task. The payload selects the program:
//!
//! ```json
//! { "command": "git", "args": ["status", "--short"], "cwd": "/repo", "env": {"GIT_PAGER": "cat"} }
//! { "shell": "cargo fmt --check && echo ok" }
//! ```
//!
//! The child is spawned with `kill_on_drop`, so a timed out or cancelled
//! task never leaves a process behind. When the task has a target resource
//! the whole run holds a permit on it.

use crate::runtime::handler::{TaskContext, TaskHandler};
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Stderr kept in error messages
const STDERR_TAIL: usize = 2_000;

#[derive(Debug, Clone, Deserialize)]
struct CommandSpec {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    /// Run through `sh -c` instead of `command`/`args`
    shell: Option<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Handler that executes the command described by the task payload
#[derive(Default)]
pub struct CommandHandler {
    /// Resolved executable paths
    executable_paths: DashMap<String, PathBuf>,
}

impl CommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an executable in PATH, caching the result
    fn find_executable(&self, program: &str) -> Result<PathBuf> {
        if let Some(path) = self.executable_paths.get(program) {
            return Ok(path.clone());
        }

        match which::which(program) {
            Ok(path) => {
                info!("Found {} at {:?}", program, path);
                self.executable_paths.insert(program.to_string(), path.clone());
                Ok(path)
            }
            Err(e) => Err(OrchestratorError::handler(format!(
                "executable '{}' not found in PATH: {}",
                program, e
            ))),
        }
    }

    fn build(&self, spec: &CommandSpec) -> Result<Command> {
        let mut command = match (&spec.shell, &spec.command) {
            (Some(script), _) => {
                let mut command = Command::new(self.find_executable("sh")?);
                command.arg("-c").arg(script);
                command
            }
            (None, Some(program)) => {
                let mut command = Command::new(self.find_executable(program)?);
                command.args(&spec.args);
                command
            }
            (None, None) => {
                return Err(OrchestratorError::handler(
                    "payload needs either 'command' or 'shell'",
                ))
            }
        };

        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(command)
    }

    async fn run(&self, ctx: &TaskContext, spec: &CommandSpec) -> Result<Value> {
        let mut command = self.build(spec)?;
        debug!("Task {} spawning {:?}", ctx.task_id(), command.as_std().get_program());

        let child = command
            .spawn()
            .map_err(|e| OrchestratorError::handler(format!("failed to spawn process: {e}")))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                OrchestratorError::handler(format!("failed to wait for process: {e}"))
            })?,
            // Dropping the child future kills the process
            _ = ctx.cancelled() => return Err(OrchestratorError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if !output.status.success() {
            return Err(OrchestratorError::handler(format!(
                "command exited with {}: {}",
                exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                tail(&stderr, STDERR_TAIL)
            )));
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<Value> {
        let spec: CommandSpec = serde_json::from_value(ctx.payload().clone())
            .map_err(|e| OrchestratorError::handler(format!("invalid command payload: {e}")))?;

        if ctx.target_resource().is_some() {
            ctx.with_resource(|| self.run(&ctx, &spec)).await
        } else {
            self.run(&ctx, &spec).await
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    let trimmed = s.trim_end();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
