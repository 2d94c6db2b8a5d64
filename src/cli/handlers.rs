//! Built-in task handlers selectable from the command line.
//!
//! Handler behavior is chosen at registration time from a small fixed set
//! rather than by late-bound class loading: `--handler shell` runs the
//! payload's `command` field through the system shell, `--handler noop`
//! only logs the payload (useful for smoke-testing a deployment).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::task::Task;
use crate::worker::TaskHandler;

/// Resolves a handler name to an implementation.
///
/// Returns `None` for unknown names; the caller reports the valid set.
pub fn handler_for(name: &str) -> Option<Arc<dyn TaskHandler>> {
    match name {
        "shell" => Some(Arc::new(ShellHandler)),
        "noop" => Some(Arc::new(NoopHandler)),
        _ => None,
    }
}

/// Logs the payload and succeeds.
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn run(&self, task: &Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(task_id = %task.id, payload = %task.payload, "noop handler executed");
        Ok(())
    }
}

/// Runs the payload's `command` string through `sh -c`.
///
/// A missing `command` field or a non-zero exit status fails the task.
pub struct ShellHandler;

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn run(&self, task: &Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let command = task
            .payload
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or("payload has no string 'command' field")?;

        debug!(task_id = %task.id, command, "running shell command");
        // An abandoned execution must not leave the child running.
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(format!("command exited with {status}").into());
        }
        Ok(())
    }
}
