use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{GridError, Result};

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs cluster commands (`qsub`, `qdel`).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` (program first) with `env` added to the inherited environment.
    async fn run(&self, argv: &[String], env: &BTreeMap<String, String>) -> Result<CommandOutput>;
}

/// Spawns real processes. Children never outlive the call: stdin is closed,
/// output is piped, and a child still running at the timeout is killed.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], env: &BTreeMap<String, String>) -> Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| GridError::InvalidRequest("empty command line".to_string()))?;

        tracing::debug!(program = %program, args = ?args, "Running command");

        let child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the pending future drops the child, which kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(GridError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} timed out after {}ms", program, self.timeout.as_millis()),
            ))),
        }
    }
}
