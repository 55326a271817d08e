use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SubmitConfig;
use crate::error::{GridError, Result};
use crate::master::LivenessMonitor;
use crate::submit::request::Submission;
use crate::submit::runner::CommandRunner;

/// stderr fragments meaning qsub could not reach the qmaster.
const CONNECTIVITY_ERRORS: [&str; 2] = ["can't connect to service", "got read error"];

const MISSING_JOB: &str = "does not exist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SubmitConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SubmitConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based). Doubling starts with the
    /// fourth attempt: 2s, 2s, 4s, 8s for the defaults.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = attempt.saturating_sub(3).min(16);
        self.initial_backoff.saturating_mul(1 << doublings)
    }
}

/// Extract the identifier following `prefix` on the first matching line.
pub fn parse_job_id(output: &str, prefix: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix(prefix))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

/// Submits and deletes jobs through the cluster command-line tools.
pub struct SubmissionPipeline {
    runner: Arc<dyn CommandRunner>,
    monitor: Arc<LivenessMonitor>,
    policy: RetryPolicy,
    config: SubmitConfig,
}

impl SubmissionPipeline {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        monitor: Arc<LivenessMonitor>,
        config: SubmitConfig,
    ) -> Self {
        Self {
            runner,
            monitor,
            policy: RetryPolicy::from_config(&config),
            config,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Submit with retries. Waiting for a down qmaster does not use up an
    /// attempt. Returns the identifier printed by qsub.
    pub async fn submit(&self, submission: &Submission) -> Result<String> {
        let argv = submission.argv(&self.config);
        let prefix = submission.success_prefix();
        let mut failures = String::new();
        let mut attempt = 1;

        while attempt <= self.policy.max_attempts {
            if !self.monitor.is_alive() {
                tracing::info!(attempt, "Qmaster is down, waiting before submitting");
                self.monitor.wait_until_alive().await;
                continue;
            }

            match self.attempt(&argv, &submission.env, prefix).await {
                Ok(job_id) => {
                    tracing::info!(job_id = %job_id, attempt, user = %submission.user, "Job submitted");
                    return Ok(job_id);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Submission attempt failed");
                    failures.push_str(&format!("Attempt {}: {}\n", attempt, e));
                    attempt += 1;
                    if attempt <= self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_before(attempt)).await;
                    }
                }
            }
        }

        Err(GridError::SubmissionFailed {
            attempts: self.policy.max_attempts,
            message: failures,
        })
    }

    async fn attempt(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        prefix: &str,
    ) -> Result<String> {
        let output = self.runner.run(argv, env).await?;

        if CONNECTIVITY_ERRORS.iter().any(|e| output.stderr.contains(e)) {
            // Refresh liveness so the next attempt waits for the qmaster.
            self.monitor.probe().await;
            return Err(GridError::TransientSubmission(format!(
                "qmaster unreachable: {}",
                output.stderr.trim()
            )));
        }

        parse_job_id(&output.stdout, prefix).ok_or_else(|| {
            let mut reason = String::new();
            if !output.stderr.trim().is_empty() {
                reason.push_str(output.stderr.trim());
                reason.push('\n');
            }
            reason.push_str("unexpected output: ");
            reason.push_str(output.stdout.trim());
            GridError::TransientSubmission(reason)
        })
    }

    /// Delete a job, optionally as `user`. A job that no longer exists counts
    /// as deleted.
    pub async fn kill_job(&self, job_id: &str, user: Option<&str>, force: bool) -> Result<()> {
        let mut argv = Vec::new();
        if let Some(user) = user.filter(|u| !u.trim().is_empty()) {
            argv.push(self.config.sudo_program.clone());
            argv.push("-u".to_string());
            argv.push(user.to_string());
        }
        argv.push(self.config.qdel_program.clone());
        if force {
            argv.push("-f".to_string());
        }
        argv.push(job_id.to_string());

        let output = self.runner.run(&argv, &BTreeMap::new()).await?;
        if output.stdout.contains(MISSING_JOB) || output.stderr.contains(MISSING_JOB) {
            tracing::debug!(job_id, "Job already gone");
            return Ok(());
        }
        if !output.success() {
            tracing::warn!(job_id, stderr = %output.stderr.trim(), "qdel failed");
            return Err(GridError::CommandFailed(format!(
                "qdel {}: {}",
                job_id,
                output.stderr.trim()
            )));
        }

        tracing::info!(job_id, force, "Job deleted");
        Ok(())
    }
}
