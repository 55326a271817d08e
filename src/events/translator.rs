use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::accounting::record::epoch;
use crate::error::{GridError, Result};
use crate::job::{JobEvent, JobHandle, KILLED_EXIT_STATUS};
use crate::master::LivenessMonitor;

// Grid Engine job state bits.
pub const QUEUED: u32 = 0x40;
pub const RUNNING: u32 = 0x80;
pub const DELETED: u32 = 0x400;
pub const WAITING: u32 = 0x800;
pub const ERROR: u32 = 0x8000;

/// Tag attached to queued tasks stuck in the error state.
pub const QUEUED_ERROR_TAG: &str = "Eqw";

/// Raw notification as delivered by the cluster. Timestamps are epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    TaskStateChange {
        job_id: u64,
        #[serde(default)]
        task_id: u32,
        timestamp: i64,
        state: u32,
    },
    JobDeleted {
        job_id: u64,
        timestamp: i64,
    },
    FinalUsage {
        job_id: u64,
        #[serde(default)]
        task_id: u32,
        usage: HashMap<String, f64>,
    },
    MasterShutdown,
}

/// Map a notification onto the normalized event stream. Returns `None` for
/// notifications that carry no job event.
pub fn translate(notification: &Notification) -> Option<JobEvent> {
    match notification {
        Notification::TaskStateChange {
            job_id,
            task_id,
            timestamp,
            state,
        } => {
            let handle = JobHandle::from_parts(*job_id, *task_id);
            match *state {
                s if s == RUNNING | DELETED => Some(killed(*job_id, *timestamp)),
                RUNNING => Some(JobEvent::Running { handle }),
                s if s == QUEUED || s == QUEUED | WAITING => Some(JobEvent::Queued {
                    handle,
                    error: None,
                }),
                s if s == QUEUED | WAITING | ERROR => Some(JobEvent::Queued {
                    handle,
                    error: Some(QUEUED_ERROR_TAG.to_string()),
                }),
                other => {
                    tracing::warn!(job_id = %handle, state = %format!("{:#x}", other), "Unhandled job state");
                    None
                }
            }
        }
        Notification::JobDeleted { job_id, timestamp } => Some(killed(*job_id, *timestamp)),
        Notification::FinalUsage {
            job_id,
            task_id,
            usage,
        } => {
            let handle = JobHandle::from_parts(*job_id, *task_id);
            let value = |key: &str| usage.get(key).copied();
            match (value("exit_status"), value("start_time"), value("end_time")) {
                (Some(_), Some(_), Some(end)) if end.is_nan() || end <= 0.0 => {
                    tracing::warn!(job_id = %handle, end_time = end, "Final usage has no end time");
                    None
                }
                (Some(exit), Some(start), Some(end)) => Some(JobEvent::Finished {
                    handle,
                    start_time: Some(epoch(start as i64)),
                    end_time: epoch(end as i64),
                    exit_status: exit as i32,
                }),
                _ => {
                    tracing::warn!(job_id = %handle, "Final usage is missing exit status or times");
                    None
                }
            }
        }
        Notification::MasterShutdown => None,
    }
}

fn killed(job_id: u64, timestamp_ms: i64) -> JobEvent {
    JobEvent::Finished {
        handle: JobHandle::new(job_id),
        start_time: None,
        end_time: millis(timestamp_ms),
        exit_status: KILLED_EXIT_STATUS,
    }
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Converts notifications into [`JobEvent`]s and forwards them without
/// blocking.
#[derive(Clone)]
pub struct EventTranslator {
    tx: mpsc::UnboundedSender<JobEvent>,
    monitor: Option<Arc<LivenessMonitor>>,
}

impl EventTranslator {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { tx, monitor: None }
    }

    /// Probe the master whenever it announces a shutdown.
    pub fn with_monitor(mut self, monitor: Arc<LivenessMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn handle(&self, notification: Notification) {
        if let Notification::MasterShutdown = notification {
            tracing::info!("Qmaster announced shutdown");
            if let Some(monitor) = &self.monitor {
                let monitor = monitor.clone();
                tokio::spawn(async move {
                    monitor.probe().await;
                });
            }
            return;
        }

        if let Some(event) = translate(&notification) {
            tracing::debug!(job_id = %event.handle(), state = %event.state(), "Job event");
            if self.tx.send(event).is_err() {
                tracing::warn!("Job event receiver dropped, event discarded");
            }
        }
    }

    /// Parse a JSON notification and handle it. Malformed payloads are logged
    /// and dropped.
    pub fn handle_raw(&self, raw: &str) -> Result<()> {
        match serde_json::from_str::<Notification>(raw) {
            Ok(notification) => {
                self.handle(notification);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed notification");
                Err(GridError::Parse(e.to_string()))
            }
        }
    }
}
