use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobHandle;

/// Exit status reported for jobs that were deleted rather than finishing on
/// their own. No accounting data is expected for them.
pub const KILLED_EXIT_STATUS: i32 = -88;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Queued,
    QueuedWithError,
    Running,
    Finished,
    Deleted,
    NotFound,
    /// The state could not be determined because the accounting fallback failed.
    Unknown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Queued => write!(f, "queued"),
            LifecycleState::QueuedWithError => write!(f, "queued_with_error"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Finished => write!(f, "finished"),
            LifecycleState::Deleted => write!(f, "deleted"),
            LifecycleState::NotFound => write!(f, "not_found"),
            LifecycleState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Durable fact that a job finished. Written at most once per handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedRecord {
    pub handle: JobHandle,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_status: i32,
}

impl FinishedRecord {
    pub fn was_killed(&self) -> bool {
        self.exit_status == KILLED_EXIT_STATUS
    }
}

/// Normalized lifecycle event produced by the event translator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        handle: JobHandle,
        /// Scheduler-side queue error tag (e.g. `Eqw`).
        error: Option<String>,
    },
    Running {
        handle: JobHandle,
    },
    Finished {
        handle: JobHandle,
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
        exit_status: i32,
    },
}

impl JobEvent {
    pub fn handle(&self) -> JobHandle {
        match self {
            JobEvent::Queued { handle, .. }
            | JobEvent::Running { handle }
            | JobEvent::Finished { handle, .. } => *handle,
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self {
            JobEvent::Queued { error: None, .. } => LifecycleState::Queued,
            JobEvent::Queued { error: Some(_), .. } => LifecycleState::QueuedWithError,
            JobEvent::Running { .. } => LifecycleState::Running,
            JobEvent::Finished { .. } => LifecycleState::Finished,
        }
    }

    /// The durable record for a terminal event; `None` for non-terminal ones.
    pub fn finished_record(&self) -> Option<FinishedRecord> {
        match self {
            JobEvent::Finished {
                handle,
                start_time,
                end_time,
                exit_status,
            } => Some(FinishedRecord {
                handle: *handle,
                start_time: start_time.unwrap_or(*end_time),
                end_time: *end_time,
                exit_status: *exit_status,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn finished_event_without_start_uses_end() {
        let end = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let event = JobEvent::Finished {
            handle: JobHandle::new(7),
            start_time: None,
            end_time: end,
            exit_status: KILLED_EXIT_STATUS,
        };
        let record = event.finished_record().unwrap();
        assert_eq!(record.start_time, end);
        assert!(record.was_killed());
        assert_eq!(event.state(), LifecycleState::Finished);
    }

    #[test]
    fn queued_error_tag_maps_to_queued_with_error() {
        let event = JobEvent::Queued {
            handle: JobHandle::with_task(3, 1),
            error: Some("Eqw".to_string()),
        };
        assert_eq!(event.state(), LifecycleState::QueuedWithError);
        assert!(event.finished_record().is_none());
    }
}
