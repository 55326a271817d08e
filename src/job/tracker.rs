use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::job::filter::JobFilter;
use crate::job::state::{JobEvent, LifecycleState};
use crate::job::JobHandle;

const DEFAULT_MAX_JOBS: usize = 100_000;

/// A job the event stream (or a submission) reported as active.
#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub handle: JobHandle,
    pub state: LifecycleState,
    pub name: Option<String>,
    pub resources: HashMap<String, String>,
    pub queue_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of looking a handle up among the active jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The job is tracked with this state.
    Active(LifecycleState),
    /// A lower-numbered task than the newest active task of the same job; tasks
    /// start in order, so this one already completed.
    InferredFinished,
    /// A higher-numbered task than every active task of the same job. Only
    /// accounting can tell whether it finished or is still pending.
    NeedsAccounting,
    /// Nothing is known about the job.
    Untracked,
}

/// In-memory view of active jobs, fed by translated events.
#[derive(Debug)]
pub struct JobTracker {
    jobs: HashMap<JobHandle, TrackedJob>,
    max_jobs: usize,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    /// Track a freshly submitted job as queued. Returns false at capacity.
    pub fn register_submitted(
        &mut self,
        handle: JobHandle,
        name: Option<String>,
        resources: HashMap<String, String>,
    ) -> bool {
        if self.jobs.len() >= self.max_jobs && !self.jobs.contains_key(&handle) {
            return false;
        }
        self.jobs.insert(
            handle,
            TrackedJob {
                handle,
                state: LifecycleState::Queued,
                name,
                resources,
                queue_error: None,
                updated_at: Utc::now(),
            },
        );
        true
    }

    /// Apply a translated event. Returns false when the event was dropped
    /// because the tracker is full.
    pub fn apply(&mut self, event: &JobEvent) -> bool {
        let handle = event.handle();

        if let JobEvent::Finished { .. } = event {
            self.forget(&handle);
            return true;
        }

        let queue_error = match event {
            JobEvent::Queued { error, .. } => error.clone(),
            _ => None,
        };

        // Task events supersede the job-level entry created at submission.
        let inherited = if handle.task().is_some() {
            self.jobs.remove(&handle.job_only())
        } else {
            None
        };

        if !self.jobs.contains_key(&handle) && self.jobs.len() >= self.max_jobs {
            tracing::warn!(job_id = %handle, "Job tracker at capacity, event dropped");
            return false;
        }

        let entry = self.jobs.entry(handle).or_insert_with(|| TrackedJob {
            handle,
            state: event.state(),
            name: inherited.as_ref().and_then(|j| j.name.clone()),
            resources: inherited.map(|j| j.resources).unwrap_or_default(),
            queue_error: None,
            updated_at: Utc::now(),
        });
        entry.state = event.state();
        entry.queue_error = queue_error;
        entry.updated_at = Utc::now();
        true
    }

    /// Stop tracking a job that is known to be finished. A job-level handle
    /// ends every task of the job.
    pub fn forget(&mut self, handle: &JobHandle) {
        match handle.task() {
            None => self.jobs.retain(|h, _| h.job() != handle.job()),
            Some(_) => {
                self.jobs.remove(handle);
            }
        }
    }

    pub fn get(&self, handle: &JobHandle) -> Option<&TrackedJob> {
        self.jobs.get(handle)
    }

    /// Active task numbers of a job, ascending.
    pub fn tasks_of(&self, job: u64) -> Vec<u32> {
        let mut tasks: Vec<u32> = self
            .jobs
            .keys()
            .filter(|h| h.job() == job)
            .filter_map(|h| h.task())
            .collect();
        tasks.sort_unstable();
        tasks
    }

    pub fn lookup(&self, handle: &JobHandle) -> Lookup {
        if let Some(job) = self.jobs.get(handle) {
            return Lookup::Active(job.state);
        }

        let tasks: Vec<&TrackedJob> = self
            .jobs
            .values()
            .filter(|j| j.handle.job() == handle.job() && j.handle.task().is_some())
            .collect();
        if tasks.is_empty() {
            // Tasks of an array that has not reported any task yet share the
            // state of its submission entry.
            return match (handle.task(), self.jobs.get(&handle.job_only())) {
                (Some(_), Some(job)) => Lookup::Active(job.state),
                _ => Lookup::Untracked,
            };
        }

        match handle.task() {
            None => {
                let state = if tasks.iter().any(|j| j.state == LifecycleState::Running) {
                    LifecycleState::Running
                } else if tasks
                    .iter()
                    .any(|j| j.state == LifecycleState::QueuedWithError)
                {
                    LifecycleState::QueuedWithError
                } else {
                    LifecycleState::Queued
                };
                Lookup::Active(state)
            }
            Some(task) => {
                let max_task = tasks.iter().filter_map(|j| j.handle.task()).max();
                match max_task {
                    Some(max) if task <= max => Lookup::InferredFinished,
                    _ => Lookup::NeedsAccounting,
                }
            }
        }
    }

    /// All tracked jobs matching the filter, ordered by handle.
    pub fn filtered(&self, filter: &JobFilter) -> Vec<&TrackedJob> {
        let mut jobs: Vec<&TrackedJob> = self
            .jobs
            .values()
            .filter(|j| filter.matches(j.name.as_deref(), &j.resources))
            .collect();
        jobs.sort_by_key(|j| j.handle);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
