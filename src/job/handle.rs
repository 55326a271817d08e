use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GridError;

/// Identity of a job: the cluster job number plus an optional array task index.
///
/// The textual form is `"<job>"` or `"<job>.<task>"`, which is also how handles
/// are keyed in the accounting store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobHandle {
    job: u64,
    task: Option<u32>,
}

impl JobHandle {
    pub fn new(job: u64) -> Self {
        Self { job, task: None }
    }

    pub fn with_task(job: u64, task: u32) -> Self {
        Self {
            job,
            task: Some(task),
        }
    }

    /// Grid Engine reports task 0 for jobs that are not array tasks.
    pub fn from_parts(job: u64, task: u32) -> Self {
        if task == 0 {
            Self::new(job)
        } else {
            Self::with_task(job, task)
        }
    }

    pub fn job(&self) -> u64 {
        self.job
    }

    pub fn task(&self) -> Option<u32> {
        self.task
    }

    /// The same job without its task qualifier.
    pub fn job_only(&self) -> Self {
        Self::new(self.job)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task {
            Some(task) => write!(f, "{}.{}", self.job, task),
            None => write!(f, "{}", self.job),
        }
    }
}

impl FromStr for JobHandle {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || GridError::InvalidRequest(format!("invalid job identifier '{}'", s));

        match s.split_once('.') {
            Some((job, task)) => {
                let job = job.parse().map_err(|_| invalid())?;
                let task = task.parse().map_err(|_| invalid())?;
                Ok(Self::with_task(job, task))
            }
            None => Ok(Self::new(s.parse().map_err(|_| invalid())?)),
        }
    }
}

impl TryFrom<String> for JobHandle {
    type Error = GridError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobHandle> for String {
    fn from(handle: JobHandle) -> Self {
        handle.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_task_qualified_ids() {
        assert_eq!("42".parse::<JobHandle>().unwrap(), JobHandle::new(42));
        assert_eq!(
            "42.7".parse::<JobHandle>().unwrap(),
            JobHandle::with_task(42, 7)
        );
        assert_eq!(" 9 ".parse::<JobHandle>().unwrap(), JobHandle::new(9));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "abc", "1.", ".3", "1.2.3", "-5"] {
            assert!(
                matches!(bad.parse::<JobHandle>(), Err(GridError::InvalidRequest(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn display_matches_store_key() {
        assert_eq!(JobHandle::new(100).to_string(), "100");
        assert_eq!(JobHandle::with_task(100, 3).to_string(), "100.3");
        assert_eq!(JobHandle::from_parts(100, 0), JobHandle::new(100));
        assert_eq!(JobHandle::with_task(100, 3).job_only(), JobHandle::new(100));
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&JobHandle::with_task(5, 2)).unwrap();
        assert_eq!(json, "\"5.2\"");
        let back: JobHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobHandle::with_task(5, 2));
    }
}
