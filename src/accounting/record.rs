use chrono::{DateTime, TimeZone, Utc};

use crate::error::{GridError, Result};
use crate::job::{FinishedRecord, JobHandle};

// Zero-based positions of the fields we read from an accounting line.
const QNAME: usize = 0;
const JOB_NUMBER: usize = 5;
const START_TIME: usize = 9;
const END_TIME: usize = 10;
const EXIT_STATUS: usize = 12;
const RU_UTIME: usize = 14;
const RU_STIME: usize = 15;
const TASK_NUMBER: usize = 35;

/// One line of the Grid Engine accounting log.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountingRecord {
    pub queue: String,
    pub job_number: u64,
    /// Seconds since the epoch.
    pub start_time: i64,
    pub end_time: i64,
    pub exit_status: i32,
    pub user_cpu_secs: f64,
    pub system_cpu_secs: f64,
    pub task_number: u32,
}

impl AccountingRecord {
    /// Parse a line. Returns `Ok(None)` for comments and blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() <= TASK_NUMBER {
            return Err(GridError::Parse(format!(
                "accounting line has {} fields, expected at least {}",
                fields.len(),
                TASK_NUMBER + 1
            )));
        }

        let mut record = AccountingRecord {
            queue: fields[QNAME].to_string(),
            job_number: field(&fields, JOB_NUMBER, "job_number")?,
            start_time: field(&fields, START_TIME, "start_time")?,
            end_time: field(&fields, END_TIME, "end_time")?,
            exit_status: field(&fields, EXIT_STATUS, "exit_status")?,
            user_cpu_secs: field(&fields, RU_UTIME, "ru_utime")?,
            system_cpu_secs: field(&fields, RU_STIME, "ru_stime")?,
            task_number: field(&fields, TASK_NUMBER, "task_number")?,
        };

        for (name, secs) in [
            ("ru_utime", record.user_cpu_secs),
            ("ru_stime", record.system_cpu_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(GridError::Parse(format!("bad {} '{}'", name, secs)));
            }
        }

        // Very short jobs are logged with equal start and end seconds.
        if record.start_time == record.end_time {
            record.end_time = record.end_time.saturating_add(record.user_cpu_secs as i64);
        }
        if Utc.timestamp_opt(record.end_time, 0).single().is_none() {
            return Err(GridError::Parse(format!(
                "end_time {} out of range",
                record.end_time
            )));
        }

        Ok(Some(record))
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle::from_parts(self.job_number, self.task_number)
    }

    pub fn end_datetime(&self) -> DateTime<Utc> {
        epoch(self.end_time)
    }

    pub fn to_finished(&self) -> FinishedRecord {
        FinishedRecord {
            handle: self.handle(),
            start_time: epoch(self.start_time),
            end_time: self.end_datetime(),
            exit_status: self.exit_status,
        }
    }
}

fn field<T: std::str::FromStr>(fields: &[&str], index: usize, name: &str) -> Result<T> {
    fields[index]
        .trim()
        .parse()
        .map_err(|_| GridError::Parse(format!("bad {} '{}'", name, fields[index])))
}

pub(crate) fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
