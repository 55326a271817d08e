use std::path::PathBuf;
use std::time::Duration;

use rusqlite::params;

use crate::accounting::pool::{ConnectionPool, SqliteManager};
use crate::accounting::record::epoch;
use crate::config::AccountingBackendConfig;
use crate::error::{GridError, Result};
use crate::job::{FinishedRecord, JobHandle};

const BY_JOB: &str = "
SELECT ju_start_time, ju_end_time, ju_exit_status
FROM sge_job JOIN sge_job_usage ON j_id = ju_parent
WHERE j_job_number = ?1
ORDER BY ju_end_time DESC";

const BY_TASK: &str = "
SELECT ju_start_time, ju_end_time, ju_exit_status
FROM sge_job JOIN sge_job_usage ON j_id = ju_parent
WHERE j_job_number = ?1 AND j_task_number = ?2
ORDER BY ju_end_time DESC";

/// Read-only view of an exported ARCo accounting database (`sge_job` and
/// `sge_job_usage` tables, times in epoch seconds).
#[derive(Clone)]
pub struct ArcoBackend {
    pool: ConnectionPool<SqliteManager>,
    use_array_jobs: bool,
}

impl ArcoBackend {
    pub fn open(config: &AccountingBackendConfig, use_array_jobs: bool) -> Result<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            GridError::InvalidArgument("external accounting requires a database URL".to_string())
        })?;
        let path = database_path(url);

        if config.username.is_some() || config.password.is_some() {
            tracing::debug!("SQLite accounting backend ignores username and password");
        }

        let pool = ConnectionPool::new(
            "arco",
            SqliteManager::read_only(&path),
            config.pool_size,
            Duration::from_millis(config.reconnect_delay_ms),
        )?;
        tracing::info!(path = %path.display(), "External accounting backend connected");

        Ok(Self {
            pool,
            use_array_jobs,
        })
    }

    /// The newest usage row with real start and end times.
    pub async fn find(&self, handle: &JobHandle) -> Result<Option<FinishedRecord>> {
        let job = handle.job() as i64;
        let task = handle.task().filter(|_| self.use_array_jobs);

        let rows: Vec<(i64, i64, i32)> = self
            .pool
            .with_connection(|conn| match task {
                Some(task) => {
                    let mut stmt = conn.prepare_cached(BY_TASK)?;
                    let rows = stmt
                        .query_map(params![job, task], usage_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                }
                None => {
                    let mut stmt = conn.prepare_cached(BY_JOB)?;
                    let rows = stmt
                        .query_map(params![job], usage_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                }
            })
            .await?;

        Ok(rows
            .into_iter()
            .find(|(start, end, _)| *start > 0 && *end > 0)
            .map(|(start, end, exit_status)| FinishedRecord {
                handle: *handle,
                start_time: epoch(start),
                end_time: epoch(end),
                exit_status,
            }))
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

fn usage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, i32)> {
    Ok((
        row.get::<_, Option<i64>>(0)?.unwrap_or(0),
        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        row.get(2)?,
    ))
}

fn database_path(url: &str) -> PathBuf {
    let url = url.trim();
    PathBuf::from(
        url.strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_prefixes_are_stripped() {
        assert_eq!(database_path("sqlite:///var/arco.db"), PathBuf::from("/var/arco.db"));
        assert_eq!(database_path("sqlite:arco.db"), PathBuf::from("arco.db"));
        assert_eq!(database_path(" /tmp/a.db "), PathBuf::from("/tmp/a.db"));
    }

    #[test]
    fn missing_url_is_rejected() {
        let result = ArcoBackend::open(&AccountingBackendConfig::default(), false);
        assert!(matches!(result, Err(GridError::InvalidArgument(_))));
    }
}
