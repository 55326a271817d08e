use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::accounting::pool::{ConnectionPool, SqliteManager};
use crate::error::Result;
use crate::job::{FinishedRecord, JobHandle};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS finished_jobs (
    handle      TEXT PRIMARY KEY,
    job         INTEGER NOT NULL,
    task        INTEGER,
    start_time  INTEGER NOT NULL,
    end_time    INTEGER NOT NULL,
    exit_status INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS finished_jobs_end_time ON finished_jobs (end_time);
CREATE TABLE IF NOT EXISTS sync_parameters (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    last_sync     INTEGER,
    last_file_len INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO sync_parameters (id, last_sync, last_file_len) VALUES (1, NULL, 0);
";

/// Progress of the accounting synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCursor {
    pub last_sync: Option<DateTime<Utc>>,
    /// Byte length of the accounting file at the last successful advance.
    pub file_len: u64,
}

/// Durable finished-job facts plus the synchronizer cursor, behind a pool of
/// SQLite connections. Times are stored as epoch milliseconds.
#[derive(Clone)]
pub struct FinishedStore {
    pool: ConnectionPool<SqliteManager>,
}

impl FinishedStore {
    pub async fn open(path: &Path, pool_size: usize, reconnect_delay: Duration) -> Result<Self> {
        let pool = ConnectionPool::new(
            "accounting",
            SqliteManager::new(path),
            pool_size,
            reconnect_delay,
        )?;
        pool.with_connection(|conn| Ok(conn.execute_batch(SCHEMA)?))
            .await?;
        tracing::info!(path = %path.display(), "Finished-job store ready");
        Ok(Self { pool })
    }

    /// Insert a record unless one already exists for the handle. Returns
    /// whether a row was written.
    pub async fn persist(&self, record: &FinishedRecord) -> Result<bool> {
        self.pool
            .with_connection(|conn| Ok(insert(conn, record)? > 0))
            .await
    }

    /// Insert many records in one transaction. Returns how many were new.
    pub async fn persist_batch(&self, records: &[FinishedRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.pool
            .with_connection(|conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                for record in records {
                    written += insert(&tx, record)?;
                }
                tx.commit()?;
                Ok(written)
            })
            .await
    }

    pub async fn get(&self, handle: &JobHandle) -> Result<Option<FinishedRecord>> {
        let key = handle.to_string();
        self.pool
            .with_connection(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT job, task, start_time, end_time, exit_status
                         FROM finished_jobs WHERE handle = ?1",
                        params![key],
                        from_row,
                    )
                    .optional()?)
            })
            .await
    }

    /// Delete records that ended before `cutoff`. Returns the number removed.
    pub async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = cutoff.timestamp_millis();
        self.pool
            .with_connection(|conn| {
                Ok(conn.execute(
                    "DELETE FROM finished_jobs WHERE end_time < ?1",
                    params![cutoff],
                )?)
            })
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.pool
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM finished_jobs", [], |row| {
                    row.get::<_, i64>(0)
                })? as u64)
            })
            .await
    }

    pub async fn load_cursor(&self) -> Result<SyncCursor> {
        self.pool
            .with_connection(|conn| {
                let (last_sync, file_len) = conn.query_row(
                    "SELECT last_sync, last_file_len FROM sync_parameters WHERE id = 1",
                    [],
                    |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, i64>(1)?)),
                )?;
                Ok(SyncCursor {
                    last_sync: last_sync.and_then(DateTime::<Utc>::from_timestamp_millis),
                    file_len: file_len.max(0) as u64,
                })
            })
            .await
    }

    pub async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let last_sync = cursor.last_sync.map(|t| t.timestamp_millis());
        let file_len = cursor.file_len as i64;
        self.pool
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE sync_parameters SET last_sync = ?1, last_file_len = ?2 WHERE id = 1",
                    params![last_sync, file_len],
                )?;
                Ok(())
            })
            .await
    }

    /// Forget the remembered file length after a rotation was consumed.
    pub async fn reset_cursor_len(&self) -> Result<()> {
        self.pool
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE sync_parameters SET last_file_len = 0 WHERE id = 1",
                    [],
                )?;
                Ok(())
            })
            .await
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

fn insert(conn: &Connection, record: &FinishedRecord) -> Result<usize> {
    Ok(conn.execute(
        "INSERT OR IGNORE INTO finished_jobs (handle, job, task, start_time, end_time, exit_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.handle.to_string(),
            record.handle.job() as i64,
            record.handle.task(),
            record.start_time.timestamp_millis(),
            record.end_time.timestamp_millis(),
            record.exit_status,
        ],
    )?)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<FinishedRecord> {
    let job: i64 = row.get(0)?;
    let task: Option<u32> = row.get(1)?;
    let millis = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        let value: i64 = row.get(idx)?;
        Ok(DateTime::<Utc>::from_timestamp_millis(value).unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    };
    Ok(FinishedRecord {
        handle: JobHandle::from_parts(job as u64, task.unwrap_or(0)),
        start_time: millis(2)?,
        end_time: millis(3)?,
        exit_status: row.get(4)?,
    })
}
