//! Incremental ingestion of the Grid Engine accounting log.
//!
//! Each pass either consumes the rotated predecessor (`<file>.0.gz`) once after
//! a rotation, or tails the live file until it shrinks or disappears. Records
//! whose end time falls inside the cutoff window are persisted into the
//! [`FinishedStore`]; the store's cursor remembers when the last records were
//! added and how long the file was at that point.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accounting::record::AccountingRecord;
use crate::accounting::store::{FinishedStore, SyncCursor};
use crate::config::SyncConfig;
use crate::error::{GridError, Result};
use crate::job::FinishedRecord;

const BATCH_SIZE: usize = 256;

/// How a single synchronization pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The rotated log was consumed; `records` new rows were written.
    Rotated { records: usize },
    /// The live file shrank or disappeared.
    Ended { records: usize },
    Cancelled { records: usize },
}

pub struct AccountingSynchronizer {
    store: FinishedStore,
    accounting_file: PathBuf,
    config: SyncConfig,
    /// Set once the rotated log was consumed; cleared when the cursor advances.
    parsed_rotated: bool,
    last_sweep: Instant,
}

impl AccountingSynchronizer {
    pub fn new(store: FinishedStore, accounting_file: PathBuf, config: SyncConfig) -> Self {
        Self {
            store,
            accounting_file,
            config,
            parsed_rotated: false,
            last_sweep: Instant::now(),
        }
    }

    pub fn rotated_file(&self) -> PathBuf {
        let mut name = self.accounting_file.as_os_str().to_owned();
        name.push(".0.gz");
        PathBuf::from(name)
    }

    /// Run passes until `shutdown` fires, then close the store's connections.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            file = %self.accounting_file.display(),
            "Accounting synchronizer started"
        );

        while !shutdown.is_cancelled() {
            match self.sync_pass(&shutdown).await {
                Ok(PassOutcome::Cancelled { .. }) => break,
                Ok(outcome) => tracing::debug!(?outcome, "Accounting pass finished"),
                Err(e) => tracing::warn!(error = %e, "Accounting pass failed"),
            }

            if let Err(e) = self.maybe_sweep(None).await {
                tracing::warn!(error = %e, "Finished-job sweep failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.store.close();
        tracing::info!("Accounting synchronizer stopped");
    }

    pub async fn sync_pass(&mut self, shutdown: &CancellationToken) -> Result<PassOutcome> {
        let cursor = self.store.load_cursor().await?;
        let current_len = file_len(&self.accounting_file).await?.unwrap_or(0);

        if (current_len < cursor.file_len || current_len == 0) && !self.parsed_rotated {
            let records = self.consume_rotated(&cursor, shutdown).await?;
            self.parsed_rotated = true;
            self.store.reset_cursor_len().await?;
            return Ok(PassOutcome::Rotated { records });
        }

        self.tail(cursor, shutdown).await
    }

    async fn consume_rotated(
        &self,
        cursor: &SyncCursor,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let rotated = self.rotated_file();
        if file_len(&rotated).await?.is_none() {
            tracing::debug!(file = %rotated.display(), "No rotated accounting log to parse");
            return Ok(0);
        }

        let records = self.ingest_compressed(&rotated, cursor, shutdown).await?;
        tracing::info!(
            file = %rotated.display(),
            records,
            "Parsed rotated accounting log"
        );
        Ok(records)
    }

    /// One-shot import of an accounting file, plain or gzip-compressed, using
    /// the current cutoff window. Does not move the cursor.
    pub async fn import(&self, path: &Path, shutdown: &CancellationToken) -> Result<usize> {
        let cursor = self.store.load_cursor().await?;
        let compressed = path.extension().is_some_and(|ext| ext == "gz");
        if compressed {
            self.ingest_compressed(path, &cursor, shutdown).await
        } else {
            self.ingest_whole(path, &cursor, shutdown).await
        }
    }

    /// Copy a gzip file into the work directory under a unique name,
    /// decompress it there and ingest the result. Both copies are removed.
    async fn ingest_compressed(
        &self,
        path: &Path,
        cursor: &SyncCursor,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let id = Uuid::new_v4();
        let compressed = self.config.work_dir.join(format!("accounting-{}.gz", id));
        let plain = self.config.work_dir.join(format!("accounting-{}", id));

        tokio::fs::copy(path, &compressed).await?;
        let decompressed = decompress(compressed.clone(), plain.clone()).await;
        remove_quietly(&compressed).await;
        if let Err(e) = decompressed {
            remove_quietly(&plain).await;
            return Err(e);
        }

        let parsed = self.ingest_whole(&plain, cursor, shutdown).await;
        remove_quietly(&plain).await;
        parsed
    }

    /// Read a complete file once, without tailing.
    async fn ingest_whole(
        &self,
        path: &Path,
        cursor: &SyncCursor,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let window = self.window(cursor, Utc::now());
        let mut reader = BufReader::new(File::open(path).await?);
        let mut line = Vec::new();
        let mut batch = Vec::new();
        let mut written = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            self.collect(&line, window, &mut batch);
            if batch.len() >= BATCH_SIZE {
                written += self.flush(&mut batch).await?;
            }
        }

        written += self.flush(&mut batch).await?;
        Ok(written)
    }

    /// Read the live file from the start and keep following it.
    async fn tail(
        &mut self,
        mut cursor: SyncCursor,
        shutdown: &CancellationToken,
    ) -> Result<PassOutcome> {
        let file = match File::open(&self.accounting_file).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(file = %self.accounting_file.display(), "Accounting log missing");
                return Ok(PassOutcome::Ended { records: 0 });
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut window = self.window(&cursor, Utc::now());
        let mut pending = Vec::new();
        let mut batch = Vec::new();
        let mut offset: u64 = 0;
        let mut added = 0;
        let mut total = 0;

        loop {
            if shutdown.is_cancelled() {
                let written = self.flush(&mut batch).await?;
                return Ok(PassOutcome::Cancelled {
                    records: total + written,
                });
            }

            let read = reader.read_until(b'\n', &mut pending).await?;
            if read > 0 {
                offset += read as u64;
                // A partial line stays pending until the writer finishes it.
                if pending.ends_with(b"\n") {
                    self.collect(&pending, window, &mut batch);
                    pending.clear();
                    if batch.len() >= BATCH_SIZE {
                        added += self.flush(&mut batch).await?;
                    }
                }
                continue;
            }

            added += self.flush(&mut batch).await?;
            let current_len = file_len(&self.accounting_file).await?;

            if added > 0 {
                let now = Utc::now();
                cursor = SyncCursor {
                    last_sync: Some(now),
                    file_len: current_len.unwrap_or(offset),
                };
                self.store.save_cursor(&cursor).await?;
                self.parsed_rotated = false;
                window = self.window(&cursor, now);
                tracing::debug!(records = added, file_len = cursor.file_len, "Accounting cursor advanced");
                total += added;
                added = 0;
            } else {
                let gone = match current_len {
                    None => true,
                    Some(len) => len < cursor.file_len || len < offset,
                };
                if gone {
                    return Ok(PassOutcome::Ended { records: total });
                }
            }

            if let Err(e) = self.maybe_sweep(Some(window)).await {
                tracing::warn!(error = %e, "Finished-job sweep failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Ok(PassOutcome::Cancelled { records: total });
                }
                _ = tokio::time::sleep(self.config.tail_interval()) => {}
            }
        }
    }

    fn collect(&self, line: &[u8], window: Duration, batch: &mut Vec<FinishedRecord>) {
        let text = String::from_utf8_lossy(line);
        match AccountingRecord::parse(&text) {
            Ok(Some(record)) => {
                if within_window(record.end_datetime(), Utc::now(), window) {
                    batch.push(record.to_finished());
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Skipping unparsable accounting line"),
        }
    }

    async fn flush(&self, batch: &mut Vec<FinishedRecord>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let written = self.store.persist_batch(batch).await?;
        batch.clear();
        Ok(written)
    }

    /// Cutoff window: the default before the first sync, afterwards the time
    /// since the last sync plus slack.
    pub fn window(&self, cursor: &SyncCursor, now: DateTime<Utc>) -> Duration {
        match cursor.last_sync {
            None => Duration::from_secs(self.config.default_window_secs),
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed + Duration::from_secs(self.config.sync_slack_secs)
            }
        }
    }

    async fn maybe_sweep(&mut self, window: Option<Duration>) -> Result<()> {
        if self.last_sweep.elapsed() < self.config.sweep_interval() {
            return Ok(());
        }
        self.last_sweep = Instant::now();

        let window = match window {
            Some(window) => window,
            None => self.window(&self.store.load_cursor().await?, Utc::now()),
        };
        let keep = window.max(Duration::from_secs(self.config.retention_secs));
        let keep = chrono::Duration::from_std(keep)
            .map_err(|e| GridError::InvalidArgument(e.to_string()))?;

        let removed = self.store.sweep(Utc::now() - keep).await?;
        if removed > 0 {
            tracing::info!(removed, "Swept stale finished-job records");
        }
        Ok(())
    }
}

fn within_window(end: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - end).to_std() {
        Ok(age) => age < window,
        // End time in the future.
        Err(_) => true,
    }
}

async fn file_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn decompress(src: PathBuf, dst: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut decoder = GzDecoder::new(std::fs::File::open(&src)?);
        let mut out = std::fs::File::create(&dst)?;
        std::io::copy(&mut decoder, &mut out)?;
        Ok(())
    })
    .await
    .map_err(|e| GridError::Io(std::io::Error::other(e)))?
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::record::tests::line;
    use crate::job::JobHandle;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn test_config(dir: &Path) -> SyncConfig {
        SyncConfig {
            accounting_file: None,
            work_dir: dir.to_path_buf(),
            database_path: dir.join("acct.db"),
            pool_size: 2,
            poll_interval_ms: 20,
            tail_interval_ms: 20,
            default_window_secs: 86_400,
            sync_slack_secs: 300,
            sweep_interval_ms: 60_000,
            retention_secs: 86_400,
        }
    }

    async fn setup() -> (tempfile::TempDir, FinishedStore, AccountingSynchronizer) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store = FinishedStore::open(&cfg.database_path, 2, Duration::from_millis(10))
            .await
            .unwrap();
        let sync = AccountingSynchronizer::new(store.clone(), dir.path().join("accounting"), cfg);
        (dir, store, sync)
    }

    fn recent(job: u64, task: u32, ago_secs: i64) -> String {
        let end = Utc::now().timestamp() - ago_secs;
        format!("{}\n", line(job, task, end - 30, end, 0, 1.0))
    }

    #[tokio::test]
    async fn tails_until_cancelled_and_advances_cursor() {
        let (dir, store, mut sync) = setup().await;
        let log = dir.path().join("accounting");
        std::fs::write(
            &log,
            format!("# header\n{}{}", recent(1, 0, 60), recent(2, 3, 90_000)),
        )
        .unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        });

        let outcome = sync.sync_pass(&token).await.unwrap();
        assert_eq!(outcome, PassOutcome::Cancelled { records: 1 });

        assert!(store.get(&JobHandle::new(1)).await.unwrap().is_some());
        // Older than the default window.
        assert!(store.get(&JobHandle::with_task(2, 3)).await.unwrap().is_none());

        let cursor = store.load_cursor().await.unwrap();
        assert!(cursor.last_sync.is_some());
        assert_eq!(cursor.file_len, std::fs::metadata(&log).unwrap().len());
    }

    #[tokio::test]
    async fn partial_lines_wait_for_completion() {
        let (dir, store, mut sync) = setup().await;
        let log = dir.path().join("accounting");
        let full = recent(5, 0, 10);
        let (head, rest) = full.split_at(20);
        std::fs::write(&log, head).unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        let log_clone = log.clone();
        let rest = rest.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let mut f = std::fs::OpenOptions::new().append(true).open(&log_clone).unwrap();
            f.write_all(rest.as_bytes()).unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
            cancel.cancel();
        });

        sync.sync_pass(&token).await.unwrap();
        assert!(store.get(&JobHandle::new(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rotation_consumes_compressed_log_once() {
        let (dir, store, mut sync) = setup().await;
        let log = dir.path().join("accounting");
        store
            .save_cursor(&SyncCursor {
                last_sync: Some(Utc::now() - chrono::Duration::minutes(1)),
                file_len: 10_000,
            })
            .await
            .unwrap();

        std::fs::write(&log, recent(8, 0, 5)).unwrap();
        let mut gz = GzEncoder::new(
            std::fs::File::create(sync.rotated_file()).unwrap(),
            Compression::default(),
        );
        gz.write_all(recent(7, 2, 30).as_bytes()).unwrap();
        gz.finish().unwrap();

        let token = CancellationToken::new();
        let outcome = sync.sync_pass(&token).await.unwrap();
        assert_eq!(outcome, PassOutcome::Rotated { records: 1 });
        assert!(store.get(&JobHandle::with_task(7, 2)).await.unwrap().is_some());
        assert_eq!(store.load_cursor().await.unwrap().file_len, 0);

        // Temporary copies are gone; only the log, its rotation and the db remain.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("accounting-"))
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");

        // The next pass tails the new file instead of re-reading the rotation.
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let outcome = sync.sync_pass(&token).await.unwrap();
        assert_eq!(outcome, PassOutcome::Cancelled { records: 1 });
        assert!(store.get(&JobHandle::new(8)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_shrink_before_cursor_advance_skips_rotation() {
        let (dir, store, mut sync) = setup().await;
        let log = dir.path().join("accounting");
        let rotated = sync.rotated_file();
        let write_rotation = |content: String| {
            let mut gz = GzEncoder::new(
                std::fs::File::create(&rotated).unwrap(),
                Compression::default(),
            );
            gz.write_all(content.as_bytes()).unwrap();
            gz.finish().unwrap();
        };

        write_rotation(recent(40, 0, 30));
        let token = CancellationToken::new();
        assert_eq!(
            sync.sync_pass(&token).await.unwrap(),
            PassOutcome::Rotated { records: 1 }
        );

        // Still no live file, but the rotation was already consumed.
        write_rotation(recent(41, 0, 30));
        assert_eq!(
            sync.sync_pass(&token).await.unwrap(),
            PassOutcome::Ended { records: 0 }
        );
        assert!(store.get(&JobHandle::new(41)).await.unwrap().is_none());

        // Once new lines advance the cursor, the next shrink reads it again.
        std::fs::write(&log, recent(42, 0, 5)).unwrap();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        assert_eq!(
            sync.sync_pass(&token).await.unwrap(),
            PassOutcome::Cancelled { records: 1 }
        );

        std::fs::remove_file(&log).unwrap();
        let token = CancellationToken::new();
        assert_eq!(
            sync.sync_pass(&token).await.unwrap(),
            PassOutcome::Rotated { records: 1 }
        );
        assert!(store.get(&JobHandle::new(41)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_waits_for_interval_and_keeps_the_larger_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.sweep_interval_ms = 50;
        let store = FinishedStore::open(&cfg.database_path, 2, Duration::from_millis(10))
            .await
            .unwrap();
        let mut sync =
            AccountingSynchronizer::new(store.clone(), dir.path().join("accounting"), cfg);

        let ended = |job: u64, hours_ago: i64| FinishedRecord {
            handle: JobHandle::new(job),
            start_time: Utc::now() - chrono::Duration::hours(hours_ago + 1),
            end_time: Utc::now() - chrono::Duration::hours(hours_ago),
            exit_status: 0,
        };
        for (job, hours_ago) in [(50, 1), (51, 30), (52, 80)] {
            store.persist(&ended(job, hours_ago)).await.unwrap();
        }

        // A window of three days outlasts the one-day retention.
        store
            .save_cursor(&SyncCursor {
                last_sync: Some(Utc::now() - chrono::Duration::hours(72)),
                file_len: 0,
            })
            .await
            .unwrap();

        // The interval has not elapsed yet.
        sync.last_sweep = Instant::now();
        sync.maybe_sweep(None).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        tokio::time::sleep(Duration::from_millis(80)).await;
        sync.maybe_sweep(None).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get(&JobHandle::new(51)).await.unwrap().is_some());
        assert!(store.get(&JobHandle::new(52)).await.unwrap().is_none());

        // With a short window the retention period decides.
        store
            .save_cursor(&SyncCursor {
                last_sync: Some(Utc::now() - chrono::Duration::minutes(10)),
                file_len: 0,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        sync.maybe_sweep(None).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.get(&JobHandle::new(50)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn import_reads_plain_and_compressed_files() {
        let (dir, store, sync) = setup().await;
        let plain = dir.path().join("old-accounting");
        std::fs::write(&plain, format!("{}{}", recent(30, 0, 20), recent(31, 0, 20))).unwrap();

        let gz_path = dir.path().join("older.gz");
        let mut gz = GzEncoder::new(std::fs::File::create(&gz_path).unwrap(), Compression::default());
        gz.write_all(recent(32, 1, 20).as_bytes()).unwrap();
        gz.finish().unwrap();

        let token = CancellationToken::new();
        assert_eq!(sync.import(&plain, &token).await.unwrap(), 2);
        assert_eq!(sync.import(&gz_path, &token).await.unwrap(), 1);
        // Re-importing writes nothing new.
        assert_eq!(sync.import(&plain, &token).await.unwrap(), 0);

        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.load_cursor().await.unwrap(), SyncCursor::default());
    }

    #[tokio::test]
    async fn missing_file_ends_pass() {
        let (_dir, _store, mut sync) = setup().await;
        let token = CancellationToken::new();
        // First pass looks for a rotation, the second finds nothing to tail.
        assert_eq!(
            sync.sync_pass(&token).await.unwrap(),
            PassOutcome::Rotated { records: 0 }
        );
        assert_eq!(
            sync.sync_pass(&token).await.unwrap(),
            PassOutcome::Ended { records: 0 }
        );
    }

    #[test]
    fn window_grows_with_time_since_last_sync() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let now = Utc::now();
        let cursor = SyncCursor {
            last_sync: Some(now - chrono::Duration::hours(2)),
            file_len: 0,
        };
        let expected = Duration::from_secs(2 * 3600 + 300);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = rt
            .block_on(FinishedStore::open(&cfg.database_path, 1, Duration::from_millis(10)))
            .unwrap();
        let sync = AccountingSynchronizer::new(store, dir.path().join("accounting"), cfg);

        assert_eq!(sync.window(&cursor, now), expected);
        assert_eq!(
            sync.window(&SyncCursor::default(), now),
            Duration::from_secs(86_400)
        );
        assert!(within_window(now - chrono::Duration::hours(1), now, expected));
        assert!(!within_window(now - chrono::Duration::hours(3), now, expected));
    }
}
