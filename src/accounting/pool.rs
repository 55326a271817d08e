//! Bounded pool of persistence-backend connections.
//!
//! A fixed number of connections is opened up front. Concurrency is bounded by
//! a FIFO-fair [`Semaphore`]; the connection collections sit behind a separate
//! mutex that is never held across an `.await`.
//!
//! Invariants:
//! - a connection is either in the available queue or held by exactly one
//!   [`PooledConnection`], never both;
//! - every acquired permit is returned exactly once, by [`ConnectionPool::release`]
//!   or, failing that, by the connection's `Drop`.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::Semaphore;

use crate::error::{GridError, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Opens and health-checks backend connections.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection>;

    fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

struct Collections<C> {
    available: VecDeque<(u64, C)>,
    all: HashSet<u64>,
    closed: bool,
}

struct PoolInner<M: ConnectionManager> {
    id: u64,
    name: &'static str,
    manager: M,
    capacity: usize,
    semaphore: Semaphore,
    collections: Mutex<Collections<M::Connection>>,
    reconnect_delay: Duration,
}

impl<M: ConnectionManager> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, Collections<M::Connection>> {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return a connection to the available queue and hand back its permit.
    fn put_back(&self, slot: u64, conn: M::Connection) {
        let mut cols = self.lock();
        if cols.closed {
            drop(cols);
            self.manager.close(conn);
            return;
        }
        cols.available.push_back((slot, conn));
        drop(cols);
        self.semaphore.add_permits(1);
    }
}

/// A connection on loan from a [`ConnectionPool`].
pub struct PooledConnection<M: ConnectionManager> {
    pool_id: u64,
    slot: u64,
    conn: Option<M::Connection>,
    home: Weak<PoolInner<M>>,
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `release` and `drop` take the connection, and both consume self.
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(inner) = self.home.upgrade() {
                tracing::debug!(pool = inner.name, slot = self.slot, "Connection returned on drop");
                inner.put_back(self.slot, conn);
            }
        }
    }
}

pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Open `capacity` connections. Fails if any of them cannot be opened.
    pub fn new(
        name: &'static str,
        manager: M,
        capacity: usize,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(GridError::InvalidArgument(
                "connection pool capacity must be positive".to_string(),
            ));
        }

        let mut available = VecDeque::with_capacity(capacity);
        let mut all = HashSet::with_capacity(capacity);
        for slot in 0..capacity as u64 {
            available.push_back((slot, manager.connect()?));
            all.insert(slot);
        }

        tracing::info!(pool = name, capacity, "Connection pool opened");

        Ok(Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                name,
                manager,
                capacity,
                semaphore: Semaphore::new(capacity),
                collections: Mutex::new(Collections {
                    available,
                    all,
                    closed: false,
                }),
                reconnect_delay,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Connections currently idle in the pool.
    pub fn available(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wait for a free connection. Waiters are served first come, first served.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| GridError::Persistence(format!("{} pool is closed", self.inner.name)))?;
        // Ownership of the permit travels with the connection.
        permit.forget();

        let mut cols = self.inner.lock();
        match cols.available.pop_front() {
            Some((slot, conn)) if !cols.closed => Ok(PooledConnection {
                pool_id: self.inner.id,
                slot,
                conn: Some(conn),
                home: Arc::downgrade(&self.inner),
            }),
            popped => {
                drop(cols);
                if let Some((_, conn)) = popped {
                    self.inner.manager.close(conn);
                }
                self.inner.semaphore.add_permits(1);
                Err(GridError::Persistence(format!(
                    "{} pool has no connection available",
                    self.inner.name
                )))
            }
        }
    }

    /// Hand a connection back. A dead connection is replaced by a freshly
    /// opened one; opening is retried until it succeeds or the pool closes.
    pub async fn release(&self, mut conn: PooledConnection<M>) -> Result<()> {
        if conn.pool_id != self.inner.id {
            return Err(GridError::InvalidArgument(
                "connection was not issued by this pool".to_string(),
            ));
        }

        let slot = conn.slot;
        let Some(mut raw) = conn.conn.take() else {
            return Err(GridError::InvalidArgument(
                "connection was already released".to_string(),
            ));
        };

        {
            let cols = self.inner.lock();
            if cols.closed {
                drop(cols);
                self.inner.manager.close(raw);
                return Ok(());
            }
            if !cols.all.contains(&slot) {
                drop(cols);
                self.inner.manager.close(raw);
                return Err(GridError::InvalidArgument(format!(
                    "connection slot {} is not tracked by the {} pool",
                    slot, self.inner.name
                )));
            }
        }

        if !self.inner.manager.is_valid(&mut raw) {
            tracing::warn!(pool = self.inner.name, slot, "Pooled connection is dead, reconnecting");
            self.inner.manager.close(raw);
            raw = match self.reconnect().await {
                Some(fresh) => fresh,
                None => return Ok(()),
            };
        }

        self.inner.put_back(slot, raw);
        Ok(())
    }

    async fn reconnect(&self) -> Option<M::Connection> {
        loop {
            if self.is_closed() {
                return None;
            }
            match self.inner.manager.connect() {
                Ok(conn) => {
                    tracing::info!(pool = self.inner.name, "Reconnection succeeded");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        pool = self.inner.name,
                        error = %e,
                        retry_in_ms = self.inner.reconnect_delay.as_millis() as u64,
                        "Reconnection failed"
                    );
                }
            }
            tokio::time::sleep(self.inner.reconnect_delay).await;
        }
    }

    /// Run `op` on a pooled connection. A persistence failure on a connection
    /// that no longer passes the liveness check is retried once on a
    /// reconnected connection.
    pub async fn with_connection<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut M::Connection) -> Result<T>,
    {
        let mut conn = self.acquire().await?;
        let result = op(&mut conn);

        match result {
            Err(GridError::Persistence(ref e)) if !self.inner.manager.is_valid(&mut conn) => {
                tracing::warn!(pool = self.inner.name, error = %e, "Operation failed on dead connection, retrying");
                self.release(conn).await?;
                let mut conn = self.acquire().await?;
                let retried = op(&mut conn);
                self.release(conn).await?;
                retried
            }
            other => {
                self.release(conn).await?;
                other
            }
        }
    }

    /// Close every idle connection and refuse further acquires. Connections on
    /// loan are closed when they come back.
    pub fn close(&self) {
        let drained: Vec<(u64, M::Connection)> = {
            let mut cols = self.inner.lock();
            if cols.closed {
                return;
            }
            cols.closed = true;
            cols.all.clear();
            cols.available.drain(..).collect()
        };
        self.inner.semaphore.close();
        for (_, conn) in drained {
            self.inner.manager.close(conn);
        }
        tracing::info!(pool = self.inner.name, "Connection pool closed");
    }
}

/// SQLite-backed connections.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    read_only: bool,
}

impl SqliteManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
        }
    }

    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: true,
        }
    }
}

impl ConnectionManager for SqliteManager {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection> {
        let conn = if self.read_only {
            Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&self.path)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
            conn
        };
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> bool {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn close(&self, conn: Connection) {
        if let Err((_, e)) = conn.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to close connection");
        }
    }
}
