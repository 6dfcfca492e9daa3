pub mod identity;
pub mod inventory;
pub mod messaging;
pub mod migrations;
pub mod models;
pub mod reviews;
pub mod trust;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tracing::info;

use encore_types::{DbConfig, MarketError, MarketResult};

pub use messaging::{ThreadCursor, ThreadIter, ThreadPage};

/// SQLite-backed store with a small pool of writer connections and a pool of
/// read-only connections.
///
/// There is no application-level lock shared by all writes: each operation
/// checks out whichever connection is free and row-level conditions (the
/// listing version check in particular) decide who wins a race.
pub struct Database {
    writers: Vec<Mutex<Connection>>,
    readers: Vec<Mutex<Connection>>,
    writer_idx: AtomicUsize,
    reader_idx: AtomicUsize,
}

impl Database {
    pub fn open(config: &DbConfig) -> MarketResult<Self> {
        let path = Path::new(&config.path);
        let busy = Duration::from_millis(config.busy_timeout_ms);

        let first = open_writer(path, busy)?;
        migrations::run(&first)?;

        let mut writers = Vec::with_capacity(config.writers.max(1));
        writers.push(Mutex::new(first));
        for _ in 1..config.writers.max(1) {
            writers.push(Mutex::new(open_writer(path, busy)?));
        }

        let mut readers = Vec::with_capacity(config.readers.max(1));
        for _ in 0..config.readers.max(1) {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(busy)?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Database opened at {} ({} writers + {} readers)",
            path.display(),
            writers.len(),
            readers.len()
        );
        Ok(Self {
            writers,
            readers,
            writer_idx: AtomicUsize::new(0),
            reader_idx: AtomicUsize::new(0),
        })
    }

    /// Run `f` on a read-only connection.
    pub fn with_conn<F, T>(&self, f: F) -> MarketResult<T>
    where
        F: FnOnce(&Connection) -> MarketResult<T>,
    {
        let conn = checkout(&self.readers, &self.reader_idx)?;
        f(&conn)
    }

    /// Run `f` inside a read transaction so every query sees the same
    /// snapshot.
    pub fn with_snapshot<F, T>(&self, f: F) -> MarketResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> MarketResult<T>,
    {
        let mut conn = checkout(&self.readers, &self.reader_idx)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&tx)?;
        tx.finish()?;
        Ok(out)
    }

    /// Run `f` on a writer connection in autocommit mode.
    pub fn with_conn_mut<F, T>(&self, f: F) -> MarketResult<T>
    where
        F: FnOnce(&Connection) -> MarketResult<T>,
    {
        let conn = checkout(&self.writers, &self.writer_idx)?;
        f(&conn)
    }

    /// Run `f` inside an immediate write transaction. Any error rolls the
    /// whole transaction back; nothing `f` wrote becomes visible.
    pub fn with_tx<F, T>(&self, f: F) -> MarketResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> MarketResult<T>,
    {
        let mut conn = checkout(&self.writers, &self.writer_idx)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn open_writer(path: &Path, busy: Duration) -> MarketResult<Connection> {
    let conn = Connection::open(path)?;

    // WAL mode for concurrent reads
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy)?;
    Ok(conn)
}

/// Take the first idle connection starting at the round-robin cursor, or wait
/// on the cursor's own slot when every connection is busy.
fn checkout<'a>(
    pool: &'a [Mutex<Connection>],
    idx: &AtomicUsize,
) -> MarketResult<MutexGuard<'a, Connection>> {
    let start = idx.fetch_add(1, Ordering::Relaxed) % pool.len();
    for offset in 0..pool.len() {
        match pool[(start + offset) % pool.len()].try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::WouldBlock) => continue,
            Err(TryLockError::Poisoned(e)) => {
                return Err(MarketError::unavailable(format!(
                    "connection lock poisoned: {}",
                    e
                )));
            }
        }
    }
    pool[start]
        .lock()
        .map_err(|e| MarketError::unavailable(format!("connection lock poisoned: {}", e)))
}
