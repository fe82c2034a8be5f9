//! Database layer: the task table, the history ledger and derived bookkeeping.

pub mod invalidations;
pub mod issues;
pub mod ledger;
pub mod projects;
pub mod tasks;

use crate::error::{TaskError, TaskResult};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Database handle wrapping a SQLite connection.
///
/// Clones share one connection. Separate `open` calls on the same file get
/// separate connections, which is how several processes see the store.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    conflict_retries: u32,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> TaskResult<Self> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while one writer holds the write lock.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            conflict_retries: 1,
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> TaskResult<Self> {
        let conn = Connection::open_in_memory()?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            conflict_retries: 1,
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Set how many times a conflicted transaction is retried.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Set how long one attempt waits on another connection's write lock
    /// before failing with `ConcurrencyConflict`.
    pub fn with_busy_timeout(self, timeout: Duration) -> TaskResult<Self> {
        self.lock_conn()?.busy_timeout(timeout)?;
        Ok(self)
    }

    fn run_migrations(&self) -> TaskResult<()> {
        let mut conn = self.lock_conn()?;
        embedded::migrations::runner().run(&mut *conn)?;
        Ok(())
    }

    fn lock_conn(&self) -> TaskResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TaskError::storage("database connection mutex poisoned"))
    }

    /// Execute a read with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> TaskResult<T>
    where
        F: FnOnce(&Connection) -> TaskResult<T>,
    {
        let conn = self.lock_conn()?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken before `f` reads anything, so read-then-write
    /// sequences cannot interleave with writers on any other connection.
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    /// A `ConcurrencyConflict` reruns `f` up to the configured retry count.
    pub fn transaction<F, T>(&self, mut f: F) -> TaskResult<T>
    where
        F: FnMut(&Transaction<'_>) -> TaskResult<T>,
    {
        let mut conn = self.lock_conn()?;
        let mut attempt = 0;
        loop {
            match run_immediate(&mut conn, &mut f) {
                Err(err) if err.is_retryable() && attempt < self.conflict_retries => {
                    attempt += 1;
                    debug!(attempt, error = %err, "Retrying conflicted transaction");
                }
                result => return result,
            }
        }
    }
}

fn run_immediate<F, T>(conn: &mut Connection, f: &mut F) -> TaskResult<T>
where
    F: FnMut(&Transaction<'_>) -> TaskResult<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Get the current timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Map `QueryReturnedNoRows` to `None`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> TaskResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Decode a JSON text column inside a row mapper.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    column: &str,
) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

/// Decode an enum stored by name inside a row mapper.
pub(crate) fn enum_column<T>(
    row: &rusqlite::Row<'_>,
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown value '{}' in column {}", text, column).into(),
        )
    })
}
