//! Shared async handle over the single native connection.
//!
//! # Responsibility
//! - Run blocking SQLite calls off the async executor, one future per call.
//! - Share one connection between every caller of one lifecycle.
//!
//! # Invariants
//! - Clones reference the same connection; it is never duplicated.
//! - After the owning lifecycle closes, every call fails with `DbError::Closed`.

use super::{DbError, DbResult};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// Outcome of a single data-modifying statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// Cloneable reference to a lifecycle's open connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: SharedConnection,
}

impl ConnectionHandle {
    pub(crate) fn new(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Returns true when both handles reference the same native connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `f` against the connection on the blocking pool.
    ///
    /// This is the primitive every other operation is built on; collaborators
    /// use it for queries the handle does not cover.
    pub async fn call<F, R>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce(&mut Connection) -> DbResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&inner);
            let conn = guard.as_mut().ok_or(DbError::Closed)?;
            f(conn)
        })
        .await?
    }

    /// Executes a group of statements that return no rows.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> DbResult<()> {
        let sql = sql.into();
        self.call(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    /// Executes one statement with positional parameters.
    pub async fn run(&self, sql: impl Into<String>, params: Vec<Value>) -> DbResult<RunResult> {
        let sql = sql.into();
        self.call(move |conn| {
            let changes = conn.execute(&sql, params_from_iter(params))?;
            Ok(RunResult {
                changes,
                last_insert_rowid: conn.last_insert_rowid(),
            })
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).is_none()
    }

    pub(crate) fn take_connection(&self) -> Option<Connection> {
        lock(&self.inner).take()
    }

    pub(crate) fn restore_connection(&self, conn: Connection) {
        *lock(&self.inner) = Some(conn);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock(inner: &SharedConnection) -> MutexGuard<'_, Option<Connection>> {
    // A panicking collaborator closure must not wedge the connection.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
