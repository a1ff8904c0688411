//! Connection lifecycle manager.
//!
//! # Responsibility
//! - Lazily open, configure and migrate the single connection of one
//!   database identity.
//! - Serialize concurrent first use behind one exclusive section.
//! - Close the connection with a bounded retry against `SQLITE_BUSY`.
//!
//! # Invariants
//! - At most one open+setup sequence runs at a time; waiters are released
//!   in arrival order.
//! - A handle is cached only after open and migrations both succeed; any
//!   failure leaves the lifecycle `Closed` so the next call retries fully.
//! - Explicit migrations run inside the same exclusive section.
//! - The exclusive section is owned by a spawned task, so a dropped caller
//!   never lets a second sequence start while the first is still running.
//! - Only the registered instance for an identity may hold an open connection.

use crate::config::{DatabaseConfig, DatabaseIdentity, MigrateOptions};
use crate::db::migrations::{self, MigrationReport, ReconciliationPlan};
use crate::db::{is_busy_error, open_native, ConnectionHandle, DbError, DbResult, OpenFailure};
use crate::registry;
use log::{error, info, warn};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

const CLOSE_ATTEMPTS: u32 = 10;
const CLOSE_BACKOFF: Duration = Duration::from_millis(50);

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Closed,
    Opening,
    Migrating,
    Open,
}

/// Retry budget for `Database::close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ClosePolicy {
    fn default() -> Self {
        Self {
            attempts: CLOSE_ATTEMPTS,
            backoff: CLOSE_BACKOFF,
        }
    }
}

/// Owner of the single connection for one database identity.
///
/// Instances only exist behind the registry; obtain one with
/// [`Database::shared`] or [`registry::default_database`].
pub struct Database {
    config: DatabaseConfig,
    identity: DatabaseIdentity,
    slot: tokio::sync::Mutex<Option<ConnectionHandle>>,
    phase: Mutex<LifecyclePhase>,
    open_count: AtomicUsize,
    close_policy: ClosePolicy,
    this: Weak<Database>,
}

impl Database {
    pub(crate) fn new_shared(config: DatabaseConfig, identity: DatabaseIdentity) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            identity,
            slot: tokio::sync::Mutex::new(None),
            phase: Mutex::new(LifecyclePhase::Closed),
            open_count: AtomicUsize::new(0),
            close_policy: ClosePolicy::default(),
            this: this.clone(),
        })
    }

    /// Returns the registered lifecycle for `config`'s identity, creating it
    /// on first lookup.
    pub fn shared(config: DatabaseConfig) -> DbResult<Arc<Database>> {
        registry::get_or_create(config)
    }

    pub fn identity(&self) -> &DatabaseIdentity {
        &self.identity
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of open+setup sequences that completed successfully.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Returns the ready connection handle, opening and migrating on first use.
    ///
    /// The guarded sequence runs on its own task. Dropping this future (for
    /// example under `tokio::time::timeout`) does not release the exclusive
    /// section early; later callers wait for the sequence and share its result.
    ///
    /// # Errors
    /// - `DbError::Open` when the native open is refused or fails, including
    ///   `OpenFailure::Superseded` for a released instance whose identity was
    ///   taken over by a newer one.
    /// - Any migration error from the configured `migrate` options.
    pub async fn connection(&self) -> DbResult<ConnectionHandle> {
        let this = self.owned()?;
        tokio::spawn(async move {
            let mut slot = this.slot.lock().await;
            let result = this.ensure_open(&mut slot).await;
            result
        })
        .await?
    }

    /// Runs a reconciliation with `options`, opening the database if needed.
    pub async fn migrate(&self, options: MigrateOptions) -> DbResult<MigrationReport> {
        let this = self.owned()?;
        tokio::spawn(async move {
            let mut slot = this.slot.lock().await;
            let handle = this.ensure_open(&mut slot).await?;

            this.set_phase(LifecyclePhase::Migrating);
            let result = handle
                .call(move |conn| migrations::migrate(conn, &options))
                .await;
            this.set_phase(LifecyclePhase::Open);
            result
        })
        .await?
    }

    /// Computes the plan `migrate(options)` would execute.
    pub async fn pending_plan(&self, options: MigrateOptions) -> DbResult<ReconciliationPlan> {
        let this = self.owned()?;
        tokio::spawn(async move {
            let mut slot = this.slot.lock().await;
            let handle = this.ensure_open(&mut slot).await?;
            let result = handle
                .call(move |conn| migrations::plan_migrations(conn, &options))
                .await;
            result
        })
        .await?
    }

    /// Closes the connection and releases this instance from the registry.
    ///
    /// A no-op on the connection when already closed. `SQLITE_BUSY` is retried
    /// per the close policy; when the budget runs out the connection stays
    /// open and `DbError::Busy` is returned.
    pub async fn close(&self) -> DbResult<()> {
        let this = self.owned()?;
        tokio::spawn(async move {
            let mut slot = this.slot.lock().await;
            let result = this.close_locked(&mut slot).await;
            result
        })
        .await?
    }

    async fn close_locked(&self, slot: &mut Option<ConnectionHandle>) -> DbResult<()> {
        let Some(handle) = slot.take() else {
            registry::release(self);
            return Ok(());
        };

        let taken = handle.clone();
        let conn = tokio::task::spawn_blocking(move || taken.take_connection()).await?;
        if let Some(conn) = conn {
            if let Err((conn, err)) = close_with_retry(conn, self.close_policy).await {
                error!(
                    "event=db_close module=lifecycle status=error target={} error={}",
                    self.identity.label(),
                    err
                );
                handle.restore_connection(conn);
                *slot = Some(handle);
                return Err(err);
            }
        }

        self.set_phase(LifecyclePhase::Closed);
        registry::release(self);
        info!(
            "event=db_close module=lifecycle status=ok target={}",
            self.identity.label()
        );
        Ok(())
    }

    async fn ensure_open(
        self: &Arc<Self>,
        slot: &mut Option<ConnectionHandle>,
    ) -> DbResult<ConnectionHandle> {
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        if !registry::claim(self) {
            warn!(
                "event=db_lifecycle module=lifecycle status=error target={} error=superseded",
                self.identity.label()
            );
            return Err(DbError::Open {
                target: self.identity.label(),
                failure: OpenFailure::Superseded,
            });
        }

        match self.open_and_setup().await {
            Ok(handle) => {
                *slot = Some(handle.clone());
                self.open_count.fetch_add(1, Ordering::SeqCst);
                self.set_phase(LifecyclePhase::Open);
                Ok(handle)
            }
            Err(err) => {
                self.set_phase(LifecyclePhase::Closed);
                warn!(
                    "event=db_lifecycle module=lifecycle status=error target={} error={}",
                    self.identity.label(),
                    err
                );
                Err(err)
            }
        }
    }

    async fn open_and_setup(&self) -> DbResult<ConnectionHandle> {
        self.set_phase(LifecyclePhase::Opening);
        let identity = self.identity.clone();
        let mut conn = tokio::task::spawn_blocking(move || open_native(&identity)).await??;

        if let Some(options) = self.config.migrate.clone() {
            self.set_phase(LifecyclePhase::Migrating);
            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = migrations::migrate(&mut conn, &options);
                (conn, result)
            })
            .await?;
            // On failure the connection is dropped here, never cached.
            result?;
            conn = returned;
        }

        Ok(ConnectionHandle::new(conn))
    }

    fn owned(&self) -> DbResult<Arc<Database>> {
        self.this.upgrade().ok_or(DbError::Closed)
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("identity", &self.identity)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Something that can attempt a close and hand itself back on failure.
pub(crate) trait Closable: Sized {
    fn try_close(self) -> Result<(), (Self, rusqlite::Error)>;
}

impl Closable for Connection {
    fn try_close(self) -> Result<(), (Self, rusqlite::Error)> {
        self.close()
    }
}

/// Closes `target`, sleeping `policy.backoff` between busy attempts.
///
/// On failure the target is returned so the caller can keep it open.
pub(crate) async fn close_with_retry<C: Closable>(
    target: C,
    policy: ClosePolicy,
) -> Result<u32, (C, DbError)> {
    let mut target = target;
    let mut attempt = 1;
    loop {
        match target.try_close() {
            Ok(()) => return Ok(attempt),
            Err((returned, err)) if is_busy_error(&err) => {
                if attempt >= policy.attempts {
                    return Err((returned, DbError::Busy { attempts: attempt }));
                }
                warn!(
                    "event=db_close module=lifecycle status=retry attempt={} max_attempts={}",
                    attempt, policy.attempts
                );
                target = returned;
                attempt += 1;
                tokio::time::sleep(policy.backoff).await;
            }
            Err((returned, err)) => return Err((returned, DbError::Sqlite(err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{close_with_retry, Closable, ClosePolicy};
    use crate::db::DbError;
    use rusqlite::ffi;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FlakyClose {
        busy_left: u32,
        calls: Arc<AtomicU32>,
    }

    impl Closable for FlakyClose {
        fn try_close(mut self) -> Result<(), (Self, rusqlite::Error)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.busy_left == 0 {
                return Ok(());
            }
            self.busy_left -= 1;
            let busy = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None);
            Err((self, busy))
        }
    }

    fn fast_policy() -> ClosePolicy {
        ClosePolicy {
            attempts: 10,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn default_policy_is_ten_attempts_fifty_ms_apart() {
        let policy = ClosePolicy::default();
        assert_eq!(policy.attempts, 10);
        assert_eq!(policy.backoff, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn nine_busy_responses_then_success_closes() {
        let calls = Arc::new(AtomicU32::new(0));
        let target = FlakyClose {
            busy_left: 9,
            calls: Arc::clone(&calls),
        };

        let attempts = close_with_retry(target, fast_policy())
            .await
            .unwrap_or_else(|(_, err)| panic!("close should succeed: {err}"));
        assert_eq!(attempts, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_busy_and_target() {
        let calls = Arc::new(AtomicU32::new(0));
        let target = FlakyClose {
            busy_left: 11,
            calls: Arc::clone(&calls),
        };

        let Err((returned, err)) = close_with_retry(target, fast_policy()).await else {
            panic!("close should fail");
        };
        assert!(matches!(err, DbError::Busy { attempts: 10 }));
        assert_eq!(returned.busy_left, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn non_busy_errors_are_not_retried() {
        struct Broken;
        impl Closable for Broken {
            fn try_close(self) -> Result<(), (Self, rusqlite::Error)> {
                Err((
                    self,
                    rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_MISUSE), None),
                ))
            }
        }

        let Err((_, err)) = close_with_retry(Broken, fast_policy()).await else {
            panic!("close should fail");
        };
        assert!(matches!(err, DbError::Sqlite(_)));
    }
}
