//! Native connection bootstrap for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections honoring identity flags.
//! - Configure connection pragmas required by core behavior.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON`.
//! - Returned connections have the identity's journal mode applied.
//! - Missing files are never created for read-only or must-exist identities.

use super::{DbError, DbResult, OpenFailure};
use crate::config::{DatabaseIdentity, DatabaseTarget};
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens and configures the native connection for `identity`.
///
/// Migrations are not run here; the lifecycle manager runs them after open.
///
/// # Side effects
/// - Creates the parent directory of a writable file target.
/// - Emits `db_open` logging events with duration and status.
pub fn open_native(identity: &DatabaseIdentity) -> DbResult<Connection> {
    let started_at = Instant::now();
    let mode = identity.mode();
    info!(
        "event=db_open module=db status=start mode={} read_only={} must_exist={}",
        mode, identity.read_only, identity.must_exist
    );

    let conn = match open_with_flags(identity) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err);
        }
    };

    match configure_connection(&conn, identity) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} durability={} duration_ms={}",
                mode,
                identity.durability.as_str(),
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_configure_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn open_with_flags(identity: &DatabaseIdentity) -> DbResult<Connection> {
    let flags = open_flags(identity);
    match &identity.target {
        DatabaseTarget::Memory => {
            Connection::open_in_memory_with_flags(flags).map_err(|err| native_failure(identity, err))
        }
        DatabaseTarget::File(path) => {
            ensure_file_target(identity, path)?;
            Connection::open_with_flags(path, flags).map_err(|err| native_failure(identity, err))
        }
    }
}

fn open_flags(identity: &DatabaseIdentity) -> OpenFlags {
    let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if identity.read_only {
        return base | OpenFlags::SQLITE_OPEN_READ_ONLY;
    }
    if identity.must_exist {
        return base | OpenFlags::SQLITE_OPEN_READ_WRITE;
    }
    base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
}

fn ensure_file_target(identity: &DatabaseIdentity, path: &Path) -> DbResult<()> {
    let exists = path.exists();
    if identity.read_only && !exists {
        return Err(open_error(identity, OpenFailure::ReadOnlyButMissing));
    }
    if identity.must_exist && !exists {
        return Err(open_error(identity, OpenFailure::MustExistButMissing));
    }
    if path.is_dir() {
        return Err(open_error(
            identity,
            OpenFailure::InvalidPath("path is a directory".to_string()),
        ));
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|err| open_error(identity, OpenFailure::CreateParent(err)))?;
        }
    }
    Ok(())
}

fn configure_connection(conn: &Connection, identity: &DatabaseIdentity) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if let Some(pragma) = identity.durability.pragma() {
        // journal_mode reports the resulting mode as a row.
        let _: String = conn.query_row(pragma, [], |row| row.get(0))?;
    }
    Ok(())
}

fn open_error(identity: &DatabaseIdentity, failure: OpenFailure) -> DbError {
    DbError::Open {
        target: identity.label(),
        failure,
    }
}

fn native_failure(identity: &DatabaseIdentity, err: rusqlite::Error) -> DbError {
    open_error(identity, OpenFailure::Native(err))
}
