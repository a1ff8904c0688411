//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure the native SQLite connection for one identity.
//! - Reconcile the migration ledger against on-disk migration scripts.
//! - Expose the shared async handle used by collaborators.
//!
//! # Invariants
//! - Applied migrations are tracked in the ledger table, not `user_version`.
//! - Callers never receive a handle before configured migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

mod handle;
pub mod migrations;
mod open;

pub use handle::{ConnectionHandle, RunResult};
pub use open::open_native;

pub type DbResult<T> = Result<T, DbError>;

/// Reason a native open was refused or failed.
#[derive(Debug)]
pub enum OpenFailure {
    MustExistButMissing,
    ReadOnlyButMissing,
    InvalidPath(String),
    /// The parent directory of a file target could not be created.
    CreateParent(std::io::Error),
    /// Another registered lifecycle owns this identity.
    Superseded,
    Native(rusqlite::Error),
}

impl Display for OpenFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MustExistButMissing => write!(f, "database must exist but is missing"),
            Self::ReadOnlyButMissing => write!(f, "read-only database is missing"),
            Self::InvalidPath(reason) => write!(f, "invalid database path: {reason}"),
            Self::CreateParent(err) => write!(f, "cannot create parent directory: {err}"),
            Self::Superseded => write!(
                f,
                "lifecycle was released and another instance now owns this database"
            ),
            Self::Native(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug)]
pub enum DbError {
    Open {
        target: String,
        failure: OpenFailure,
    },
    Busy {
        attempts: u32,
    },
    MalformedMigration {
        file: PathBuf,
        reason: String,
    },
    Drift {
        orphaned: Vec<i64>,
        unapplied: Vec<i64>,
    },
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Closed,
    Task(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { target, failure } => {
                write!(f, "failed to open database `{target}`: {failure}")
            }
            Self::Busy { attempts } => write!(
                f,
                "database still busy after {attempts} close attempts"
            ),
            Self::MalformedMigration { file, reason } => write!(
                f,
                "malformed migration file `{}`: {reason}",
                file.display()
            ),
            Self::Drift {
                orphaned,
                unapplied,
            } => write!(
                f,
                "migration ledger drifted from source files: orphaned={orphaned:?} unapplied={unapplied:?}"
            ),
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Closed => write!(f, "database connection is closed"),
            Self::Task(message) => write!(f, "database task failed: {message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Open {
                failure: OpenFailure::Native(err),
                ..
            } => Some(err),
            Self::Open {
                failure: OpenFailure::CreateParent(err),
                ..
            } => Some(err),
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Open { .. }
            | Self::Busy { .. }
            | Self::MalformedMigration { .. }
            | Self::Drift { .. }
            | Self::Closed
            | Self::Task(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Task(value.to_string())
    }
}

impl DbError {
    /// Returns true when SQLite reported `SQLITE_BUSY` for this error.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(err) => is_busy_error(err),
            Self::Busy { .. } => true,
            _ => false,
        }
    }
}

pub(crate) fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy)
    )
}
