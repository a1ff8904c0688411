//! Single-owner SQLite access with ledger-based schema migrations.
//!
//! A [`Database`] lazily opens one connection per [`DatabaseIdentity`], runs
//! the configured migrations exactly once, and hands the same
//! [`ConnectionHandle`] to every caller.

pub mod config;
pub mod db;
pub mod lifecycle;
pub mod logging;
pub mod registry;

pub use config::{
    DatabaseConfig, DatabaseIdentity, DatabaseTarget, DurabilityMode, ForcePolicy, MigrateOptions,
};
pub use db::migrations::{MigrationReport, PlannedStep, ReconciliationPlan};
pub use db::{ConnectionHandle, DbError, DbResult, OpenFailure, RunResult};
pub use lifecycle::{ClosePolicy, Database, LifecyclePhase};
pub use logging::{default_log_level, init_logging, init_logging_with, logging_status};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
