//! File-based migration reconciliation.
//!
//! # Responsibility
//! - Read migration scripts from disk on every run.
//! - Reconcile them against the ledger table and execute the plan.
//!
//! # Invariants
//! - Malformed files fail the run before the ledger is touched.
//! - Rollbacks run before applies; each step is its own transaction.
//! - Drift is always logged; it is an error only with `fail_on_drift`.
//! - An empty or missing source directory never touches the ledger.
//! - Planning and listing never write; an absent ledger reads as empty.

use crate::config::MigrateOptions;
use crate::db::{DbError, DbResult};
use log::{info, warn};
use rusqlite::Connection;
use std::time::Instant;

mod executor;
mod ledger;
mod plan;
mod source;

pub use executor::{execute_plan, MigrationReport};
pub use ledger::{ensure_ledger_table, ledger_table_exists, load_records, MigrationRecord};
pub use plan::{
    detect_drift, reconcile, Drift, MigrationAction, PlannedStep, ReconciliationPlan,
};
pub use source::{read_migration_files, MigrationFile};

/// Computes the plan a `migrate` call would execute, without executing it.
///
/// Read-only: a missing ledger table is treated as an empty ledger.
pub fn plan_migrations(conn: &Connection, options: &MigrateOptions) -> DbResult<ReconciliationPlan> {
    let files = read_migration_files(&options.migrations_path)?;
    if files.is_empty() {
        return Ok(ReconciliationPlan::default());
    }
    let records = existing_records(conn, &options.table)?;
    Ok(reconcile(&records, &files, options.force))
}

/// Reconciles the ledger in `options.table` with `options.migrations_path`.
///
/// # Errors
/// - `DbError::MalformedMigration` before any transaction opens.
/// - `DbError::Drift` when `fail_on_drift` is set and the plan would leave
///   ledger and files inconsistent; nothing is executed in that case.
/// - `DbError::Sqlite` from the first failing step; earlier steps stay
///   committed.
pub fn migrate(conn: &mut Connection, options: &MigrateOptions) -> DbResult<MigrationReport> {
    let started_at = Instant::now();
    let files = read_migration_files(&options.migrations_path)?;
    if files.is_empty() {
        warn!(
            "event=migrate module=migrations status=skip reason=no_source_files table={} dir={}",
            options.table,
            options.migrations_path.display()
        );
        return Ok(MigrationReport::default());
    }
    ensure_ledger_table(conn, &options.table)?;
    let records = load_records(conn, &options.table)?;

    let plan = reconcile(&records, &files, options.force);
    let drift = detect_drift(&records, &files, &plan);
    if !drift.is_empty() {
        warn!(
            "event=migration_drift module=migrations status=warn table={} orphaned={:?} unapplied={:?}",
            options.table, drift.orphaned, drift.unapplied
        );
        if options.fail_on_drift {
            return Err(DbError::Drift {
                orphaned: drift.orphaned,
                unapplied: drift.unapplied,
            });
        }
    }

    info!(
        "event=migrate module=migrations status=start table={} files={} applied={} rollbacks={} applies={}",
        options.table,
        files.len(),
        records.len(),
        plan.rollback_ids().len(),
        plan.apply_ids().len()
    );
    let report = execute_plan(conn, &options.table, &plan)?;
    info!(
        "event=migrate module=migrations status=ok table={} rolled_back={:?} applied={:?} duration_ms={}",
        options.table,
        report.rolled_back,
        report.applied,
        started_at.elapsed().as_millis()
    );
    Ok(report)
}

/// Lists ledger rows, ascending by id; empty when the ledger does not exist.
pub fn applied_migrations(conn: &Connection, table: &str) -> DbResult<Vec<MigrationRecord>> {
    existing_records(conn, table)
}

fn existing_records(conn: &Connection, table: &str) -> DbResult<Vec<MigrationRecord>> {
    if !ledger_table_exists(conn, table)? {
        return Ok(Vec::new());
    }
    load_records(conn, table)
}
