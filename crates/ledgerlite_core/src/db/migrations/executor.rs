//! Plan execution, one transaction per step.
//!
//! # Invariants
//! - A step's script and its ledger mutation commit together or not at all.
//! - The first failing step stops the plan; earlier commits stay.

use super::ledger::{delete_record, insert_record};
use super::plan::{PlannedStep, ReconciliationPlan};
use crate::db::DbResult;
use log::{error, info};
use rusqlite::Connection;
use std::time::Instant;

/// Ids touched by a completed migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Rolled back ids, highest first.
    pub rolled_back: Vec<i64>,
    /// Applied ids, ascending.
    pub applied: Vec<i64>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.rolled_back.is_empty() && self.applied.is_empty()
    }
}

/// Executes `plan` against `conn`, recording each step in `table`.
pub fn execute_plan(
    conn: &mut Connection,
    table: &str,
    plan: &ReconciliationPlan,
) -> DbResult<MigrationReport> {
    let mut report = MigrationReport::default();
    for step in &plan.steps {
        let started_at = Instant::now();
        if let Err(err) = execute_step(conn, table, step) {
            error!(
                "event=migration_step module=migrations status=error action={:?} id={} name={} duration_ms={} error={}",
                step.action(),
                step.id(),
                step.name(),
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err);
        }
        info!(
            "event=migration_step module=migrations status=ok action={:?} id={} name={} duration_ms={}",
            step.action(),
            step.id(),
            step.name(),
            started_at.elapsed().as_millis()
        );

        match step {
            PlannedStep::Rollback(record) => report.rolled_back.push(record.id),
            PlannedStep::Apply(file) => report.applied.push(file.id),
        }
    }
    Ok(report)
}

fn execute_step(conn: &mut Connection, table: &str, step: &PlannedStep) -> DbResult<()> {
    // Dropping an uncommitted transaction rolls it back.
    let tx = conn.transaction()?;
    match step {
        PlannedStep::Rollback(record) => {
            tx.execute_batch(&record.down)?;
            delete_record(&tx, table, record.id)?;
        }
        PlannedStep::Apply(file) => {
            tx.execute_batch(&file.up)?;
            insert_record(&tx, table, file)?;
        }
    }
    tx.commit()?;
    Ok(())
}
