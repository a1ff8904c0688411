//! Persisted ledger of applied migrations.
//!
//! # Responsibility
//! - Create the ledger table on demand.
//! - Load, insert and delete ledger rows.
//!
//! # Invariants
//! - Rows hold the exact up/down text that was applied; rollbacks read the
//!   down script from here, never from disk.
//! - The table name is always emitted as a quoted identifier.

use super::source::MigrationFile;
use crate::db::DbResult;
use rusqlite::{params, Connection, Row};

/// One applied migration as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub id: i64,
    pub name: String,
    pub up: String,
    pub down: String,
}

impl From<&MigrationFile> for MigrationRecord {
    fn from(file: &MigrationFile) -> Self {
        Self {
            id: file.id,
            name: file.name.clone(),
            up: file.up.clone(),
            down: file.down.clone(),
        }
    }
}

/// Creates the ledger table when it does not exist yet.
pub fn ensure_ledger_table(conn: &Connection, table: &str) -> DbResult<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            up TEXT NOT NULL,
            down TEXT NOT NULL
        );",
        quote_identifier(table)
    ))?;
    Ok(())
}

/// Returns true when `table` is present in the schema.
pub fn ledger_table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1);",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

/// Loads every ledger row, ascending by id.
pub fn load_records(conn: &Connection, table: &str) -> DbResult<Vec<MigrationRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, name, up, down FROM {} ORDER BY id ASC;",
        quote_identifier(table)
    ))?;
    let rows = stmt.query_map([], map_record_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

pub(crate) fn insert_record(conn: &Connection, table: &str, file: &MigrationFile) -> DbResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (id, name, up, down) VALUES (?1, ?2, ?3, ?4);",
            quote_identifier(table)
        ),
        params![file.id, file.name, file.up, file.down],
    )?;
    Ok(())
}

pub(crate) fn delete_record(conn: &Connection, table: &str, id: i64) -> DbResult<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1;", quote_identifier(table)),
        [id],
    )?;
    Ok(())
}

fn map_record_row(row: &Row<'_>) -> rusqlite::Result<MigrationRecord> {
    Ok(MigrationRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        up: row.get(2)?,
        down: row.get(3)?,
    })
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
