//! Database configuration and identity resolution.
//!
//! # Responsibility
//! - Describe which database to open and how (`DatabaseConfig`).
//! - Describe how migrations are reconciled (`MigrateOptions`).
//! - Resolve a config into a hashable `DatabaseIdentity`.
//!
//! # Invariants
//! - Resolved file identities always carry an absolute path.
//! - `:memory:` paths resolve to the in-memory target.

use crate::db::{DbError, DbResult, OpenFailure};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_LEDGER_TABLE: &str = "migrations";
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

const MEMORY_PATH: &str = ":memory:";

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseTarget {
    File(PathBuf),
    Memory,
}

/// Journal mode applied right after open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// Leave SQLite's rollback journal untouched.
    #[default]
    Default,
    Wal,
}

impl DurabilityMode {
    pub(crate) fn pragma(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Wal => Some("PRAGMA journal_mode = WAL;"),
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Wal => "wal",
        }
    }
}

/// Whether the last on-disk migration is forcibly rolled back and re-applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForcePolicy {
    #[default]
    None,
    ReapplyLast,
}

/// Migration reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigrateOptions {
    #[serde(default)]
    pub force: ForcePolicy,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_migrations_path")]
    pub migrations_path: PathBuf,
    /// Raise `DbError::Drift` instead of only logging ledger/file mismatches
    /// that the rollback scan cannot reach.
    #[serde(default)]
    pub fail_on_drift: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            force: ForcePolicy::None,
            table: default_table(),
            migrations_path: default_migrations_path(),
            fail_on_drift: false,
        }
    }
}

impl MigrateOptions {
    pub fn new(migrations_path: impl Into<PathBuf>) -> Self {
        Self {
            migrations_path: migrations_path.into(),
            ..Self::default()
        }
    }

    pub fn force(mut self, force: ForcePolicy) -> Self {
        self.force = force;
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn fail_on_drift(mut self, enabled: bool) -> Self {
        self.fail_on_drift = enabled;
        self
    }
}

fn default_table() -> String {
    DEFAULT_LEDGER_TABLE.to_string()
}

fn default_migrations_path() -> PathBuf {
    PathBuf::from(DEFAULT_MIGRATIONS_DIR)
}

/// Full open configuration for one database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    pub target: DatabaseTarget,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub must_exist: bool,
    #[serde(default)]
    pub durability: DurabilityMode,
    /// `None` disables migrations on open.
    #[serde(default)]
    pub migrate: Option<MigrateOptions>,
}

impl DatabaseConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_target(DatabaseTarget::File(path.into()))
    }

    pub fn memory() -> Self {
        Self::with_target(DatabaseTarget::Memory)
    }

    fn with_target(target: DatabaseTarget) -> Self {
        Self {
            target,
            read_only: false,
            must_exist: false,
            durability: DurabilityMode::Default,
            migrate: None,
        }
    }

    pub fn read_only(mut self, enabled: bool) -> Self {
        self.read_only = enabled;
        self
    }

    pub fn must_exist(mut self, enabled: bool) -> Self {
        self.must_exist = enabled;
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn migrate(mut self, options: MigrateOptions) -> Self {
        self.migrate = Some(options);
        self
    }

    /// Resolves this config into the identity used for registry lookup.
    ///
    /// # Errors
    /// - `DbError::Open` with `InvalidPath` for an empty path.
    /// - `DbError::Io` when the working directory cannot be read.
    pub fn identity(&self) -> DbResult<DatabaseIdentity> {
        let target = match &self.target {
            DatabaseTarget::Memory => DatabaseTarget::Memory,
            DatabaseTarget::File(path) => resolve_file_target(path)?,
        };

        Ok(DatabaseIdentity {
            target,
            read_only: self.read_only,
            must_exist: self.must_exist,
            durability: self.durability,
        })
    }
}

fn resolve_file_target(path: &Path) -> DbResult<DatabaseTarget> {
    if path.as_os_str().is_empty() {
        return Err(DbError::Open {
            target: String::new(),
            failure: OpenFailure::InvalidPath("path cannot be empty".to_string()),
        });
    }
    if path.as_os_str() == MEMORY_PATH {
        return Ok(DatabaseTarget::Memory);
    }
    if path.is_absolute() {
        return Ok(DatabaseTarget::File(path.to_path_buf()));
    }
    Ok(DatabaseTarget::File(std::env::current_dir()?.join(path)))
}

/// Resolved configuration tuple naming exactly one logical database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseIdentity {
    pub target: DatabaseTarget,
    pub read_only: bool,
    pub must_exist: bool,
    pub durability: DurabilityMode,
}

impl DatabaseIdentity {
    /// Human-readable target used in logs and errors.
    pub fn label(&self) -> String {
        match &self.target {
            DatabaseTarget::File(path) => path.display().to_string(),
            DatabaseTarget::Memory => MEMORY_PATH.to_string(),
        }
    }

    pub(crate) fn mode(&self) -> &'static str {
        match self.target {
            DatabaseTarget::File(_) => "file",
            DatabaseTarget::Memory => "memory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DatabaseConfig, DatabaseTarget, DurabilityMode, ForcePolicy, MigrateOptions};
    use crate::db::DbError;
    use std::path::PathBuf;

    #[test]
    fn relative_paths_resolve_against_working_directory() {
        let identity = DatabaseConfig::file("data/app.db").identity().unwrap();
        let expected = std::env::current_dir().unwrap().join("data/app.db");
        assert_eq!(identity.target, DatabaseTarget::File(expected));
    }

    #[test]
    fn memory_path_resolves_to_memory_target() {
        let identity = DatabaseConfig::file(":memory:").identity().unwrap();
        assert_eq!(identity.target, DatabaseTarget::Memory);
        assert_eq!(identity.label(), ":memory:");
    }

    #[test]
    fn empty_path_is_rejected() {
        let err = DatabaseConfig::file("").identity().unwrap_err();
        assert!(matches!(err, DbError::Open { .. }));
    }

    #[test]
    fn identity_distinguishes_flags() {
        let plain = DatabaseConfig::file("/tmp/a.db").identity().unwrap();
        let read_only = DatabaseConfig::file("/tmp/a.db")
            .read_only(true)
            .identity()
            .unwrap();
        assert_ne!(plain, read_only);
    }

    #[test]
    fn migrate_options_default_to_migrations_table_and_dir() {
        let options = MigrateOptions::default();
        assert_eq!(options.table, "migrations");
        assert_eq!(options.migrations_path, PathBuf::from("migrations"));
        assert_eq!(options.force, ForcePolicy::None);
        assert!(!options.fail_on_drift);
    }

    #[test]
    fn config_deserializes_from_json() {
        let config: DatabaseConfig = serde_json::from_str(
            r#"{
                "target": {"file": "/var/lib/app/app.db"},
                "durability": "wal",
                "migrate": {"force": "reapply-last", "migrations_path": "/srv/sql"}
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.target,
            DatabaseTarget::File(PathBuf::from("/var/lib/app/app.db"))
        );
        assert_eq!(config.durability, DurabilityMode::Wal);
        assert!(!config.read_only);
        let migrate = config.migrate.unwrap();
        assert_eq!(migrate.force, ForcePolicy::ReapplyLast);
        assert_eq!(migrate.table, "migrations");
        assert_eq!(migrate.migrations_path, PathBuf::from("/srv/sql"));
    }

    #[test]
    fn memory_config_deserializes_from_json() {
        let config: DatabaseConfig =
            serde_json::from_str(r#"{"target": "memory", "migrate": null}"#).unwrap();
        assert_eq!(config.target, DatabaseTarget::Memory);
        assert!(config.migrate.is_none());
    }
}
