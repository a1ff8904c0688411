//! Migration script discovery.
//!
//! # Responsibility
//! - Scan a directory for `<id>-<name>.sql` / `<id>.<name>.sql` files.
//! - Split each file into its up and down scripts.
//!
//! # Invariants
//! - Output is strictly ascending by id; duplicate ids are rejected.
//! - A file without a down marker fails the whole scan.
//!
//! # Known limitation
//! Every `--` line before the down marker is stripped from the up script,
//! including lines that sit inside a multi-line string literal.

use crate::db::{DbError, DbResult};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)[-.](.+)\.sql$").expect("migration file name pattern is valid")
});
static DOWN_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^--\s*down\b").expect("down marker pattern is valid"));
static COMMENT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^--.*$").expect("comment line pattern is valid"));

/// One migration script as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub id: i64,
    pub name: String,
    pub up: String,
    pub down: String,
}

/// Reads every migration file under `dir`, ascending by id.
///
/// A missing directory yields an empty list.
///
/// # Errors
/// - `DbError::MalformedMigration` for a missing down marker, an id that does
///   not fit in `i64`, or a duplicated id.
/// - `DbError::Io` when the directory or a file cannot be read.
pub fn read_migration_files(dir: &Path) -> DbResult<Vec<MigrationFile>> {
    if !dir.is_dir() {
        debug!(
            "event=migration_scan module=migrations status=skip reason=missing_dir dir={}",
            dir.display()
        );
        return Ok(Vec::new());
    }

    let mut located = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(captures) = FILE_NAME.captures(file_name) else {
            continue;
        };

        let path = entry.path();
        let id = captures[1]
            .parse::<i64>()
            .map_err(|err| malformed(&path, format!("invalid id `{}`: {err}", &captures[1])))?;
        located.push((id, captures[2].to_string(), path));
    }
    located.sort_by_key(|(id, _, _)| *id);

    if let Some(pair) = located.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        return Err(malformed(
            &pair[1].2,
            format!("duplicate migration id {} (also in `{}`)", pair[1].0, pair[0].2.display()),
        ));
    }

    let mut files = Vec::with_capacity(located.len());
    for (id, name, path) in located {
        let body = std::fs::read_to_string(&path)?;
        let (up, down) = split_scripts(&path, &body)?;
        files.push(MigrationFile { id, name, up, down });
    }

    debug!(
        "event=migration_scan module=migrations status=ok dir={} count={}",
        dir.display(),
        files.len()
    );
    Ok(files)
}

/// Splits one file body at its first down marker.
pub(crate) fn split_scripts(path: &Path, body: &str) -> DbResult<(String, String)> {
    let Some(marker) = DOWN_MARKER.find(body) else {
        return Err(malformed(path, "missing `-- Down` marker".to_string()));
    };

    let up = COMMENT_LINE.replace_all(&body[..marker.start()], "");
    let down = &body[marker.end()..];
    Ok((up.trim().to_string(), down.trim().to_string()))
}

fn malformed(path: &Path, reason: String) -> DbError {
    DbError::MalformedMigration {
        file: PathBuf::from(path),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::{read_migration_files, split_scripts};
    use crate::db::DbError;
    use std::path::Path;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn split_strips_up_comments_and_trims() {
        let body = "-- Up\n-- create the table\nCREATE TABLE a (id INTEGER);\n\n-- Down\nDROP TABLE a;\n";
        let (up, down) = split_scripts(Path::new("1-a.sql"), body).unwrap();
        assert_eq!(up, "CREATE TABLE a (id INTEGER);");
        assert_eq!(down, "DROP TABLE a;");
    }

    #[test]
    fn down_marker_is_case_insensitive_and_keeps_down_comments() {
        let body = "CREATE TABLE a (id INTEGER);\n--DOWN\n-- undo\nDROP TABLE a;";
        let (up, down) = split_scripts(Path::new("1-a.sql"), body).unwrap();
        assert_eq!(up, "CREATE TABLE a (id INTEGER);");
        assert_eq!(down, "-- undo\nDROP TABLE a;");
    }

    #[test]
    fn marker_requires_word_boundary() {
        let body = "CREATE TABLE a (id INTEGER);\n-- downgrade notes\n";
        let err = split_scripts(Path::new("1-a.sql"), body).unwrap_err();
        assert!(matches!(err, DbError::MalformedMigration { .. }));
    }

    #[test]
    fn comment_stripping_is_line_based_only() {
        let body = "INSERT INTO notes VALUES ('first\n-- not a comment\nlast');\n-- Down\n";
        let (up, _) = split_scripts(Path::new("1-a.sql"), body).unwrap();
        assert_eq!(up, "INSERT INTO notes VALUES ('first\n\nlast');");
    }

    #[test]
    fn read_orders_by_numeric_id_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "10-late.sql", "SELECT 10;\n-- Down\n");
        write(dir.path(), "2.second.sql", "SELECT 2;\n-- Down\n");
        write(dir.path(), "001-first.sql", "SELECT 1;\n-- Down\n");
        write(dir.path(), "notes.txt", "ignored");
        write(dir.path(), "abc-nope.sql", "ignored");
        std::fs::create_dir(dir.path().join("3-dir.sql")).unwrap();

        let files = read_migration_files(dir.path()).unwrap();
        let ids: Vec<i64> = files.iter().map(|file| file.id).collect();
        let names: Vec<&str> = files.iter().map(|file| file.name.as_str()).collect();
        assert_eq!(ids, vec![1, 2, 10]);
        assert_eq!(names, vec!["first", "second", "late"]);
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let files = read_migration_files(&dir.path().join("absent")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn missing_marker_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1-ok.sql", "SELECT 1;\n-- Down\n");
        write(dir.path(), "2-broken.sql", "SELECT 2;\n");

        let err = read_migration_files(dir.path()).unwrap_err();
        match err {
            DbError::MalformedMigration { file, .. } => {
                assert!(file.ends_with("2-broken.sql"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1-a.sql", "SELECT 1;\n-- Down\n");
        write(dir.path(), "01-b.sql", "SELECT 1;\n-- Down\n");

        let err = read_migration_files(dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate migration id 1"));
    }
}
