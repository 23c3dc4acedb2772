use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Uploading,
    Uploaded,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(FileStatus::Pending),
            "uploading" => Some(FileStatus::Uploading),
            "uploaded" => Some(FileStatus::Uploaded),
            "error" => Some(FileStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Uploaded | FileStatus::Error)
    }
}

/// Which files a new attempt picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    PendingOnly,
    PendingAndError,
}

impl Selection {
    pub fn from_include_errors(include_errors: bool) -> Self {
        if include_errors {
            Selection::PendingAndError
        } else {
            Selection::PendingOnly
        }
    }

    fn status_clause(&self) -> &'static str {
        match self {
            Selection::PendingOnly => "status = 'pending'",
            Selection::PendingAndError => "status IN ('pending', 'error')",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub source: String,
    pub file_size: Option<i64>,
    pub remote_id: Option<String>,
    pub status: FileStatus,
    pub error: Option<String>,
    pub last_attempt_id: Option<i64>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct AttemptRow {
    pub id: i64,
    pub source: String,
    pub files_count: i64,
    pub successful: Option<i64>,
    pub failed: Option<i64>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub error: bool,
}

/// Outcome of finalizing an attempt.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub attempt_id: i64,
    pub files: Vec<FileRow>,
    pub successful: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummary {
    pub status: String,
    pub count: i64,
    pub total_size: i64,
}

const FILE_COLUMNS: &str =
    "id, path, source, file_size, remote_id, status, error, last_attempt_id, updated_at";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        files_count INTEGER NOT NULL,
        successful_uploads INTEGER NULL,
        failed_uploads INTEGER NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NULL,
        error BOOLEAN NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        source TEXT NOT NULL,
        file_size INTEGER,
        remote_id TEXT,
        status TEXT NOT NULL,
        error TEXT,
        last_attempt_id INTEGER,
        updated_at TEXT NOT NULL,
        UNIQUE(path, source),
        FOREIGN KEY(last_attempt_id) REFERENCES attempts(id)
    );
    CREATE INDEX IF NOT EXISTS idx_files_source_status ON files(source, status);
    CREATE INDEX IF NOT EXISTS idx_files_last_attempt ON files(last_attempt_id);
";

pub fn init_db(db_path: &Path) -> Result<Connection> {
    debug!("Initializing database at: {:?}", db_path);
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        info!("Creating database directory: {:?}", parent);
        fs::create_dir_all(parent).context("create database dir")?;
    }
    let conn = Connection::open(db_path).context("open sqlite db")?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")
        .context("enable WAL")?;
    create_schema(&conn)?;
    info!("Database initialized successfully at {:?}", db_path);
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> Result<()> {
    if let Err(e) = conn.execute_batch(SCHEMA) {
        error!("Failed to initialize database schema: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn map_file_row(row: &Row<'_>) -> rusqlite::Result<FileRow> {
    let status: String = row.get(5)?;
    Ok(FileRow {
        id: row.get(0)?,
        path: row.get(1)?,
        source: row.get(2)?,
        file_size: row.get(3)?,
        remote_id: row.get(4)?,
        // Unknown values only appear if the table was edited by hand.
        status: FileStatus::parse(&status).unwrap_or(FileStatus::Pending),
        error: row.get(6)?,
        last_attempt_id: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Inserts a newly discovered file. Returns `false` when `(source, path)` is already known.
pub fn enroll_file(conn: &Connection, source: &str, path: &str, size: Option<i64>) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO files (path, source, file_size, status, updated_at) VALUES (?, ?, ?, 'pending', ?)
         ON CONFLICT(path, source) DO NOTHING",
        params![path, source, size, now],
    )?;
    if inserted > 0 {
        debug!("Enrolled {} file: {}", source, path);
    }
    Ok(inserted > 0)
}

pub fn get_file(conn: &Connection, source: &str, path: &str) -> Result<Option<FileRow>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE source = ? AND path = ?");
    let row = conn
        .query_row(&sql, params![source, path], map_file_row)
        .optional()?;
    Ok(row)
}

pub fn list_pending_files(
    conn: &Connection,
    source: &str,
    include_errors: bool,
) -> Result<Vec<FileRow>> {
    let selection = Selection::from_include_errors(include_errors);
    let sql = format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE source = ? AND {} ORDER BY id ASC",
        selection.status_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![source], map_file_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_attempt_files(conn: &Connection, attempt_id: i64) -> Result<Vec<FileRow>> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE last_attempt_id = ? ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![attempt_id], map_file_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn start_attempt(conn: &Connection, source: &str, files_count: usize) -> Result<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO attempts (source, files_count, started_at) VALUES (?, ?, ?)",
        params![source, files_count as i64, now],
    )?;
    let id = conn.last_insert_rowid();
    info!("Started attempt {} for {} {} files", id, files_count, source);
    Ok(id)
}

pub fn get_attempt(conn: &Connection, attempt_id: i64) -> Result<Option<AttemptRow>> {
    let row = conn
        .query_row(
            "SELECT id, source, files_count, successful_uploads, failed_uploads, started_at, finished_at, error
             FROM attempts WHERE id = ?",
            params![attempt_id],
            |row| {
                Ok(AttemptRow {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    files_count: row.get(2)?,
                    successful: row.get(3)?,
                    failed: row.get(4)?,
                    started_at: row.get(5)?,
                    finished_at: row.get(6)?,
                    error: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Tags every selected file of the attempt's source with `attempt_id`.
///
/// Selected `error` files are moved back to `pending` so an interrupted run leaves
/// them eligible for the next one.
pub fn mark_files_for_attempt(
    conn: &Connection,
    attempt_id: i64,
    selection: Selection,
) -> Result<usize> {
    let attempt = get_attempt(conn, attempt_id)?
        .with_context(|| format!("attempt {} not found", attempt_id))?;
    let now = Utc::now().to_rfc3339();
    let sql = format!(
        "UPDATE files SET last_attempt_id = ?, status = 'pending', error = NULL, updated_at = ?
         WHERE source = ? AND {}",
        selection.status_clause()
    );
    let updated = conn.execute(&sql, params![attempt_id, now, attempt.source])?;
    debug!("Tagged {} files with attempt {}", updated, attempt_id);
    Ok(updated)
}

pub fn record_success(
    conn: &Connection,
    source: &str,
    path: &str,
    attempt_id: i64,
    remote_id: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE files SET status = 'uploaded', error = NULL, remote_id = ?, last_attempt_id = ?, updated_at = ?
         WHERE path = ? AND source = ?",
        params![remote_id, attempt_id, now, path, source],
    )?;
    if updated == 0 {
        warn!("No {} file record for uploaded path {}", source, path);
    }
    Ok(())
}

pub fn record_failure(conn: &Connection, source: &str, path: &str, error: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE files SET status = 'error', error = ?, remote_id = NULL, updated_at = ?
         WHERE path = ? AND source = ?",
        params![error, now, path, source],
    )?;
    if updated == 0 {
        warn!("No {} file record for failed path {}", source, path);
    }
    Ok(())
}

/// Closes the attempt and counts the files that reached a terminal state under it.
pub fn finish_attempt(
    conn: &Connection,
    attempt_id: i64,
    error_flag: bool,
) -> Result<AttemptResult> {
    let files = list_attempt_files(conn, attempt_id)?;

    let count_with = |status: FileStatus| -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE last_attempt_id = ? AND status = ?",
            params![attempt_id, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    };
    let successful = count_with(FileStatus::Uploaded)?;
    let failed = count_with(FileStatus::Error)?;

    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE attempts SET finished_at = ?, successful_uploads = ?, failed_uploads = ?, error = ?
         WHERE id = ? AND finished_at IS NULL",
        params![now, successful, failed, error_flag, attempt_id],
    )?;
    if updated == 0 {
        match get_attempt(conn, attempt_id)? {
            Some(_) => anyhow::bail!("attempt {} is already finalized", attempt_id),
            None => anyhow::bail!("attempt {} not found", attempt_id),
        }
    }

    info!(
        "Finished attempt {}: {} uploaded, {} failed",
        attempt_id, successful, failed
    );
    Ok(AttemptResult {
        attempt_id,
        files,
        successful,
        failed,
    })
}

/// Count and total size of the files that are not uploaded yet, per status.
pub fn not_uploaded_summary(conn: &Connection) -> Result<Vec<StatusSummary>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*), COALESCE(SUM(file_size), 0) FROM files
         WHERE status != 'uploaded' GROUP BY status ORDER BY status",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(StatusSummary {
                status: row.get(0)?,
                count: row.get(1)?,
                total_size: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn clear_database(conn: &Connection) -> Result<()> {
    info!("Clearing all files and attempts");
    conn.execute_batch("DELETE FROM files; DELETE FROM attempts;")?;
    if let Err(e) = conn.execute_batch("VACUUM;") {
        warn!("Failed to vacuum database: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_db() -> Result<Connection> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(conn)
    }

    #[test]
    fn test_enroll_is_idempotent() -> Result<()> {
        let conn = setup_test_db()?;

        assert!(enroll_file(&conn, "s3", "photos/a.jpg", Some(10))?);
        assert!(!enroll_file(&conn, "s3", "photos/a.jpg", Some(10))?);
        // Same path under another source is a different file.
        assert!(enroll_file(&conn, "urls", "photos/a.jpg", None)?);

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE path = 'photos/a.jpg'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Uploading,
            FileStatus::Uploaded,
            FileStatus::Error,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("complete"), None);
        assert!(FileStatus::Error.is_terminal());
        assert!(!FileStatus::Uploading.is_terminal());
    }

    #[test]
    fn test_success_and_failure_are_exclusive() -> Result<()> {
        let conn = setup_test_db()?;
        enroll_file(&conn, "urls", "https://a", None)?;
        let attempt = start_attempt(&conn, "urls", 1)?;
        mark_files_for_attempt(&conn, attempt, Selection::PendingAndError)?;

        record_failure(&conn, "urls", "https://a", "Status check timeout.")?;
        let file = get_file(&conn, "urls", "https://a")?.unwrap();
        assert_eq!(file.status, FileStatus::Error);
        assert_eq!(file.error.as_deref(), Some("Status check timeout."));
        assert!(file.remote_id.is_none());

        record_success(&conn, "urls", "https://a", attempt, "uuid-1")?;
        let file = get_file(&conn, "urls", "https://a")?.unwrap();
        assert_eq!(file.status, FileStatus::Uploaded);
        assert_eq!(file.remote_id.as_deref(), Some("uuid-1"));
        assert!(file.error.is_none());
        Ok(())
    }

    #[test]
    fn test_mark_resets_errors_to_pending() -> Result<()> {
        let conn = setup_test_db()?;
        enroll_file(&conn, "urls", "https://a", None)?;
        enroll_file(&conn, "urls", "https://b", None)?;
        record_failure(&conn, "urls", "https://b", "boom")?;

        let attempt = start_attempt(&conn, "urls", 2)?;
        let tagged = mark_files_for_attempt(&conn, attempt, Selection::PendingAndError)?;
        assert_eq!(tagged, 2);

        let b = get_file(&conn, "urls", "https://b")?.unwrap();
        assert_eq!(b.status, FileStatus::Pending);
        assert!(b.error.is_none());
        assert_eq!(b.last_attempt_id, Some(attempt));
        Ok(())
    }

    #[test]
    fn test_mark_pending_only_leaves_errors_alone() -> Result<()> {
        let conn = setup_test_db()?;
        enroll_file(&conn, "urls", "https://a", None)?;
        enroll_file(&conn, "urls", "https://b", None)?;
        record_failure(&conn, "urls", "https://b", "boom")?;

        let attempt = start_attempt(&conn, "urls", 1)?;
        assert_eq!(mark_files_for_attempt(&conn, attempt, Selection::PendingOnly)?, 1);

        let b = get_file(&conn, "urls", "https://b")?.unwrap();
        assert_eq!(b.status, FileStatus::Error);
        assert_eq!(b.last_attempt_id, None);
        Ok(())
    }

    #[test]
    fn test_mark_unknown_attempt_fails() -> Result<()> {
        let conn = setup_test_db()?;
        assert!(mark_files_for_attempt(&conn, 42, Selection::PendingOnly).is_err());
        Ok(())
    }

    #[test]
    fn test_finish_attempt_only_once() -> Result<()> {
        let conn = setup_test_db()?;
        let attempt = start_attempt(&conn, "s3", 0)?;
        let result = finish_attempt(&conn, attempt, false)?;
        assert_eq!(result.successful + result.failed, 0);
        assert!(finish_attempt(&conn, attempt, false).is_err());
        assert!(finish_attempt(&conn, attempt + 1, false).is_err());
        Ok(())
    }

    #[test]
    fn test_not_uploaded_summary_groups_by_status() -> Result<()> {
        let conn = setup_test_db()?;
        enroll_file(&conn, "s3", "a", Some(100))?;
        enroll_file(&conn, "s3", "b", Some(50))?;
        enroll_file(&conn, "s3", "c", None)?;
        enroll_file(&conn, "s3", "d", Some(7))?;
        let attempt = start_attempt(&conn, "s3", 2)?;
        record_failure(&conn, "s3", "c", "nope")?;
        record_success(&conn, "s3", "d", attempt, "uuid")?;

        let summary = not_uploaded_summary(&conn)?;
        assert_eq!(
            summary,
            vec![
                StatusSummary {
                    status: "error".into(),
                    count: 1,
                    total_size: 0,
                },
                StatusSummary {
                    status: "pending".into(),
                    count: 2,
                    total_size: 150,
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_clear_database() -> Result<()> {
        let conn = setup_test_db()?;
        enroll_file(&conn, "s3", "a", Some(1))?;
        start_attempt(&conn, "s3", 1)?;
        clear_database(&conn)?;
        assert!(get_file(&conn, "s3", "a")?.is_none());
        assert!(get_attempt(&conn, 1)?.is_none());
        Ok(())
    }
}
