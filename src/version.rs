//! Version Index: a dense, monotonically increasing `version_number` per
//! `FileRecord`, with content-level dedup handled one layer down in the
//! CAS (two versions of the same `FileRecord` may point at the same
//! `storage_path`).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    pub id: i64,
    pub file_record_id: i64,
    pub original_path: String,
    pub storage_path: String,
    pub version_number: i64,
    pub file_hash: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

fn row_to_version(row: &rusqlite::Row) -> rusqlite::Result<FileVersion> {
    Ok(FileVersion {
        id: row.get(0)?,
        file_record_id: row.get(1)?,
        original_path: row.get(2)?,
        storage_path: row.get(3)?,
        version_number: row.get(4)?,
        file_hash: row.get(5)?,
        file_size_bytes: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const SELECT_COLUMNS: &str =
    "id, file_record_id, original_path, storage_path, version_number, file_hash, file_size_bytes, created_at";

pub struct VersionIndex {
    db: Arc<Database>,
}

impl VersionIndex {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a new version for `file_record_id`, assigning the next dense
    /// `version_number` inside one transaction so concurrent writers can
    /// never collide or leave a gap.
    pub fn insert(
        &self,
        file_record_id: i64,
        original_path: &str,
        storage_path: &str,
        file_hash: Option<&str>,
        file_size_bytes: Option<i64>,
    ) -> Result<FileVersion> {
        self.db.with_transaction(|tx| {
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version_number), 0) + 1 FROM file_versions WHERE file_record_id = ?1",
                [file_record_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO file_versions
                    (file_record_id, original_path, storage_path, version_number, file_hash, file_size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![file_record_id, original_path, storage_path, next, file_hash, file_size_bytes],
            )?;
            let id = tx.last_insert_rowid();

            let sql = format!("SELECT {SELECT_COLUMNS} FROM file_versions WHERE id = ?1");
            Ok(tx.query_row(&sql, [id], row_to_version)?)
        })
    }

    /// Next number `insert` would assign, without reserving it. Exposed for
    /// callers that need to preview the number before committing a write.
    pub fn next_version_number(&self, file_record_id: i64) -> Result<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(version_number), 0) + 1 FROM file_versions WHERE file_record_id = ?1",
                [file_record_id],
                |row| row.get(0),
            )?)
        })
    }

    /// All versions for `file_record_id`, newest first. Falls back to
    /// matching on `original_path` when the record has no identity-indexed
    /// rows yet (covers history recorded before an `IdentityIndex` rebind).
    pub fn list_versions(&self, file_record_id: i64, fallback_path: Option<&str>) -> Result<Vec<FileVersion>> {
        let by_id: Vec<FileVersion> = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM file_versions WHERE file_record_id = ?1 ORDER BY version_number DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([file_record_id], row_to_version)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        if !by_id.is_empty() {
            return Ok(by_id);
        }

        let Some(path) = fallback_path else {
            return Ok(by_id);
        };

        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM file_versions WHERE original_path = ?1 ORDER BY version_number DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([path], row_to_version)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// The highest-numbered version for a record, i.e. its current content.
    pub fn current_version(&self, file_record_id: i64) -> Result<Option<FileVersion>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM file_versions WHERE file_record_id = ?1 ORDER BY version_number DESC LIMIT 1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map([file_record_id], row_to_version)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// A specific version by number, or `NotFound`.
    pub fn get_version(&self, file_record_id: i64, version_number: i64) -> Result<FileVersion> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM file_versions WHERE file_record_id = ?1 AND version_number = ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map([file_record_id, version_number], row_to_version)?;
            rows.next()
                .transpose()?
                .ok_or_else(|| Error::not_found(format!("version {version_number} of record {file_record_id}")))
        })
    }

    /// Every distinct `storage_path` ever recorded, i.e. the GC active set.
    pub fn all_storage_paths(&self) -> Result<HashSet<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT storage_path FROM file_versions")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = HashSet::new();
            for row in rows {
                out.insert(row?);
            }
            Ok(out)
        })
    }
}
