//! Identity Index: one stable `FileRecord` per logical file, preserved
//! across renames, directory moves and manual relocations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::Result;
use crate::path::{norm, prefix_swap};

/// The stable logical identity of a single tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub current_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        current_path: PathBuf::from(row.get::<_, String>(1)?),
        created_at: row.get(2)?,
        last_seen_at: row.get(3)?,
    })
}

pub struct IdentityIndex {
    db: Arc<Database>,
}

impl IdentityIndex {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Return the record whose `current_path` equals `path`, if any.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Result<Option<FileRecord>> {
        let key = norm(path).to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, current_path, created_at, last_seen_at
                 FROM file_records WHERE current_path = ?1",
            )?;
            let mut rows = stmt.query_map([&key], row_to_record)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Return the existing record for `path`, attempt identity recovery
    /// using `content_hash` if supplied and no record exists, or create a
    /// brand new record as a last resort.
    pub fn get_or_create(
        &self,
        path: impl AsRef<Path>,
        content_hash: Option<&str>,
    ) -> Result<FileRecord> {
        let path = path.as_ref();
        if let Some(existing) = self.lookup(path)? {
            return Ok(existing);
        }

        if let Some(hash) = content_hash {
            if let Some(recovered) = self.try_recover(path, hash)? {
                return Ok(recovered);
            }
        }

        let key = norm(path).to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_records (current_path) VALUES (?1)",
                [&key],
            )?;
            let id = conn.last_insert_rowid();
            let mut stmt = conn.prepare(
                "SELECT id, current_path, created_at, last_seen_at
                 FROM file_records WHERE id = ?1",
            )?;
            Ok(stmt.query_row([id], row_to_record)?)
        })
    }

    /// `(hash, basename, old-path-missing)` recovery heuristic from §4.3:
    /// find a `FileVersion` with this content hash, linked to a record
    /// whose basename matches `path`'s and whose old path no longer exists
    /// on disk, then rebind that record instead of creating a new one.
    fn try_recover(&self, path: &Path, content_hash: &str) -> Result<Option<FileRecord>> {
        let current_filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        let candidates: Vec<FileRecord> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT fr.id, fr.current_path, fr.created_at, fr.last_seen_at
                 FROM file_versions fv
                 JOIN file_records fr ON fr.id = fv.file_record_id
                 WHERE fv.file_hash = ?1
                 ORDER BY fv.id ASC",
            )?;
            let rows = stmt.query_map([content_hash], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        for candidate in candidates {
            let old_basename = candidate
                .current_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if old_basename != current_filename {
                continue;
            }
            if candidate.current_path.exists() {
                continue;
            }

            let new_key = norm(path).to_string_lossy().to_string();
            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE file_records SET current_path = ?1 WHERE id = ?2",
                    (&new_key, candidate.id),
                )?;
                Ok(())
            })?;

            return Ok(Some(FileRecord {
                current_path: PathBuf::from(new_key),
                ..candidate
            }));
        }

        Ok(None)
    }

    /// Rebind a single record's `current_path` on an observed move.
    pub fn rename(&self, old_path: impl AsRef<Path>, new_path: impl AsRef<Path>) -> Result<Option<FileRecord>> {
        let old_key = norm(old_path).to_string_lossy().to_string();
        let new_key = norm(new_path).to_string_lossy().to_string();

        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE file_records SET current_path = ?1 WHERE current_path = ?2",
                (&new_key, &old_key),
            )?;
            if updated == 0 {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT id, current_path, created_at, last_seen_at
                 FROM file_records WHERE current_path = ?1",
            )?;
            Ok(Some(stmt.query_row([&new_key], row_to_record)?))
        })
    }

    /// Rewrite every record whose `current_path` starts with `old_dir` on a
    /// segment boundary, in a single transaction. Returns the count of
    /// rewritten records.
    pub fn rename_directory(&self, old_dir: impl AsRef<Path>, new_dir: impl AsRef<Path>) -> Result<usize> {
        let old_dir = norm(old_dir);
        let new_dir = norm(new_dir);

        self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare("SELECT id, current_path FROM file_records")?;
            let rows: Vec<(i64, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);

            let mut count = 0;
            for (id, current_path) in rows {
                if let Some(rewritten) = prefix_swap(&current_path, &old_dir, &new_dir) {
                    let rewritten = rewritten.to_string_lossy().to_string();
                    tx.execute(
                        "UPDATE file_records SET current_path = ?1 WHERE id = ?2",
                        (&rewritten, id),
                    )?;
                    count += 1;
                }
            }
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> IdentityIndex {
        IdentityIndex::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn get_or_create_is_idempotent_for_same_path() -> Result<()> {
        let idx = index();
        let a = idx.get_or_create("/w/a.txt", None)?;
        let b = idx.get_or_create("/w/a.txt", None)?;
        assert_eq!(a.id, b.id);
        Ok(())
    }

    #[test]
    fn rename_updates_current_path() -> Result<()> {
        let idx = index();
        let created = idx.get_or_create("/w/a.txt", None)?;
        let renamed = idx.rename("/w/a.txt", "/w/b.txt")?.unwrap();
        assert_eq!(renamed.id, created.id);
        assert_eq!(idx.lookup("/w/b.txt")?.unwrap().id, created.id);
        assert!(idx.lookup("/w/a.txt")?.is_none());
        Ok(())
    }

    #[test]
    fn rename_directory_respects_segment_boundaries() -> Result<()> {
        let idx = index();
        let f = idx.get_or_create("/w/Test/f.txt", None)?;
        let g = idx.get_or_create("/w/Testing/g.txt", None)?;

        let count = idx.rename_directory("/w/Test", "/w/TestNew")?;
        assert_eq!(count, 1);

        assert_eq!(idx.lookup("/w/TestNew/f.txt")?.unwrap().id, f.id);
        assert_eq!(idx.lookup("/w/Testing/g.txt")?.unwrap().id, g.id);
        Ok(())
    }
}
