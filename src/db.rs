//! Persisted relational schema backing the core (§6: "a contract, not
//! implementation"). A small forward-only migration runner keyed off
//! `PRAGMA user_version` creates the tables §3/§6 describe; the relational
//! invariants (unique `current_path`, dense `version_number`, at-most-one
//! in-flight `BackupTask` per path) are expressed as SQL constraints so the
//! database itself — not hand-rolled locking — is the source of truth.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE watched_paths (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        path        TEXT NOT NULL UNIQUE,
        is_active   INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE file_records (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        current_path  TEXT NOT NULL UNIQUE,
        created_at    TEXT NOT NULL DEFAULT (datetime('now')),
        last_seen_at  TEXT
    );

    CREATE TABLE file_versions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        file_record_id   INTEGER REFERENCES file_records(id),
        original_path    TEXT NOT NULL,
        storage_path     TEXT NOT NULL,
        version_number   INTEGER NOT NULL,
        file_hash        TEXT,
        file_size_bytes  INTEGER,
        created_at       TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(file_record_id, version_number)
    );
    CREATE INDEX file_versions_original_path ON file_versions(original_path);
    CREATE INDEX file_versions_file_hash ON file_versions(file_hash);

    CREATE TABLE file_events (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type    TEXT NOT NULL,
        src_path      TEXT NOT NULL,
        dest_path     TEXT,
        timestamp     TEXT NOT NULL DEFAULT (datetime('now')),
        is_processed  INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX file_events_src_path ON file_events(src_path);

    CREATE TABLE backup_tasks (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        src_path    TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'pending',
        attempts    INTEGER NOT NULL DEFAULT 0,
        last_error  TEXT,
        created_at  TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
    );
    -- at-most-one-in-flight per src_path, enforced by the database itself.
    CREATE UNIQUE INDEX backup_tasks_inflight_unique
        ON backup_tasks(src_path)
        WHERE status IN ('pending', 'processing');

    CREATE TABLE snapshot_jobs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        watched_path     TEXT NOT NULL UNIQUE,
        storage_subdir   TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        total_files      INTEGER NOT NULL DEFAULT 0,
        processed_files  INTEGER NOT NULL DEFAULT 0,
        skipped_files    INTEGER NOT NULL DEFAULT 0,
        error_count      INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT
    );

    CREATE TABLE activity_logs (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        activity_type  TEXT NOT NULL,
        app_name       TEXT,
        details        TEXT,
        start_time     TEXT NOT NULL DEFAULT (datetime('now')),
        end_time       TEXT
    );

    CREATE TABLE settings (
        key    TEXT PRIMARY KEY,
        value  TEXT
    );
    "#,
];

/// A thread-safe handle to the SQLite-backed schema. Every subsystem
/// (identity, version, queue, watcher, engine) shares one `Database`
/// behind an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `path`, running any
    /// migrations that haven't applied yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database, useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        let current_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i64;
            if version <= current_version {
                continue;
            }
            conn.execute_batch(migration)?;
            conn.pragma_update(None, "user_version", version)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the underlying connection. Every
    /// relational operation in this crate goes through a single lock
    /// acquisition per call, matching §5's "single transaction per
    /// operation" requirement.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        f(&conn)
    }

    /// Run `f` inside an explicit transaction, committing on `Ok` and
    /// rolling back on `Err`. Used for multi-statement operations that must
    /// be all-or-nothing (directory rename, recovery scans).
    pub fn with_transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_across_reopen() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("db.sqlite");

        {
            let _db = Database::open(&path)?;
        }
        // Reopening must not try to re-run migrations against existing tables.
        let _db = Database::open(&path)?;
        Ok(())
    }

    #[test]
    fn backup_tasks_inflight_index_rejects_duplicates() -> Result<()> {
        let db = Database::open_in_memory()?;
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO backup_tasks (src_path, status) VALUES (?1, 'pending')",
                ["/a.txt"],
            )?;
            Ok(())
        })?;

        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO backup_tasks (src_path, status) VALUES (?1, 'pending')",
                ["/a.txt"],
            )?;
            Ok(())
        });
        assert!(result.is_err());
        Ok(())
    }
}
