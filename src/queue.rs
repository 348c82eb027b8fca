//! Backup Pipeline: a persistent, debounced, at-most-one-in-flight task
//! queue that sits between the filesystem monitor and the CAS store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cas::CasStore;
use crate::config::{ADMISSION_REJECTED_SUFFIXES, BACKUP_DEBOUNCE};
use crate::db::Database;
use crate::error::Result;
use crate::identity::IdentityIndex;
use crate::path::{norm, ExclusionSet};
use crate::suppression::SuppressionSet;
use crate::version::VersionIndex;

/// Reason a candidate path was not enqueued. Useful for tests and logging;
/// never surfaced as an error since admission rejection is routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    RejectedSuffix,
    Excluded,
    RestoreSuppressed,
    Debounced,
    AlreadyInFlight,
}

/// Gatekeeper applied in the watcher thread before a `BackupTask` is ever
/// written: suffix rejection, exclusion, restore-suppression, debounce and
/// in-flight checks, in that order (§4.5).
pub struct BackupQueue {
    db: Arc<Database>,
    exclusions: ExclusionSet,
    suppression: Arc<SuppressionSet>,
    last_enqueued: Mutex<HashMap<String, Instant>>,
    debounce: Duration,
}

impl BackupQueue {
    pub fn new(db: Arc<Database>, exclusions: ExclusionSet, suppression: Arc<SuppressionSet>) -> Self {
        Self {
            db,
            exclusions,
            suppression,
            last_enqueued: Mutex::new(HashMap::new()),
            debounce: BACKUP_DEBOUNCE,
        }
    }

    /// The exclusion set this queue admits against, shared with the initial
    /// snapshot scanner so both paths honor the same configured union.
    pub fn exclusions(&self) -> ExclusionSet {
        self.exclusions.clone()
    }

    fn has_rejected_suffix(path: &Path) -> bool {
        let name = path.to_string_lossy();
        ADMISSION_REJECTED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }

    fn is_in_flight(&self, key: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM backup_tasks WHERE src_path = ?1 AND status IN ('pending', 'processing')",
                [key],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn is_debounced(&self, key: &str) -> bool {
        let entries = self.last_enqueued.lock().expect("debounce mutex poisoned");
        match entries.get(key) {
            Some(last) => last.elapsed() < self.debounce,
            None => false,
        }
    }

    /// Apply admission rules and, if admitted, append a pending
    /// `BackupTask`. Returns `Ok(None)` on success, `Ok(Some(reason))` if
    /// rejected.
    pub fn admit(&self, path: impl AsRef<Path>) -> Result<Option<Rejection>> {
        let path = path.as_ref();
        let key = norm(path).to_string_lossy().to_string();

        if Self::has_rejected_suffix(path) {
            return Ok(Some(Rejection::RejectedSuffix));
        }
        if self.exclusions.is_excluded(path) {
            return Ok(Some(Rejection::Excluded));
        }
        if self.suppression.is_suppressed(path) {
            return Ok(Some(Rejection::RestoreSuppressed));
        }
        if self.is_debounced(&key) {
            return Ok(Some(Rejection::Debounced));
        }
        if self.is_in_flight(&key)? {
            return Ok(Some(Rejection::AlreadyInFlight));
        }

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO backup_tasks (src_path, status) VALUES (?1, 'pending')",
                [&key],
            )?;
            Ok(())
        })?;

        self.last_enqueued
            .lock()
            .expect("debounce mutex poisoned")
            .insert(key, Instant::now());

        debug!(path = %path.display(), "backup task enqueued");
        Ok(None)
    }
}

struct ClaimedTask {
    id: i64,
    src_path: String,
}

/// Drains the durable task queue and drives the CAS and the identity/version
/// indexes on its behalf. One worker is sufficient; more than one may run
/// concurrently since claiming a task is a single atomic transaction.
pub struct BackupWorker {
    db: Arc<Database>,
    cas: Arc<CasStore>,
    identity: Arc<IdentityIndex>,
    versions: Arc<VersionIndex>,
}

impl BackupWorker {
    pub fn new(
        db: Arc<Database>,
        cas: Arc<CasStore>,
        identity: Arc<IdentityIndex>,
        versions: Arc<VersionIndex>,
    ) -> Self {
        Self {
            db,
            cas,
            identity,
            versions,
        }
    }

    /// Attempt to claim and process the single oldest pending task. Returns
    /// `true` if a task was found (processed or failed), `false` if the
    /// queue was empty.
    pub fn run_once(&self) -> Result<bool> {
        let Some(task) = self.claim_oldest_pending()? else {
            return Ok(false);
        };
        self.process(task)?;
        Ok(true)
    }

    fn claim_oldest_pending(&self) -> Result<Option<ClaimedTask>> {
        self.db.with_transaction(|tx| {
            let candidate: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, src_path FROM backup_tasks WHERE status = 'pending' ORDER BY id ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .ok();

            let Some((id, src_path)) = candidate else {
                return Ok(None);
            };

            let claimed = tx.execute(
                "UPDATE backup_tasks
                 SET status = 'processing', attempts = attempts + 1, updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'pending'",
                [id],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            Ok(Some(ClaimedTask { id, src_path }))
        })
    }

    fn mark_failed(&self, task_id: i64, reason: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE backup_tasks SET status = 'failed', last_error = ?1, updated_at = datetime('now') WHERE id = ?2",
                (reason, task_id),
            )?;
            Ok(())
        })
    }

    fn mark_done(&self, task_id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE backup_tasks SET status = 'done', updated_at = datetime('now') WHERE id = ?1",
                [task_id],
            )?;
            Ok(())
        })
    }

    fn process(&self, task: ClaimedTask) -> Result<()> {
        let path = std::path::Path::new(&task.src_path);

        let hash = match CasStore::hash_file(path) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(path = %task.src_path, error = %err, "file gone before hashing, failing task");
                return self.mark_failed(task.id, &err.to_string());
            }
        };

        let result = (|| -> Result<()> {
            let record = self.identity.get_or_create(path, Some(&hash))?;
            let history = self.versions.list_versions(record.id, Some(&task.src_path))?;

            if let Some(newest) = history.first() {
                if newest.file_hash.as_deref() == Some(hash.as_str()) {
                    info!(path = %task.src_path, "content unchanged, skipping version");
                    return Ok(());
                }
            }

            let meta = self.cas.write(path, Some(&hash))?;
            self.versions.insert(
                record.id,
                &task.src_path,
                &meta.storage_path.to_string_lossy(),
                Some(&meta.file_hash),
                Some(meta.file_size as i64),
            )?;
            info!(path = %task.src_path, hash = %meta.file_hash, dedup = meta.dedup_hit, "new version recorded");
            Ok(())
        })();

        match result {
            Ok(()) => self.mark_done(task.id),
            Err(err) => self.mark_failed(task.id, &err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasStore;
    use tempfile::TempDir;

    fn queue() -> (BackupQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let exclusions = ExclusionSet::new(std::iter::empty());
        let suppression = Arc::new(SuppressionSet::new());
        (BackupQueue::new(db, exclusions, suppression), dir)
    }

    #[test]
    fn rejects_transient_write_suffixes() {
        let (queue, dir) = queue();
        let result = queue.admit(dir.path().join("a.txt.tmp")).unwrap();
        assert_eq!(result, Some(Rejection::RejectedSuffix));
    }

    #[test]
    fn rejects_excluded_paths() {
        let (queue, dir) = queue();
        let result = queue.admit(dir.path().join(".git/HEAD")).unwrap();
        assert_eq!(result, Some(Rejection::Excluded));
    }

    #[test]
    fn admits_then_debounces_rapid_repeats() {
        let (queue, dir) = queue();
        let path = dir.path().join("a.txt");
        assert_eq!(queue.admit(&path).unwrap(), None);
        assert_eq!(queue.admit(&path).unwrap(), Some(Rejection::Debounced));
    }

    #[test]
    fn rejects_while_a_task_is_already_in_flight() {
        let (queue, dir) = queue();
        let path = dir.path().join("a.txt");
        assert_eq!(queue.admit(&path).unwrap(), None);

        // simulate debounce window elapsing without the task completing
        queue.last_enqueued.lock().unwrap().clear();
        assert_eq!(queue.admit(&path).unwrap(), Some(Rejection::AlreadyInFlight));
    }

    #[test]
    fn worker_records_a_version_for_a_new_file() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("storage");
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"v1").unwrap();

        let db = Arc::new(Database::open_in_memory().unwrap());
        let cas = Arc::new(CasStore::new(&storage).unwrap());
        let identity = Arc::new(IdentityIndex::new(db.clone()));
        let versions = Arc::new(VersionIndex::new(db.clone()));

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO backup_tasks (src_path, status) VALUES (?1, 'pending')",
                [file.to_string_lossy().to_string()],
            )?;
            Ok(())
        })
        .unwrap();

        let worker = BackupWorker::new(db.clone(), cas, identity, versions.clone());
        assert!(worker.run_once().unwrap());

        let record_id = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT file_record_id FROM file_versions LIMIT 1", [], |row| {
                    row.get::<_, i64>(0)
                })?)
            })
            .unwrap();
        let history = versions.list_versions(record_id, None).unwrap();
        assert_eq!(history.len(), 1);
    }
}
