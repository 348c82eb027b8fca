//! Snapshot Scanner: the initial walk of a newly-added root into a mirror
//! subtree under the CAS root, enqueueing every admitted file into the
//! backup pipeline as it goes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, span, warn, Level};
use walkdir::WalkDir;

use crate::bus::{CoreEvent, EventBus};
use crate::config::SNAPSHOT_BATCH_SIZE;
use crate::db::Database;
use crate::error::Result;
use crate::path::ExclusionSet;
use crate::queue::BackupQueue;

/// Durable progress for one root's initial walk, mirroring the
/// `snapshot_jobs` row.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStats {
    pub total_files: u64,
    pub processed_files: u64,
    pub skipped_files: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

pub struct SnapshotScanner {
    db: Arc<Database>,
    queue: Arc<BackupQueue>,
    exclusions: ExclusionSet,
    bus: EventBus,
    follow_symlinks: bool,
    continue_on_unreadable: bool,
}

impl SnapshotScanner {
    pub fn new(
        db: Arc<Database>,
        queue: Arc<BackupQueue>,
        exclusions: ExclusionSet,
        bus: EventBus,
        follow_symlinks: bool,
        continue_on_unreadable: bool,
    ) -> Self {
        Self {
            db,
            queue,
            exclusions,
            bus,
            follow_symlinks,
            continue_on_unreadable,
        }
    }

    /// `{safe-basename}-{first-6-hex of sha256(root)}`, matching §4.8.
    fn storage_subdir_name(root: &Path) -> String {
        let safe_base: String = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string())
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(root.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{safe_base}-{}", &digest[..6])
    }

    /// Walk `root` depth-first, mirroring admitted files under
    /// `storage_root/{subdir}` and enqueueing each one for backup.
    /// Re-entrant: calling this again for a root that already has a
    /// `snapshot_jobs` row resumes/overwrites its counters.
    pub fn scan(&self, storage_root: &Path, root: &Path) -> Result<SnapshotStats> {
        let span = span!(Level::INFO, "snapshot_scan", root = %root.display());
        let _enter = span.enter();

        let subdir = Self::storage_subdir_name(root);
        let mirror_root = storage_root.join(&subdir);
        std::fs::create_dir_all(&mirror_root)?;

        self.upsert_job_start(root, &subdir)?;
        self.bus.publish(CoreEvent::SnapshotStarted {
            watched_path: root.to_string_lossy().to_string(),
            storage_subdir: subdir.clone(),
        });

        let mut stats = SnapshotStats::default();

        for entry in WalkDir::new(root).follow_links(self.follow_symlinks).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "walk entry error");
                    stats.error_count += 1;
                    stats.last_error = Some(err.to_string());
                    continue;
                }
            };

            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            if self.exclusions.is_excluded(path) {
                debug!(path = %path.display(), "excluded from snapshot");
                continue;
            }
            if !self.follow_symlinks && entry.path_is_symlink() {
                stats.skipped_files += 1;
                continue;
            }

            stats.total_files += 1;

            match self.admit_one(root, path, &mirror_root) {
                Ok(()) => stats.processed_files += 1,
                Err(err) => {
                    if self.continue_on_unreadable {
                        warn!(path = %path.display(), error = %err, "skipping unreadable file");
                        stats.skipped_files += 1;
                        stats.error_count += 1;
                        stats.last_error = Some(err.to_string());
                    } else {
                        self.mark_job_failed(root, &err.to_string())?;
                        return Err(err);
                    }
                }
            }

            if stats.total_files % (SNAPSHOT_BATCH_SIZE as u64) == 0 {
                self.persist_progress(root, &stats)?;
                self.bus.publish(CoreEvent::SnapshotProgress {
                    watched_path: root.to_string_lossy().to_string(),
                    processed: stats.processed_files,
                    total: stats.total_files,
                    skipped: stats.skipped_files,
                    errors: stats.error_count,
                });
            }
        }

        self.persist_progress(root, &stats)?;
        self.mark_job_done(root)?;
        self.bus.publish(CoreEvent::SnapshotComplete {
            watched_path: root.to_string_lossy().to_string(),
            processed: stats.processed_files,
            skipped: stats.skipped_files,
            errors: stats.error_count,
        });

        info!(processed = stats.processed_files, skipped = stats.skipped_files, "snapshot scan complete");
        Ok(stats)
    }

    fn admit_one(&self, root: &Path, path: &Path, mirror_root: &Path) -> Result<()> {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let mirror_dest: PathBuf = mirror_root.join(relative);
        if let Some(parent) = mirror_dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(path, &mirror_dest)?;
        let _ = self.queue.admit(path)?;
        Ok(())
    }

    fn upsert_job_start(&self, root: &Path, subdir: &str) -> Result<()> {
        let path = root.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshot_jobs (watched_path, storage_subdir, status, total_files, processed_files, skipped_files, error_count, last_error)
                 VALUES (?1, ?2, 'running', 0, 0, 0, 0, NULL)
                 ON CONFLICT(watched_path) DO UPDATE SET
                    storage_subdir = excluded.storage_subdir,
                    status = 'running',
                    total_files = 0, processed_files = 0, skipped_files = 0, error_count = 0, last_error = NULL",
                (&path, subdir),
            )?;
            Ok(())
        })
    }

    fn persist_progress(&self, root: &Path, stats: &SnapshotStats) -> Result<()> {
        let path = root.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE snapshot_jobs SET total_files = ?1, processed_files = ?2, skipped_files = ?3, error_count = ?4, last_error = ?5
                 WHERE watched_path = ?6",
                rusqlite::params![
                    stats.total_files as i64,
                    stats.processed_files as i64,
                    stats.skipped_files as i64,
                    stats.error_count as i64,
                    stats.last_error,
                    path,
                ],
            )?;
            Ok(())
        })
    }

    fn mark_job_done(&self, root: &Path) -> Result<()> {
        let path = root.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            conn.execute("UPDATE snapshot_jobs SET status = 'done' WHERE watched_path = ?1", [&path])?;
            Ok(())
        })
    }

    fn mark_job_failed(&self, root: &Path, error: &str) -> Result<()> {
        let path = root.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE snapshot_jobs SET status = 'failed', last_error = ?1 WHERE watched_path = ?2",
                (error, &path),
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suppression::SuppressionSet;
    use tempfile::TempDir;

    fn scanner() -> (SnapshotScanner, Arc<Database>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = Arc::new(BackupQueue::new(
            db.clone(),
            ExclusionSet::new(std::iter::empty()),
            Arc::new(SuppressionSet::new()),
        ));
        (
            SnapshotScanner::new(db.clone(), queue, ExclusionSet::new(std::iter::empty()), EventBus::new(), false, true),
            db,
            dir,
        )
    }

    #[test]
    fn scan_mirrors_admitted_files_and_enqueues_tasks() {
        let (scanner, db, dir) = scanner();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();

        let storage = dir.path().join("storage");
        let stats = scanner.scan(&storage, &root).unwrap();

        assert_eq!(stats.processed_files, 1);
        assert_eq!(stats.total_files, 1);

        let pending: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM backup_tasks", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[test]
    fn scan_skips_excluded_directories() {
        let (scanner, _db, dir) = scanner();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/HEAD"), b"ref").unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();

        let storage = dir.path().join("storage");
        let stats = scanner.scan(&storage, &root).unwrap();
        assert_eq!(stats.total_files, 1);
    }

    #[test]
    fn scan_is_reentrant_and_overwrites_counters() {
        let (scanner, _db, dir) = scanner();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();

        let storage = dir.path().join("storage");
        scanner.scan(&storage, &root).unwrap();
        let second = scanner.scan(&storage, &root).unwrap();
        assert_eq!(second.total_files, 1);
    }
}
