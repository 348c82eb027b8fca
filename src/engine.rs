//! Top-level orchestrator: wires every subsystem together and exposes the
//! command surface consumed by external handlers (§6). This is the one
//! place that owns all three logical threads (watcher, GC, backup worker).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::bus::{Envelope, EventBus};
use crate::cas::CasStore;
use crate::config::{Config, GC_GRACE_PERIOD, GC_INTERVAL};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::identity::IdentityIndex;
use crate::path::{within, ExclusionSet};
use crate::queue::{BackupQueue, BackupWorker};
use crate::suppression::SuppressionSet;
use crate::version::{FileVersion, VersionIndex};
use crate::watcher::{FsMonitor, WatchedRoot};

#[derive(Debug, Clone)]
pub struct CurrentVersion {
    pub file_hash: Option<String>,
    pub matches_version: bool,
    pub version_id: Option<i64>,
    pub version_number: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum VersionContent {
    Text(String),
    Binary,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub status: &'static str,
    pub path: PathBuf,
    pub version: FileVersion,
}

#[derive(Debug, Clone)]
pub struct FileEventRecord {
    pub id: i64,
    pub event_type: String,
    pub src_path: String,
    pub dest_path: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct Engine {
    db: Arc<Database>,
    cas: Arc<CasStore>,
    identity: Arc<IdentityIndex>,
    versions: Arc<VersionIndex>,
    queue: Arc<BackupQueue>,
    suppression: Arc<SuppressionSet>,
    bus: EventBus,
    monitor: Mutex<Option<FsMonitor>>,
    storage_root: PathBuf,
    shutdown: Arc<AtomicBool>,
    worker_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    gc_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Engine {
    pub fn open(config: Config, db_path: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_root)?;
        let db = Arc::new(Database::open(db_path)?);
        let cas = Arc::new(CasStore::new(&config.storage_root)?);
        let identity = Arc::new(IdentityIndex::new(db.clone()));
        let versions = Arc::new(VersionIndex::new(db.clone()));
        let suppression = Arc::new(SuppressionSet::new());
        let exclusions = ExclusionSet::new(config.custom_exclusions.clone());
        let queue = Arc::new(BackupQueue::new(db.clone(), exclusions, suppression.clone()));

        Ok(Self {
            db,
            cas,
            identity,
            versions,
            queue,
            suppression,
            bus: EventBus::new(),
            monitor: Mutex::new(None),
            storage_root: config.storage_root,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker_handle: Mutex::new(None),
            gc_handle: Mutex::new(None),
        })
    }

    /// Start the watcher, GC and backup-worker threads. Idempotent: calling
    /// twice replaces the watcher rather than leaking a second one.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.shutdown.store(false, Ordering::SeqCst);

        let roots = self.active_roots()?;
        let monitor = FsMonitor::spawn(
            self.db.clone(),
            self.queue.clone(),
            self.identity.clone(),
            self.bus.clone(),
            roots,
        );
        *self.monitor.lock().expect("monitor mutex poisoned") = Some(monitor);

        self.spawn_worker();
        self.spawn_gc();
        Ok(())
    }

    /// Cooperative shutdown, per §5: stop the watcher (it drains one more
    /// command then exits), let the worker finish whatever task it already
    /// claimed, then stop the GC thread. Blocks until every thread has
    /// joined.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(mut monitor) = self.monitor.lock().expect("monitor mutex poisoned").take() {
            monitor.stop();
        }
        if let Some(handle) = self.worker_handle.lock().expect("worker handle mutex poisoned").take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.gc_handle.lock().expect("gc handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = std::thread::spawn(move || {
            let worker = BackupWorker::new(
                engine.db.clone(),
                engine.cas.clone(),
                engine.identity.clone(),
                engine.versions.clone(),
            );
            while !engine.shutdown.load(Ordering::SeqCst) {
                match worker.run_once() {
                    Ok(true) => continue,
                    Ok(false) => std::thread::sleep(Duration::from_millis(100)),
                    Err(err) => {
                        error!(error = %err, "backup worker iteration failed");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        });
        *self.worker_handle.lock().expect("worker handle mutex poisoned") = Some(handle);
    }

    fn spawn_gc(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = std::thread::spawn(move || {
            while !engine.shutdown.load(Ordering::SeqCst) {
                if sleep_interruptible(GC_INTERVAL, &engine.shutdown) {
                    break;
                }
                match engine.active_storage_basenames() {
                    Ok(names) => {
                        let report = engine.cas.gc(&names, GC_GRACE_PERIOD);
                        if !report.errors.is_empty() {
                            error!(errors = ?report.errors, "garbage collection pass had errors");
                        }
                        info!(removed = report.removed.len(), freed = report.freed_bytes, "garbage collection pass complete");
                    }
                    Err(err) => {
                        error!(error = %err, "garbage collection pass failed to list active storage paths, backing off");
                        if sleep_interruptible(Duration::from_secs(60), &engine.shutdown) {
                            break;
                        }
                    }
                }
            }
        });
        *self.gc_handle.lock().expect("gc handle mutex poisoned") = Some(handle);
    }

    fn active_roots(&self) -> Result<Vec<WatchedRoot>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, path FROM watched_paths WHERE is_active = 1")?;
            let rows = stmt.query_map([], |row| {
                Ok(WatchedRoot {
                    id: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn resync_watches(&self) -> Result<()> {
        let roots = self.active_roots()?;
        if let Some(monitor) = self.monitor.lock().expect("monitor mutex poisoned").as_ref() {
            monitor.sync_watches(roots);
        }
        Ok(())
    }

    pub fn add_watched_root(&self, path: impl AsRef<Path>) -> Result<i64> {
        let path = crate::path::norm(path).to_string_lossy().to_string();
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO watched_paths (path, is_active) VALUES (?1, 1)
                 ON CONFLICT(path) DO UPDATE SET is_active = 1",
                [&path],
            )?;
            Ok(conn.query_row("SELECT id FROM watched_paths WHERE path = ?1", [&path], |row| row.get(0))?)
        })?;
        self.resync_watches()?;
        Ok(id)
    }

    pub fn remove_watched_root(&self, id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("UPDATE watched_paths SET is_active = 0 WHERE id = ?1", [id])?;
            Ok(())
        })?;
        self.resync_watches()
    }

    /// Relink an existing root to a new location. `move_files` additionally
    /// moves the files on disk; either way every tracked identity under
    /// `old` is rewritten to `new`.
    pub fn relink_root(&self, old: impl AsRef<Path>, new: impl AsRef<Path>, move_files: bool) -> Result<usize> {
        let old = old.as_ref();
        let new = new.as_ref();

        if move_files {
            std::fs::rename(old, new)?;
        }

        let old_key = crate::path::norm(old).to_string_lossy().to_string();
        let new_key = crate::path::norm(new).to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE watched_paths SET path = ?1 WHERE path = ?2",
                (&new_key, &old_key),
            )?;
            Ok(())
        })?;

        let count = self.identity.rename_directory(old, new)?;
        self.resync_watches()?;
        Ok(count)
    }

    fn find_record_id(&self, path: &Path) -> Result<Option<i64>> {
        Ok(self.identity.lookup(path)?.map(|r| r.id))
    }

    pub fn list_versions(&self, path: impl AsRef<Path>) -> Result<Vec<FileVersion>> {
        let path = path.as_ref();
        let key = path.to_string_lossy().to_string();
        match self.find_record_id(path)? {
            Some(id) => self.versions.list_versions(id, Some(&key)),
            None => self.versions.list_versions(-1, Some(&key)),
        }
    }

    pub fn current_version(&self, path: impl AsRef<Path>) -> Result<CurrentVersion> {
        let path = path.as_ref();
        let hash = CasStore::hash_file(path).ok();

        let history = self.list_versions(path)?;
        let Some(newest) = history.first() else {
            return Ok(CurrentVersion {
                file_hash: hash,
                matches_version: false,
                version_id: None,
                version_number: None,
            });
        };

        let matches = hash.is_some() && hash == newest.file_hash;
        Ok(CurrentVersion {
            file_hash: hash,
            matches_version: matches,
            version_id: Some(newest.id),
            version_number: Some(newest.version_number),
        })
    }

    fn version_by_id(&self, version_id: i64) -> Result<FileVersion> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_record_id, original_path, storage_path, version_number, file_hash, file_size_bytes, created_at
                 FROM file_versions WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map([version_id], |row| {
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
            })?;
            rows.next()
                .transpose()?
                .ok_or_else(|| Error::not_found(format!("version {version_id}")))
        })
    }

    pub fn version_content(&self, version_id: i64) -> Result<VersionContent> {
        let version = self.version_by_id(version_id)?;
        let temp = tempfile::NamedTempFile::new()?;
        self.cas.restore(&version.storage_path, temp.path())?;
        let bytes = std::fs::read(temp.path())?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(VersionContent::Text(text)),
            Err(_) => Ok(VersionContent::Binary),
        }
    }

    /// Restore `version_id` to `dest_path` (defaulting to the version's
    /// `original_path`). The destination must be absolute and inside an
    /// active watched root.
    pub fn restore(&self, version_id: i64, dest_path: Option<PathBuf>) -> Result<RestoreOutcome> {
        let version = self.version_by_id(version_id)?;
        let dest = dest_path.unwrap_or_else(|| PathBuf::from(&version.original_path));

        if !dest.is_absolute() {
            return Err(Error::bad_request("restore destination must be absolute"));
        }

        let roots: Vec<PathBuf> = self
            .active_roots()?
            .into_iter()
            .map(|r| r.path)
            .collect();
        if !within(&dest, &roots) {
            return Err(Error::forbidden("restore destination is outside any active watched root"));
        }

        self.suppression.register_restore_start(&dest);
        self.cas.restore(&version.storage_path, &dest)?;

        Ok(RestoreOutcome {
            status: "restored",
            path: dest,
            version,
        })
    }

    pub fn recent_events(&self, limit: i64) -> Result<Vec<FileEventRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, src_path, dest_path, timestamp FROM file_events ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok(FileEventRecord {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    src_path: row.get(2)?,
                    dest_path: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn snapshot_progress(&self) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn queue(&self) -> Arc<BackupQueue> {
        self.queue.clone()
    }

    pub fn identity(&self) -> Arc<IdentityIndex> {
        self.identity.clone()
    }

    pub fn versions(&self) -> Arc<VersionIndex> {
        self.versions.clone()
    }

    pub fn cas(&self) -> Arc<CasStore> {
        self.cas.clone()
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Basenames of every `storage_path` ever recorded — the GC active set.
    pub fn active_storage_basenames(&self) -> Result<std::collections::HashSet<String>> {
        let paths = self.versions.all_storage_paths()?;
        Ok(paths
            .iter()
            .filter_map(|p| Path::new(p).file_name().map(|n| n.to_string_lossy().to_string()))
            .collect())
    }
}

/// Sleep for `duration` in short slices, waking early if `flag` is set.
/// Returns `true` if it woke early because of a shutdown request.
fn sleep_interruptible(duration: Duration, flag: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(200);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    flag.load(Ordering::SeqCst)
}
