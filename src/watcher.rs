//! Filesystem Monitor: converts raw OS notifications into semantic events,
//! drives the backup queue, and keeps a non-recursive watch on each root's
//! parent so a root rename or deletion can be detected.
//!
//! All `notify::Watcher` registration calls happen on one thread — some
//! platforms bind watch handles to the thread that created them — so every
//! `schedule`/`unschedule` is routed through a command channel and consumed
//! only there.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tracing::{error, info, warn};

use crate::bus::{CoreEvent, EventBus};
use crate::db::Database;
use crate::identity::IdentityIndex;
use crate::path::{norm, prefix_swap};
use crate::queue::BackupQueue;

/// A root directory under watch, as loaded from `watched_paths`.
#[derive(Debug, Clone)]
pub struct WatchedRoot {
    pub id: i64,
    pub path: PathBuf,
}

enum Command {
    Sync(Vec<WatchedRoot>),
    Stop,
}

/// Handle to the running watcher thread. Dropping or calling [`stop`] tears
/// the thread down; it drains one more command before exiting, per the
/// cooperative-shutdown contract.
pub struct FsMonitor {
    commands: Sender<Command>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl FsMonitor {
    /// Spawn the watcher thread. `roots` is the initial set of active
    /// watched roots.
    pub fn spawn(
        db: Arc<Database>,
        queue: Arc<BackupQueue>,
        identity: Arc<IdentityIndex>,
        bus: EventBus,
        roots: Vec<WatchedRoot>,
    ) -> Self {
        let (tx, rx) = channel();
        let tx_for_sync = tx.clone();

        let handle = std::thread::spawn(move || {
            run(rx, db, queue, identity, bus);
        });

        tx_for_sync
            .send(Command::Sync(roots))
            .expect("watcher thread died before first sync");

        Self {
            commands: tx,
            handle: Some(handle),
        }
    }

    /// Reconcile OS-level watches with the given set of active roots.
    /// Idempotent: calling twice with the same set changes nothing.
    pub fn sync_watches(&self, roots: Vec<WatchedRoot>) {
        let _ = self.commands.send(Command::Sync(roots));
    }

    pub fn stop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FsMonitor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

struct WatchSet {
    /// root path -> (watcher owning the recursive watch, watcher owning the parent watch)
    roots: HashMap<PathBuf, (RecommendedWatcher, RecommendedWatcher)>,
}

impl WatchSet {
    fn new() -> Self {
        Self { roots: HashMap::new() }
    }
}

fn run(
    commands: Receiver<Command>,
    db: Arc<Database>,
    queue: Arc<BackupQueue>,
    identity: Arc<IdentityIndex>,
    bus: EventBus,
) {
    let (event_tx, event_rx) = channel::<notify::Result<Event>>();
    let mut watches = WatchSet::new();
    let mut active_roots: Vec<WatchedRoot> = Vec::new();

    loop {
        match commands.recv_timeout(Duration::from_millis(50)) {
            Ok(Command::Sync(roots)) => {
                active_roots = roots;
                reconcile(&mut watches, &active_roots, event_tx.clone());
            }
            Ok(Command::Stop) => {
                info!("watcher thread stopping");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        while let Ok(result) = event_rx.try_recv() {
            match result {
                Ok(event) => handle_event(&event, &active_roots, &db, &queue, &identity, &bus, &commands),
                Err(err) => warn!(error = %err, "watch notification error"),
            }
        }
    }
}

fn reconcile(
    watches: &mut WatchSet,
    active_roots: &[WatchedRoot],
    event_tx: Sender<notify::Result<Event>>,
) {
    let active_paths: Vec<PathBuf> = active_roots.iter().map(|r| norm(&r.path)).collect();

    watches
        .roots
        .retain(|path, _| active_paths.iter().any(|p| p == path));

    for root in active_roots {
        let key = norm(&root.path);
        if watches.roots.contains_key(&key) {
            continue;
        }

        let recursive_tx = event_tx.clone();
        let recursive = match RecommendedWatcher::new(
            move |res| {
                let _ = recursive_tx.send(res);
            },
            notify::Config::default(),
        ) {
            Ok(mut watcher) => {
                if let Err(err) = watcher.watch(&root.path, RecursiveMode::Recursive) {
                    error!(path = %root.path.display(), error = %err, "failed to watch root");
                }
                watcher
            }
            Err(err) => {
                error!(error = %err, "failed to create recursive watcher");
                continue;
            }
        };

        let Some(parent) = root.path.parent() else {
            watches.roots.insert(key, (recursive, make_noop_watcher()));
            continue;
        };

        let parent_tx = event_tx.clone();
        let parent_watcher = match RecommendedWatcher::new(
            move |res| {
                let _ = parent_tx.send(res);
            },
            notify::Config::default(),
        ) {
            Ok(mut watcher) => {
                if let Err(err) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                    error!(path = %parent.display(), error = %err, "failed to watch parent of root");
                }
                watcher
            }
            Err(err) => {
                error!(error = %err, "failed to create parent watcher");
                make_noop_watcher()
            }
        };

        watches.roots.insert(key, (recursive, parent_watcher));
        info!(path = %root.path.display(), "root scheduled for watching");
    }
}

fn make_noop_watcher() -> RecommendedWatcher {
    RecommendedWatcher::new(|_res: notify::Result<Event>| {}, notify::Config::default())
        .expect("failed to build placeholder watcher")
}

fn handle_event(
    event: &Event,
    active_roots: &[WatchedRoot],
    db: &Arc<Database>,
    queue: &Arc<BackupQueue>,
    identity: &Arc<IdentityIndex>,
    bus: &EventBus,
    commands: &Receiver<Command>,
) {
    let is_directory_event = event.paths.iter().any(|p| p.is_dir())
        || matches!(event.kind, EventKind::Remove(RemoveKind::Folder) | EventKind::Create(CreateKind::Folder));

    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                if !is_directory_event {
                    log_event(db, "created", path, None);
                    bus.publish(CoreEvent::FileCreated { path: path.to_string_lossy().to_string() });
                    let _ = queue.admit(path);
                }
            }
        }
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            for path in &event.paths {
                if !is_directory_event {
                    log_event(db, "modified", path, None);
                    bus.publish(CoreEvent::FileModified { path: path.to_string_lossy().to_string() });
                    let _ = queue.admit(path);
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if is_root(active_roots, path) {
                    handle_root_deletion(path, db);
                    // best-effort signal; the owning FsMonitor drops this
                    // root on its next sync_watches call.
                    let _ = commands;
                } else if !is_directory_event {
                    log_event(db, "deleted", path, None);
                    bus.publish(CoreEvent::FileDeleted { path: path.to_string_lossy().to_string() });
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let src = &event.paths[0];
            let dest = &event.paths[1];

            if is_root(active_roots, src) {
                handle_root_rename(src, dest, db, identity);
            } else if is_directory_event {
                log_event(db, "moved_dir", src, Some(dest));
                match identity.rename_directory(src, dest) {
                    Ok(count) => info!(count, "directory move rewrote identity records"),
                    Err(err) => error!(error = %err, "directory move identity rewrite failed"),
                }
                bus.publish(CoreEvent::DirectoryMoved {
                    src: src.to_string_lossy().to_string(),
                    dest: dest.to_string_lossy().to_string(),
                });
            } else {
                log_event(db, "moved", src, Some(dest));
                if let Err(err) = identity.rename(src, dest) {
                    error!(error = %err, "file move identity rewrite failed");
                }
                bus.publish(CoreEvent::FileMoved {
                    src: src.to_string_lossy().to_string(),
                    dest: dest.to_string_lossy().to_string(),
                });
                let _ = queue.admit(dest);
            }
        }
        _ => {}
    }
}

fn is_root(active_roots: &[WatchedRoot], path: &Path) -> bool {
    let key = norm(path);
    active_roots.iter().any(|r| norm(&r.path) == key)
}

fn log_event(db: &Arc<Database>, event_type: &str, src: &Path, dest: Option<&Path>) {
    let src = src.to_string_lossy().to_string();
    let dest = dest.map(|d| d.to_string_lossy().to_string());
    let result = db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO file_events (event_type, src_path, dest_path) VALUES (?1, ?2, ?3)",
            rusqlite::params![event_type, src, dest],
        )?;
        Ok(())
    });
    if let Err(err) = result {
        error!(error = %err, "failed to log filesystem event");
    }
}

/// Root-level handling, per §4.6: a rename of the root updates the
/// `WatchedPath` row, rewrites every `FileRecord` under the old prefix, and
/// rewrites historical `FileEvent` paths too. The caller is responsible for
/// re-syncing watches afterward.
fn handle_root_rename(old: &Path, new: &Path, db: &Arc<Database>, identity: &Arc<IdentityIndex>) {
    let old_key = norm(old).to_string_lossy().to_string();
    let new_key = norm(new).to_string_lossy().to_string();

    let result = db.with_conn(|conn| {
        conn.execute(
            "UPDATE watched_paths SET path = ?1 WHERE path = ?2",
            (&new_key, &old_key),
        )?;
        Ok(())
    });
    if let Err(err) = result {
        error!(error = %err, "failed to update watched_paths on root rename");
        return;
    }

    match identity.rename_directory(old, new) {
        Ok(count) => info!(count, "root rename rewrote identity records"),
        Err(err) => error!(error = %err, "root rename identity rewrite failed"),
    }

    if let Err(err) = rewrite_file_event_paths(db, old, new) {
        error!(error = %err, "failed to rewrite historical file_events on root rename");
    }
}

/// Prefix-rewrite every historical `file_events` row's `src_path` and
/// `dest_path` under `old` to `new`, segment-boundary-safe via
/// [`prefix_swap`] — a naive `REPLACE` would also rewrite `/Testing/...`
/// when renaming `/Test`, violating §4.2's prefix-safety invariant.
fn rewrite_file_event_paths(db: &Arc<Database>, old: &Path, new: &Path) -> crate::error::Result<()> {
    db.with_transaction(|tx| {
        let mut stmt = tx.prepare("SELECT id, src_path, dest_path FROM file_events")?;
        let rows: Vec<(i64, String, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        for (id, src_path, dest_path) in rows {
            let new_src = prefix_swap(&src_path, old, new).map(|p| p.to_string_lossy().to_string());
            let new_dest = dest_path
                .as_deref()
                .and_then(|d| prefix_swap(d, old, new))
                .map(|p| p.to_string_lossy().to_string());

            if new_src.is_none() && new_dest.is_none() {
                continue;
            }

            tx.execute(
                "UPDATE file_events SET src_path = ?1, dest_path = ?2 WHERE id = ?3",
                rusqlite::params![new_src.unwrap_or(src_path), new_dest.or(dest_path), id],
            )?;
        }
        Ok(())
    })
}

/// The watched root itself disappeared. We cannot auto-heal since the new
/// location (if any) is unknown; the row is deactivated but history is kept.
fn handle_root_deletion(root: &Path, db: &Arc<Database>) {
    let key = norm(root).to_string_lossy().to_string();
    warn!(path = %root.display(), "watched root disappeared, deactivating");
    let result = db.with_conn(|conn| {
        conn.execute(
            "UPDATE watched_paths SET is_active = 0 WHERE path = ?1",
            [&key],
        )?;
        Ok(())
    });
    if let Err(err) = result {
        error!(error = %err, "failed to deactivate watched_paths row on root deletion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_root_matches_normalised_paths() {
        let roots = vec![WatchedRoot { id: 1, path: PathBuf::from("/w") }];
        assert!(is_root(&roots, Path::new("/w")));
        assert!(!is_root(&roots, Path::new("/w/sub")));
    }
}
