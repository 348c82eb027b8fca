//! End-to-end scenarios driving `Engine` through its public command surface.
//!
//! These exercise the real backup queue, CAS store, identity and version
//! indexes wired together the way `Engine` wires them, but step the backup
//! worker explicitly (`BackupWorker::run_once`) rather than waiting on the
//! real OS-level filesystem watcher — the watcher's own admission/rewrite
//! logic is covered directly in `watcher`'s unit tests, and driving it here
//! too would trade determinism for no added coverage.

use std::fs;
use std::sync::Arc;

use filekeep::config::Config;
use filekeep::engine::Engine;
use filekeep::queue::BackupWorker;
use filekeep::Error;
use sha2::Digest;

fn engine_in(dir: &std::path::Path) -> Arc<Engine> {
    let mut config = Config::default();
    config.storage_root = dir.join("storage");
    Arc::new(Engine::open(config, dir.join("db.sqlite")).unwrap())
}

fn worker_for(engine: &Engine) -> BackupWorker {
    BackupWorker::new(engine.database(), engine.cas(), engine.identity(), engine.versions())
}

fn drain(engine: &Engine) {
    let worker = worker_for(engine);
    while worker.run_once().unwrap() {}
}

#[test]
fn create_modify_list_records_two_versions_newest_first() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();
    engine.add_watched_root(&root).unwrap();

    let file = root.join("a.txt");
    fs::write(&file, b"v1").unwrap();
    engine.queue().admit(&file).unwrap();
    drain(&engine);

    fs::write(&file, b"v2").unwrap();
    engine.queue().admit(&file).unwrap();
    drain(&engine);

    let versions = engine.list_versions(&file).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].version_number, 2);
    assert_eq!(versions[1].version_number, 1);
    assert_eq!(
        versions[0].file_hash.as_deref(),
        Some(hex::encode(sha2::Sha256::digest(b"v2")).as_str())
    );
    assert_eq!(
        versions[1].file_hash.as_deref(),
        Some(hex::encode(sha2::Sha256::digest(b"v1")).as_str())
    );
}

#[test]
fn identical_content_across_two_files_dedups_in_cas() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();
    engine.add_watched_root(&root).unwrap();

    let a = root.join("a.txt");
    let b = root.join("b.txt");
    fs::write(&a, b"same bytes").unwrap();
    fs::write(&b, b"same bytes").unwrap();
    engine.queue().admit(&a).unwrap();
    engine.queue().admit(&b).unwrap();
    drain(&engine);

    let va = &engine.list_versions(&a).unwrap()[0];
    let vb = &engine.list_versions(&b).unwrap()[0];
    assert_eq!(va.storage_path, vb.storage_path);

    let objects: Vec<_> = fs::read_dir(engine.storage_root())
        .unwrap()
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    assert_eq!(objects.len(), 1);
}

#[test]
fn rename_preserves_version_history_under_the_same_identity() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();
    engine.add_watched_root(&root).unwrap();

    let a = root.join("a.txt");
    fs::write(&a, b"v1").unwrap();
    engine.queue().admit(&a).unwrap();
    drain(&engine);

    let b = root.join("b.txt");
    fs::rename(&a, &b).unwrap();
    engine.identity().rename(&a, &b).unwrap();

    let versions = engine.list_versions(&b).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version_number, 1);
}

#[test]
fn directory_rename_does_not_touch_a_dangerous_sibling() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let root = dir.path().join("root");
    let test_dir = root.join("Test");
    let testing_dir = root.join("Testing");
    fs::create_dir_all(&test_dir).unwrap();
    fs::create_dir_all(&testing_dir).unwrap();
    engine.add_watched_root(&root).unwrap();

    let f = test_dir.join("f.txt");
    fs::write(&f, b"v1").unwrap();
    engine.queue().admit(&f).unwrap();
    drain(&engine);

    let g = testing_dir.join("g.txt");
    fs::write(&g, b"v1").unwrap();
    engine.queue().admit(&g).unwrap();
    drain(&engine);

    let new_test_dir = root.join("TestNew");
    let rewritten = engine.identity().rename_directory(&test_dir, &new_test_dir).unwrap();
    assert_eq!(rewritten, 1);

    assert!(engine.identity().lookup(new_test_dir.join("f.txt")).unwrap().is_some());
    assert!(engine.identity().lookup(&g).unwrap().is_some());
}

#[test]
fn gc_respects_grace_period_and_active_set_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();
    engine.add_watched_root(&root).unwrap();

    let a = root.join("a.txt");
    fs::write(&a, b"keep or reclaim me").unwrap();
    engine.queue().admit(&a).unwrap();
    drain(&engine);

    let active = engine.active_storage_basenames().unwrap();
    let version = &engine.list_versions(&a).unwrap()[0];
    let name = std::path::Path::new(&version.storage_path).file_name().unwrap();
    assert!(active.contains(name.to_str().unwrap()));

    // Active set includes the object: GC never removes it even with zero grace.
    let report = engine.cas().gc(&active, std::time::Duration::from_secs(0));
    assert!(report.removed.is_empty());

    // An empty active set plus zero grace reclaims it.
    let report = engine.cas().gc(&std::collections::HashSet::new(), std::time::Duration::from_secs(0));
    assert_eq!(report.removed.len(), 1);
}

#[test]
fn restoring_a_version_arms_suppression_so_the_echo_write_is_dropped() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();
    engine.add_watched_root(&root).unwrap();

    let a = root.join("a.txt");
    fs::write(&a, b"only version").unwrap();
    engine.queue().admit(&a).unwrap();
    drain(&engine);

    let version_id = engine.list_versions(&a).unwrap()[0].id;
    engine.restore(version_id, Some(a.clone())).unwrap();

    // The restore's own write must not be admitted as a new backup task.
    let rejection = engine.queue().admit(&a).unwrap();
    assert_eq!(rejection, Some(filekeep::queue::Rejection::RestoreSuppressed));

    assert_eq!(engine.list_versions(&a).unwrap().len(), 1);
}

#[test]
fn restore_outside_every_watched_root_is_forbidden_and_leaves_source_untouched() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();
    engine.add_watched_root(&root).unwrap();

    let a = root.join("a.txt");
    fs::write(&a, b"v1").unwrap();
    engine.queue().admit(&a).unwrap();
    drain(&engine);

    let version_id = engine.list_versions(&a).unwrap()[0].id;
    let outside = dir.path().join("unwatched").join("a.txt");

    let result = engine.restore(version_id, Some(outside.clone()));
    assert!(matches!(result, Err(Error::Forbidden(_))));
    assert!(!outside.exists());
    assert_eq!(fs::read(&a).unwrap(), b"v1");
}
