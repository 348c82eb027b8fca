//! Restore suppression: while a restore is writing a file back to disk, the
//! filesystem monitor must not treat that write as a new user modification
//! and enqueue a spurious backup of the very content it just restored.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RESTORE_SUPPRESSION_WINDOW;
use crate::path::norm;

/// Process-wide map of normalised path to suppression expiry. Shared by the
/// watcher (which checks admission) and the restore path (which arms it).
#[derive(Default)]
pub struct SuppressionSet {
    entries: Mutex<HashMap<String, Instant>>,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm suppression for `path` for [`RESTORE_SUPPRESSION_WINDOW`],
    /// starting from the moment the restore write begins.
    pub fn register_restore_start(&self, path: impl AsRef<Path>) {
        self.register_restore_start_for(path, RESTORE_SUPPRESSION_WINDOW);
    }

    fn register_restore_start_for(&self, path: impl AsRef<Path>, window: Duration) {
        let key = norm(path).to_string_lossy().to_string();
        let expiry = Instant::now() + window;
        let mut entries = self.entries.lock().expect("suppression mutex poisoned");
        entries.insert(key, expiry);
    }

    /// True if `path` is currently suppressed. Expired entries are lazily
    /// evicted on lookup rather than on a timer.
    pub fn is_suppressed(&self, path: impl AsRef<Path>) -> bool {
        let key = norm(path).to_string_lossy().to_string();
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("suppression mutex poisoned");
        match entries.get(&key) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Drop every expired entry. Called periodically so the map doesn't
    /// grow unbounded under long uptimes with many restores.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("suppression mutex poisoned");
        entries.retain(|_, expiry| *expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn suppresses_immediately_after_registration() {
        let set = SuppressionSet::new();
        set.register_restore_start("/w/a.txt");
        assert!(set.is_suppressed("/w/a.txt"));
    }

    #[test]
    fn expires_after_the_window() {
        let set = SuppressionSet::new();
        set.register_restore_start_for("/w/a.txt", Duration::from_millis(10));
        sleep(Duration::from_millis(30));
        assert!(!set.is_suppressed("/w/a.txt"));
    }

    #[test]
    fn is_keyed_by_normalised_path() {
        let set = SuppressionSet::new();
        set.register_restore_start("/w/./a.txt");
        assert!(set.is_suppressed("/w/a.txt"));
    }

    #[test]
    fn unrelated_paths_are_not_suppressed() {
        let set = SuppressionSet::new();
        set.register_restore_start("/w/a.txt");
        assert!(!set.is_suppressed("/w/b.txt"));
    }
}
