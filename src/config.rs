//! Tunable constants and the on-disk configuration file.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files at or above this size are stored as chunked manifests instead of
/// a single gzip object.
pub const CHUNKED_MIN_SIZE: u64 = 16 * 1024 * 1024;

/// Fixed block size used when chunking large files.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Minimum spacing between two admitted backups of the same path.
pub const BACKUP_DEBOUNCE: Duration = Duration::from_millis(300);

/// Minimum age a CAS object must reach before GC may remove it.
pub const GC_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Interval between GC passes.
pub const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How many files a snapshot job processes before persisting progress.
pub const SNAPSHOT_BATCH_SIZE: usize = 200;

/// How long a restore-suppression entry stays in effect after being armed.
pub const RESTORE_SUPPRESSION_WINDOW: Duration = Duration::from_secs(2);

/// Capacity of each event-bus subscriber's buffer.
pub const EVENT_BUS_CAPACITY: usize = 100;

/// Built-in path segments excluded from watching and scanning regardless of
/// user configuration.
pub const BUILTIN_EXCLUSIONS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    "dist",
    "build",
    "target",
    ".idea",
    ".vscode",
    ".cache",
    ".DS_Store",
    "Thumbs.db",
];

/// Suffixes that mark a write-in-progress file; never admitted to backup.
pub const ADMISSION_REJECTED_SUFFIXES: &[&str] = &[".tmp", ".crdownload", "~", ".swp"];

/// Top-level configuration, loadable from a TOML file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory holding the CAS store, the database and snapshot
    /// mirrors.
    pub storage_root: PathBuf,
    /// User-maintained exclusion set, unioned with `BUILTIN_EXCLUSIONS`.
    #[serde(default)]
    pub custom_exclusions: Vec<String>,
    /// Whether the snapshot scanner follows symlinks.
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Whether the snapshot scanner aborts on an unreadable file (false) or
    /// logs and continues (true).
    #[serde(default = "default_true")]
    pub continue_on_unreadable: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(".filekeep_storage"),
            custom_exclusions: Vec::new(),
            follow_symlinks: false,
            continue_on_unreadable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_toml() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");

        let mut cfg = Config::default();
        cfg.custom_exclusions.push("secrets".to_string());
        cfg.save(&path)?;

        let loaded = Config::load(&path)?;
        assert_eq!(loaded.custom_exclusions, vec!["secrets".to_string()]);
        Ok(())
    }
}
