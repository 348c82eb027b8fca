//! Path normalisation, prefix-safe rewriting and exclusion matching.
//!
//! Every equality check against a tracked path goes through [`norm`] first;
//! comparing raw `Path`s directly is a bug waiting to happen across
//! platforms with case-insensitive filesystems.

use std::collections::HashSet;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use crate::config::BUILTIN_EXCLUSIONS;

/// Normalise a path for use as a comparison key: absolute, and case-folded
/// on platforms where the filesystem is case-insensitive.
pub fn norm(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let cleaned = clean(&absolute);

    #[cfg(any(windows, target_os = "macos"))]
    {
        PathBuf::from(cleaned.to_string_lossy().to_lowercase())
    }
    #[cfg(not(any(windows, target_os = "macos")))]
    {
        cleaned
    }
}

/// Collapse `.` and `..` components without touching the filesystem (unlike
/// `fs::canonicalize`, which requires the path to exist).
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Rewrite `current` by replacing a leading `old_prefix` with `new_prefix`,
/// but only when `old_prefix` ends on a path-segment boundary in `current`
/// — `/Test` must never match the start of `/Testing/...`.
///
/// Returns `None` if `current` is not under `old_prefix`.
pub fn prefix_swap(
    current: impl AsRef<Path>,
    old_prefix: impl AsRef<Path>,
    new_prefix: impl AsRef<Path>,
) -> Option<PathBuf> {
    let current = current.as_ref().to_string_lossy().to_string();
    let mut old_prefix = old_prefix.as_ref().to_string_lossy().to_string();

    if current == old_prefix {
        return Some(new_prefix.as_ref().to_path_buf());
    }

    if !old_prefix.ends_with(MAIN_SEPARATOR) {
        old_prefix.push(MAIN_SEPARATOR);
    }

    let suffix = current.strip_prefix(&old_prefix)?;
    Some(new_prefix.as_ref().join(suffix))
}

/// A combined exclusion set: the built-in names plus a user-maintained
/// custom list. Matching is exact on path segment names, never substrings.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    names: HashSet<String>,
}

impl ExclusionSet {
    pub fn new(custom: impl IntoIterator<Item = String>) -> Self {
        let mut names: HashSet<String> = BUILTIN_EXCLUSIONS.iter().map(|s| s.to_string()).collect();
        names.extend(custom);
        Self { names }
    }

    /// True iff any segment of `path` exactly equals an excluded name.
    pub fn is_excluded(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .any(|segment| self.names.contains(segment))
    }
}

/// True iff `target` lies inside (or equals) one of `roots`, after
/// normalisation. Used to gate restore destinations.
pub fn within(target: impl AsRef<Path>, roots: &[PathBuf]) -> bool {
    let target = norm(target);
    roots.iter().any(|root| {
        let root = norm(root);
        target == root || target.starts_with(&root)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_swap_respects_segment_boundaries() {
        let result = prefix_swap("/A/Testing/g.txt", "/A/Test", "/A/TestNew");
        assert_eq!(result, None);
    }

    #[test]
    fn prefix_swap_rewrites_matching_prefix() {
        let result = prefix_swap("/A/Test/f.txt", "/A/Test", "/A/TestNew");
        assert_eq!(result, Some(PathBuf::from("/A/TestNew/f.txt")));
    }

    #[test]
    fn prefix_swap_handles_already_separator_terminated_prefix() {
        let sep = MAIN_SEPARATOR;
        let old = format!("/A/Test{sep}");
        let result = prefix_swap("/A/Test/f.txt", old, "/A/TestNew");
        assert_eq!(result, Some(PathBuf::from("/A/TestNew/f.txt")));
    }

    #[test]
    fn exclusion_matches_exact_segments_only() {
        let set = ExclusionSet::new(std::iter::empty());
        assert!(set.is_excluded("/repo/.git/HEAD"));
        assert!(!set.is_excluded("/repo/gitignore-notes/file.txt"));
    }

    #[test]
    fn exclusion_includes_custom_entries() {
        let set = ExclusionSet::new(["secrets".to_string()]);
        assert!(set.is_excluded("/repo/secrets/key.pem"));
    }

    #[test]
    fn within_accepts_nested_paths_and_rejects_siblings() {
        let roots = vec![norm("/home/user/Documents")];
        assert!(within("/home/user/Documents/a.txt", &roots));
        assert!(!within("/home/user/Pictures/a.txt", &roots));
    }
}
