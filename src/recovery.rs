//! Diagnostic salvage tool: finds chunks no live manifest references and
//! manifests whose referenced chunks are incomplete. Not part of the core
//! data path — a read-only report an operator runs by hand (`fsck`).

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, span, warn, Level};

use crate::cas::Manifest;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanChunk {
    pub hash: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokenManifest {
    pub manifest_path: PathBuf,
    pub file_hash: String,
    pub missing_chunks: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FsckReport {
    pub generated_at: DateTime<Utc>,
    pub manifests_checked: usize,
    pub orphan_chunks: Vec<OrphanChunk>,
    pub broken_manifests: Vec<BrokenManifest>,
}

/// Walk `storage_root`'s manifests and chunks directory, cross-referencing
/// each manifest's chunk list against what's actually on disk.
pub fn fsck(storage_root: &std::path::Path) -> Result<FsckReport> {
    let span = span!(Level::INFO, "fsck");
    let _enter = span.enter();

    let chunks_dir = storage_root.join("chunks");
    let mut chunk_hashes_on_disk: HashSet<String> = HashSet::new();
    let mut chunk_sizes: std::collections::HashMap<String, u64> = std::collections::HashMap::new();

    if chunks_dir.exists() {
        for entry in fs::read_dir(&chunks_dir)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(hash) = name.strip_suffix(".chunk") {
                chunk_hashes_on_disk.insert(hash.to_string());
                if let Ok(metadata) = entry.metadata() {
                    chunk_sizes.insert(hash.to_string(), metadata.len());
                }
            }
        }
    }

    let mut referenced: HashSet<String> = HashSet::new();
    let mut broken_manifests = Vec::new();
    let mut manifests_checked = 0usize;

    if storage_root.exists() {
        for entry in fs::read_dir(storage_root)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".manifest.json") {
                continue;
            }
            manifests_checked += 1;

            let manifest: Manifest = match fs::read_to_string(&path).ok().and_then(|text| serde_json::from_str(&text).ok()) {
                Some(m) => m,
                None => {
                    warn!(path = %path.display(), "unreadable or corrupt manifest");
                    continue;
                }
            };

            let mut missing = Vec::new();
            for chunk in &manifest.chunks {
                referenced.insert(chunk.hash.clone());
                if !chunk_hashes_on_disk.contains(&chunk.hash) {
                    missing.push(chunk.hash.clone());
                }
            }

            if !missing.is_empty() {
                broken_manifests.push(BrokenManifest {
                    manifest_path: path.clone(),
                    file_hash: manifest.file_hash.clone(),
                    missing_chunks: missing,
                });
            }
        }
    }

    let orphan_chunks: Vec<OrphanChunk> = chunk_hashes_on_disk
        .difference(&referenced)
        .map(|hash| OrphanChunk {
            hash: hash.clone(),
            size: chunk_sizes.get(hash).copied().unwrap_or(0),
            path: chunks_dir.join(format!("{hash}.chunk")),
        })
        .collect();

    info!(
        manifests = manifests_checked,
        orphans = orphan_chunks.len(),
        broken = broken_manifests.len(),
        "fsck complete"
    );

    Ok(FsckReport {
        generated_at: Utc::now(),
        manifests_checked,
        orphan_chunks,
        broken_manifests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasStore;
    use tempfile::TempDir;

    #[test]
    fn fsck_reports_no_issues_for_a_healthy_store() {
        let store_dir = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let store = CasStore::with_thresholds(store_dir.path(), 16, 8).unwrap();

        let content: Vec<u8> = (0u8..=255).cycle().take(64).collect();
        let src = src_dir.path().join("big.bin");
        fs::write(&src, &content).unwrap();
        store.write(&src, None).unwrap();

        let report = fsck(store_dir.path()).unwrap();
        assert!(report.orphan_chunks.is_empty());
        assert!(report.broken_manifests.is_empty());
    }

    #[test]
    fn fsck_flags_a_manifest_with_a_missing_chunk() {
        let store_dir = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let store = CasStore::with_thresholds(store_dir.path(), 16, 8).unwrap();

        let content: Vec<u8> = (0u8..=255).cycle().take(64).collect();
        let src = src_dir.path().join("big.bin");
        fs::write(&src, &content).unwrap();
        let meta = store.write(&src, None).unwrap();

        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(&meta.storage_path).unwrap()).unwrap();
        let victim = &manifest.chunks[0];
        fs::remove_file(store_dir.path().join("chunks").join(format!("{}.chunk", victim.hash))).unwrap();

        let report = fsck(store_dir.path()).unwrap();
        assert_eq!(report.broken_manifests.len(), 1);
    }

    #[test]
    fn fsck_detects_an_orphan_chunk() {
        let store_dir = TempDir::new().unwrap();
        fs::create_dir_all(store_dir.path().join("chunks")).unwrap();
        fs::write(store_dir.path().join("chunks").join("deadbeef.chunk"), b"orphan").unwrap();

        let report = fsck(store_dir.path()).unwrap();
        assert_eq!(report.orphan_chunks.len(), 1);
        assert_eq!(report.orphan_chunks[0].hash, "deadbeef");
    }
}
