//! Content-addressed storage: hash, compress, chunk, dedup, restore, GC.
//!
//! A single directory (`storage_root`) holds every object. Three write
//! paths are selected on file size and whether the caller already knows
//! the content hash (small-known, small-unknown, chunked) — see
//! `CasStore::write` / `CasStore::write_known_hash`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

const HASH_READ_BLOCK: usize = 4096;

/// Metadata returned by every CAS write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasMeta {
    /// Full path inside the CAS root (`{hash}.gz` or `{hash}.manifest.json`).
    pub storage_path: PathBuf,
    /// Hex SHA-256 of the uncompressed content.
    pub file_hash: String,
    /// Size of the original, uncompressed content.
    pub file_size: u64,
    /// Whether this write resolved to an already-existing object.
    pub dedup_hit: bool,
}

/// One block reference inside a chunked manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRef {
    pub hash: String,
    pub size: u64,
}

/// On-disk manifest format for a chunked object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub file_hash: String,
    pub file_size: u64,
    pub chunk_size: usize,
    pub chunks: Vec<ChunkRef>,
}

/// Result of one garbage-collection pass.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

/// A content-addressed object store rooted at `storage_root`.
pub struct CasStore {
    storage_root: PathBuf,
    chunks_dir: PathBuf,
    chunked_min_size: u64,
    chunk_size: usize,
}

impl CasStore {
    /// Open (creating if needed) a CAS store at `storage_root`, using the
    /// default size thresholds from [`crate::config`].
    pub fn new(storage_root: impl AsRef<Path>) -> Result<Self> {
        Self::with_thresholds(
            storage_root,
            crate::config::CHUNKED_MIN_SIZE,
            crate::config::CHUNK_SIZE,
        )
    }

    /// Open a CAS store with explicit thresholds — mainly useful for tests
    /// that want a small `chunk_size` without waiting on 4 MiB blocks.
    pub fn with_thresholds(
        storage_root: impl AsRef<Path>,
        chunked_min_size: u64,
        chunk_size: usize,
    ) -> Result<Self> {
        let storage_root = storage_root.as_ref().to_path_buf();
        let chunks_dir = storage_root.join("chunks");
        fs::create_dir_all(&chunks_dir)?;
        Ok(Self {
            storage_root,
            chunks_dir,
            chunked_min_size,
            chunk_size,
        })
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Compute the hex SHA-256 of a file, streaming in 4 KiB blocks.
    pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; HASH_READ_BLOCK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Write `src` into the store, selecting a path based on size and
    /// whether the caller supplies an already-computed hash.
    pub fn write(&self, src: impl AsRef<Path>, known_hash: Option<&str>) -> Result<CasMeta> {
        let src = src.as_ref();
        let size = fs::metadata(src)?.len();

        if size >= self.chunked_min_size {
            return self.write_chunked(src);
        }

        match known_hash {
            Some(hash) => self.write_small_known(src, hash, size),
            None => self.write_small_unknown(src),
        }
    }

    fn gz_path(&self, hash: &str) -> PathBuf {
        self.storage_root.join(format!("{hash}.gz"))
    }

    fn manifest_path(&self, hash: &str) -> PathBuf {
        self.storage_root.join(format!("{hash}.manifest.json"))
    }

    fn chunk_path(&self, hash: &str) -> PathBuf {
        self.chunks_dir.join(format!("{hash}.chunk"))
    }

    /// Temp name for an in-flight gzip write, per §4.1's on-disk layout —
    /// never referenced by a manifest or version row.
    fn gz_temp_path(&self) -> PathBuf {
        self.storage_root.join(format!(".{}.gz.tmp", Uuid::new_v4().simple()))
    }

    /// Temp name for any other in-flight write (chunk, manifest) that also
    /// needs a unique-name-then-rename for atomicity, but isn't itself gzip.
    fn scratch_temp_path(&self) -> PathBuf {
        self.storage_root.join(format!(".{}.tmp", Uuid::new_v4().simple()))
    }

    /// Small file, caller already knows the hash: a pure existence check
    /// plus (on miss) a compress-to-temp-then-rename.
    fn write_small_known(&self, src: &Path, hash: &str, size: u64) -> Result<CasMeta> {
        let dest = self.gz_path(hash);
        if dest.exists() {
            return Ok(CasMeta {
                storage_path: dest,
                file_hash: hash.to_string(),
                file_size: size,
                dedup_hit: true,
            });
        }

        let temp = self.gz_temp_path();
        if let Err(e) = gzip_copy(src, &temp) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        finalize_rename(&temp, &dest)?;
        Ok(CasMeta {
            storage_path: dest,
            file_hash: hash.to_string(),
            file_size: size,
            dedup_hit: false,
        })
    }

    /// Small file, hash unknown up front: hash and gzip in one streaming
    /// pass into a uniquely-named temp file, then rename to `{hash}.gz`.
    fn write_small_unknown(&self, src: &Path) -> Result<CasMeta> {
        let size = fs::metadata(src)?.len();
        let temp = self.gz_temp_path();

        let hash = match hash_and_gzip(src, &temp) {
            Ok(hash) => hash,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        };

        let dest = self.gz_path(&hash);
        let dedup_hit = dest.exists();
        if dedup_hit {
            let _ = fs::remove_file(&temp);
        } else {
            finalize_rename(&temp, &dest)?;
        }

        Ok(CasMeta {
            storage_path: dest,
            file_hash: hash,
            file_size: size,
            dedup_hit,
        })
    }

    /// Large file: split into fixed-size blocks, each independently
    /// content-addressed, plus a manifest recording the whole-file hash.
    /// The manifest is written last, so its presence implies every chunk
    /// it names is already on disk.
    fn write_chunked(&self, src: &Path) -> Result<CasMeta> {
        let mut file = BufReader::new(File::open(src)?);
        let mut whole_hasher = Sha256::new();
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut total_size: u64 = 0;

        loop {
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            let block = &buf[..n];
            whole_hasher.update(block);
            total_size += n as u64;

            let chunk_hash = hex::encode(Sha256::digest(block));
            let chunk_path = self.chunk_path(&chunk_hash);
            if !chunk_path.exists() {
                let temp = self.scratch_temp_path();
                if let Err(e) = write_atomic(&temp, block) {
                    let _ = fs::remove_file(&temp);
                    return Err(e);
                }
                finalize_rename(&temp, &chunk_path)?;
            }

            chunks.push(ChunkRef {
                hash: chunk_hash,
                size: n as u64,
            });
        }

        let file_hash = hex::encode(whole_hasher.finalize());
        let manifest_path = self.manifest_path(&file_hash);

        if manifest_path.exists() {
            return Ok(CasMeta {
                storage_path: manifest_path,
                file_hash,
                file_size: total_size,
                dedup_hit: true,
            });
        }

        let manifest = Manifest {
            file_hash: file_hash.clone(),
            file_size: total_size,
            chunk_size: self.chunk_size,
            chunks,
        };

        let temp = self.scratch_temp_path();
        {
            let f = File::create(&temp)?;
            serde_json::to_writer_pretty(BufWriter::new(f), &manifest)?;
        }
        finalize_rename(&temp, &manifest_path)?;

        Ok(CasMeta {
            storage_path: manifest_path,
            file_hash,
            file_size: total_size,
            dedup_hit: false,
        })
    }

    /// Restore a stored object to `dest`, dispatching on the storage
    /// filename's extension. Chunked manifests are reassembled in order;
    /// a missing chunk aborts with [`Error::ChunkMissing`], leaving
    /// whatever bytes were already written at `dest`.
    pub fn restore(&self, storage_path: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
        let storage_path = storage_path.as_ref();
        let dest = dest.as_ref();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let name = storage_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if name.ends_with(".manifest.json") {
            self.restore_chunked(storage_path, dest)
        } else if name.ends_with(".gz") {
            gunzip_copy(storage_path, dest)
        } else {
            fs::copy(storage_path, dest)?;
            Ok(())
        }
    }

    fn restore_chunked(&self, manifest_path: &Path, dest: &Path) -> Result<()> {
        let file = File::open(manifest_path)?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))?;

        let mut out = BufWriter::new(File::create(dest)?);
        for chunk in &manifest.chunks {
            let chunk_path = self.chunk_path(&chunk.hash);
            if !chunk_path.exists() {
                return Err(Error::ChunkMissing {
                    manifest: manifest_path.display().to_string(),
                    hash: chunk.hash.clone(),
                });
            }
            let mut chunk_file = File::open(&chunk_path)?;
            io::copy(&mut chunk_file, &mut out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Sweep the top level of the storage root: any regular file whose
    /// basename is not in `active` and whose mtime is older than
    /// `grace_period` is deleted. Chunks are never walked directly — their
    /// liveness is implied by the manifests that reference them.
    pub fn gc(&self, active: &HashSet<String>, grace_period: Duration) -> GcReport {
        let mut report = GcReport::default();
        let now = SystemTime::now();

        let entries = match fs::read_dir(&self.storage_root) {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if active.contains(&name) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    report.errors.push(format!("{name}: {e}"));
                    continue;
                }
            };
            let age = match metadata.modified().and_then(|mtime| {
                now.duration_since(mtime)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            }) {
                Ok(age) => age,
                Err(_) => continue,
            };

            if age < grace_period {
                continue;
            }

            let size = metadata.len();
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.removed.push(name);
                    report.freed_bytes += size;
                }
                Err(e) => report.errors.push(format!("{name}: {e}")),
            }
        }

        report
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = File::create(path)?;
    f.write_all(data)?;
    f.sync_all()?;
    Ok(())
}

fn finalize_rename(temp: &Path, dest: &Path) -> Result<()> {
    match fs::rename(temp, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(temp);
            // Another writer raced us to the same content; the result is
            // byte-identical either way, so a pre-existing destination is
            // not an error.
            if dest.exists() {
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}

fn gzip_copy(src: &Path, dest: &Path) -> Result<()> {
    let mut input = File::open(src)?;
    let output = File::create(dest)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn gunzip_copy(src: &Path, dest: &Path) -> Result<()> {
    let input = File::open(src)?;
    let mut decoder = GzDecoder::new(input);
    let mut output = File::create(dest)?;
    io::copy(&mut decoder, &mut output)?;
    Ok(())
}

/// Hash and gzip-encode `src` into `dest` in a single streaming pass.
fn hash_and_gzip(src: &Path, dest: &Path) -> Result<String> {
    let mut input = File::open(src)?;
    let output = File::create(dest)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_src(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn round_trip_small_unknown_hash() -> Result<()> {
        let store_dir = TempDir::new()?;
        let src_dir = TempDir::new()?;
        let store = CasStore::new(store_dir.path())?;

        let src = write_src(&src_dir, "a.txt", b"hello world");
        let meta = store.write(&src, None)?;
        assert!(!meta.dedup_hit);

        let dest = src_dir.path().join("restored.txt");
        store.restore(&meta.storage_path, &dest)?;
        assert_eq!(fs::read(dest)?, b"hello world");
        Ok(())
    }

    #[test]
    fn round_trip_small_known_hash() -> Result<()> {
        let store_dir = TempDir::new()?;
        let src_dir = TempDir::new()?;
        let store = CasStore::new(store_dir.path())?;

        let src = write_src(&src_dir, "a.txt", b"known content");
        let hash = CasStore::hash_file(&src)?;
        let meta = store.write(&src, Some(&hash))?;

        let dest = src_dir.path().join("restored.txt");
        store.restore(&meta.storage_path, &dest)?;
        assert_eq!(fs::read(dest)?, b"known content");
        Ok(())
    }

    #[test]
    fn dedup_hit_produces_single_object() -> Result<()> {
        let store_dir = TempDir::new()?;
        let src_dir = TempDir::new()?;
        let store = CasStore::new(store_dir.path())?;

        let a = write_src(&src_dir, "a.txt", b"same bytes");
        let b = write_src(&src_dir, "b.txt", b"same bytes");

        let meta_a = store.write(&a, None)?;
        let meta_b = store.write(&b, None)?;

        assert_eq!(meta_a.storage_path, meta_b.storage_path);
        assert!(meta_b.dedup_hit);

        let objects: Vec<_> = fs::read_dir(store_dir.path())?
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .collect();
        assert_eq!(objects.len(), 1);
        Ok(())
    }

    #[test]
    fn hash_equals_storage_filename() -> Result<()> {
        let store_dir = TempDir::new()?;
        let src_dir = TempDir::new()?;
        let store = CasStore::new(store_dir.path())?;

        let src = write_src(&src_dir, "a.txt", b"check my name");
        let meta = store.write(&src, None)?;

        let stem = meta
            .storage_path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches(".gz");
        assert_eq!(stem, meta.file_hash);
        Ok(())
    }

    #[test]
    fn chunked_round_trip_and_missing_chunk_failure() -> Result<()> {
        let store_dir = TempDir::new()?;
        let src_dir = TempDir::new()?;
        let store = CasStore::with_thresholds(store_dir.path(), 32, 8)?;

        let content: Vec<u8> = (0u8..=255).cycle().take(160).collect();
        let src = write_src(&src_dir, "big.bin", &content);

        let meta = store.write(&src, None)?;
        assert!(meta.storage_path.to_string_lossy().ends_with(".manifest.json"));

        let dest = src_dir.path().join("restored.bin");
        store.restore(&meta.storage_path, &dest)?;
        assert_eq!(fs::read(&dest)?, content);

        let manifest_text = fs::read_to_string(&meta.storage_path)?;
        let manifest: Manifest = serde_json::from_str(&manifest_text)?;
        assert!(manifest.chunks.len() >= 20);

        let victim = &manifest.chunks[0];
        let victim_path = store_dir.path().join("chunks").join(format!("{}.chunk", victim.hash));
        fs::remove_file(&victim_path)?;

        let dest2 = src_dir.path().join("restored2.bin");
        let result = store.restore(&meta.storage_path, &dest2);
        assert!(matches!(result, Err(Error::ChunkMissing { .. })));
        Ok(())
    }

    #[test]
    fn gc_respects_grace_period_and_active_set() -> Result<()> {
        let store_dir = TempDir::new()?;
        let src_dir = TempDir::new()?;
        let store = CasStore::new(store_dir.path())?;

        let src = write_src(&src_dir, "a.txt", b"gc me maybe");
        let meta = store.write(&src, None)?;
        let name = meta.storage_path.file_name().unwrap().to_str().unwrap().to_string();

        // Fresh object, empty active set: must survive a zero grace period
        // only if its mtime is within the window; here we use a generous
        // window so the "just written" object survives.
        let report = store.gc(&HashSet::new(), Duration::from_secs(3600));
        assert!(report.removed.is_empty());
        assert!(store.storage_root().join(&name).exists());

        // No grace period and nothing active: it's gone.
        let report = store.gc(&HashSet::new(), Duration::from_secs(0));
        assert_eq!(report.removed, vec![name.clone()]);
        assert!(!store.storage_root().join(&name).exists());
        Ok(())
    }

    #[test]
    fn gc_never_removes_an_active_object() -> Result<()> {
        let store_dir = TempDir::new()?;
        let src_dir = TempDir::new()?;
        let store = CasStore::new(store_dir.path())?;

        let src = write_src(&src_dir, "a.txt", b"keep me");
        let meta = store.write(&src, None)?;
        let name = meta.storage_path.file_name().unwrap().to_str().unwrap().to_string();

        let mut active = HashSet::new();
        active.insert(name.clone());

        let report = store.gc(&active, Duration::from_secs(0));
        assert!(report.removed.is_empty());
        assert!(store.storage_root().join(&name).exists());
        Ok(())
    }
}
