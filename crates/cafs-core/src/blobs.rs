use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::compression::Compressor;
use crate::digest::Digest;
use crate::error::Error;

const BLOBS_DIR: &str = "blobs";
const ALGORITHM_DIR: &str = "sha256";

/// Persistent content-addressed blob store.
///
/// Layout: `<cacheDir>/blobs/sha256/<first2>/<rest>`. Blobs are immutable;
/// writing an existing digest is a no-op. Digests written since the last
/// successful push accumulate in the pending set, which is transport state
/// and is not persisted: a crash before push loses pending tracking, and
/// those blobs ride along with the next index change instead.
pub struct BlobStore {
    root: PathBuf,
    pending: DashSet<Digest>,
    cache: BlobCache,
    compressor: Compressor,
}

impl BlobStore {
    pub(crate) fn open(cache_dir: &Path, compressor: Compressor, cache_size: usize) -> Result<Self> {
        let root = cache_dir.join(BLOBS_DIR).join(ALGORITHM_DIR);
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create blob directory {}", root.display()))?;
        Ok(Self {
            root,
            pending: DashSet::new(),
            cache: BlobCache::new(cache_size),
            compressor,
        })
    }

    /// Store raw bytes, returning their digest. New digests enter the
    /// pending set; existing blobs are left untouched.
    pub fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::from_bytes(data);
        if self.write_if_absent(&digest, data)? {
            self.pending.insert(digest.clone());
        }
        Ok(digest)
    }

    /// Store bytes under a caller-attested digest (the pull path trusts the
    /// wire). Returns whether the blob was new on disk.
    pub fn put_with_digest(&self, digest: &Digest, data: &[u8]) -> Result<bool> {
        self.write_if_absent(digest, data)
    }

    /// Read a blob back. Fails with [`Error::NotFound`] when absent.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.get(digest) {
            return Ok(data.as_ref().clone());
        }
        let path = self.path(digest);
        let stored = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(digest.to_string()).into());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read blob {}", path.display()));
            }
        };
        let data = self.compressor.decompress(&stored)?;
        self.cache.insert(digest.clone(), Arc::new(data.clone()));
        Ok(data)
    }

    /// Deterministic on-disk location for a digest. External consumers use
    /// this for zero-copy access to stored bytes.
    #[must_use]
    pub fn path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        if hex.len() < 4 {
            return self.root.join(hex);
        }
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    /// Stored file size and existence for a digest.
    #[must_use]
    pub fn stat(&self, digest: &Digest) -> (u64, bool) {
        match fs::metadata(self.path(digest)) {
            Ok(meta) => (meta.len(), true),
            Err(_) => (0, false),
        }
    }

    /// Snapshot of the digests written since the last successful push.
    #[must_use]
    pub fn pending(&self) -> Vec<Digest> {
        self.pending.iter().map(|d| d.key().clone()).collect()
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.clear();
    }

    /// Walk every blob file on disk, yielding `(digest, path)` pairs.
    /// Files whose names do not reassemble into a digest are skipped.
    pub(crate) fn walk(&self) -> Vec<(Digest, PathBuf)> {
        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let hex = match path
                .parent()
                .filter(|parent| *parent != self.root)
                .and_then(|parent| parent.file_name())
                .and_then(|shard| shard.to_str())
            {
                Some(shard) => format!("{shard}{name}"),
                None => name.to_string(),
            };
            if let Ok(digest) = Digest::parse(&hex) {
                found.push((digest, path.to_path_buf()));
            }
        }
        found
    }

    /// Read a blob file straight from disk, bypassing the memory cache.
    /// Integrity sweeps use this so cached bytes cannot mask corruption.
    pub(crate) fn read_from_disk(&self, path: &Path) -> Result<Vec<u8>> {
        let stored = fs::read(path)
            .with_context(|| format!("failed to read blob {}", path.display()))?;
        self.compressor.decompress(&stored)
    }

    pub(crate) fn remove(&self, digest: &Digest, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .with_context(|| format!("failed to delete blob {}", path.display()))?;
        self.cache.evict(digest);
        self.pending.remove(digest);
        Ok(())
    }

    /// Guarded stat-then-write. Returns true when this call created the file.
    fn write_if_absent(&self, digest: &Digest, data: &[u8]) -> Result<bool> {
        let path = self.path(digest);
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create blob shard {}", parent.display()))?;
        }
        let stored = self.compressor.compress(data)?;
        fs::write(&path, stored)
            .with_context(|| format!("failed to write blob {}", path.display()))?;
        self.cache.insert(digest.clone(), Arc::new(data.to_vec()));
        debug!(digest = %digest, size = data.len(), "blob stored");
        Ok(true)
    }
}

/// Bounded digest→bytes cache in front of the blob files. Eviction drops an
/// arbitrary entry once the cap is reached.
struct BlobCache {
    max_entries: usize,
    entries: DashMap<Digest, Arc<Vec<u8>>>,
}

impl BlobCache {
    fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: DashMap::new(),
        }
    }

    fn get(&self, digest: &Digest) -> Option<Arc<Vec<u8>>> {
        self.entries.get(digest).map(|entry| entry.value().clone())
    }

    fn insert(&self, digest: Digest, data: Arc<Vec<u8>>) {
        if self.max_entries == 0 {
            return;
        }
        if self.entries.len() >= self.max_entries {
            if let Some(victim) = self.entries.iter().next().map(|e| e.key().clone()) {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(digest, data);
    }

    fn evict(&self, digest: &Digest) {
        self.entries.remove(digest);
    }
}
