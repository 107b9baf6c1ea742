use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::compression::Compressor;
use crate::digest::Digest;
use crate::error::Error;
use crate::index::{Index, Info};
use crate::options::{expand_path, AutoPull, Options};
use crate::reference::StoreRef;
use crate::remote::{EnvAuthenticator, OciRemote, PushRequest, Remote};

const INDEX_DIR: &str = "index";

/// Aggregate numbers for a store: non-internal entries, distinct referenced
/// blobs, and their total uncompressed size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub entries: usize,
    pub blobs: usize,
    pub total_size: u64,
}

/// Outcome of an integrity sweep over the blob store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub scanned: usize,
    pub corrupt: usize,
    pub missing: usize,
}

/// A content-addressed store bound to one `[registry/]path:tag` reference.
///
/// Wraps the blob store and index behind a key/value surface, persists the
/// index as JSON under the cache directory, and syncs changed shards with
/// the registry named by the reference. All operations are safe under
/// concurrent callers; push and pull additionally serialize against each
/// other.
pub struct Store {
    store_ref: StoreRef,
    index_path: PathBuf,
    blobs: BlobStore,
    index: Index,
    remote: Option<Box<dyn Remote>>,
    sync_lock: Mutex<()>,
}

impl Store {
    /// Open (creating as needed) the local state for `reference` and wire up
    /// its remote when the reference names a registry.
    ///
    /// Auto-pull failures are swallowed: the store stays usable against
    /// local state and the caller can retry with [`Store::pull`].
    pub fn open(reference: &str, options: Options) -> Result<Self> {
        let store_ref = StoreRef::parse(reference)?;
        let cache_dir = expand_path(&options.cache_dir);

        let compressor = Compressor::new(options.compression_level, options.compression_enabled);
        let blobs = BlobStore::open(&cache_dir, compressor, options.cache_size)?;

        let index = Index::new();
        let index_path = cache_dir
            .join(INDEX_DIR)
            .join(format!("{}.json", store_ref.sanitized()));
        let have_local = index_path.exists();
        if have_local {
            let data = fs::read(&index_path)
                .with_context(|| format!("failed to read index {}", index_path.display()))?;
            if let Err(err) = index.load(&data) {
                warn!(path = %index_path.display(), error = %err, "ignoring unreadable index file");
            }
        }

        let remote: Option<Box<dyn Remote>> = store_ref.registry.as_ref().map(|registry| {
            let auth = options
                .auth
                .clone()
                .unwrap_or_else(|| Arc::new(EnvAuthenticator));
            Box::new(OciRemote::new(
                registry.clone(),
                store_ref.repository.clone(),
                store_ref.tag.clone(),
                auth,
                options.concurrency,
            )) as Box<dyn Remote>
        });

        let store = Self {
            store_ref,
            index_path,
            blobs,
            index,
            remote,
            sync_lock: Mutex::new(()),
        };

        let should_pull = match options.auto_pull {
            AutoPull::Always => true,
            AutoPull::Missing => !have_local,
            AutoPull::Never => false,
        };
        if should_pull && store.remote.is_some() {
            if let Err(err) = store.pull() {
                warn!(reference = %store.store_ref, error = %err, "auto-pull failed");
            }
        }

        for prefix in &options.prefetch {
            store.prefetch(prefix);
        }

        Ok(store)
    }

    /// The parsed reference this store is bound to.
    #[must_use]
    pub fn reference(&self) -> &StoreRef {
        &self.store_ref
    }

    /// Store bytes under a key. Keys starting with `_` are reserved.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<Info> {
        self.put_with_meta(key, data, None)
    }

    /// [`Store::put`] with caller-defined metadata attached to the entry.
    pub fn put_with_meta(
        &self,
        key: &str,
        data: &[u8],
        meta: Option<serde_json::Value>,
    ) -> Result<Info> {
        if key.starts_with('_') {
            return Err(Error::ReservedKey(key.to_string()).into());
        }
        let digest = self.blobs.put(data)?;
        let info = Info {
            digest,
            size: data.len() as u64,
            meta,
        };
        self.index.set(key, info.clone());
        Ok(info)
    }

    /// Read the bytes a key points at.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let info = self
            .index
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        self.blobs.get(&info.digest)
    }

    /// Entry record for a key, if present.
    #[must_use]
    pub fn stat(&self, key: &str) -> Option<Info> {
        self.index.get(key)
    }

    /// Remove a key. The blob stays until [`Store::gc`].
    pub fn delete(&self, key: &str) -> bool {
        self.index.delete(key)
    }

    /// Drop every index entry, internal records included. Blobs stay on
    /// disk until [`Store::gc`].
    pub fn clear(&self) {
        self.index.replace(BTreeMap::new());
    }

    /// On-disk blob path for a key, for zero-copy consumers.
    #[must_use]
    pub fn path(&self, key: &str) -> Option<PathBuf> {
        self.index.get(key).map(|info| self.blobs.path(&info.digest))
    }

    /// List `(relative key, Info)` under a key prefix.
    pub fn list(&self, prefix: &str) -> impl Iterator<Item = (String, Info)> {
        self.index.list(prefix)
    }

    /// Merkle hash of a key prefix; empty string when nothing matches.
    #[must_use]
    pub fn hash(&self, prefix: &str) -> String {
        self.index.hash(prefix)
    }

    /// Merkle hash of the whole tree.
    #[must_use]
    pub fn root(&self) -> String {
        self.index.root()
    }

    /// Persist the index file if anything changed since the last sync.
    pub fn sync(&self) -> Result<()> {
        if !self.index.is_dirty() {
            return Ok(());
        }
        let data = self.index.serialize()?;
        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create index directory {}", parent.display()))?;
        }
        fs::write(&self.index_path, data)
            .with_context(|| format!("failed to write index {}", self.index_path.display()))?;
        self.index.clear_dirty();
        debug!(path = %self.index_path.display(), "index synced");
        Ok(())
    }

    /// Push the serialized index plus the full contents of every shard
    /// touched since the last push, one image per tag (the reference's own
    /// tag when none are given).
    ///
    /// Returns the root index digest the remote now points at. On success
    /// the returned shard records are persisted and the pending set is
    /// cleared.
    pub fn push(&self, tags: &[String]) -> Result<Digest> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::NoRemote(self.store_ref.to_string()))?;
        let _guard = self
            .sync_lock
            .lock()
            .map_err(|_| anyhow!("sync lock poisoned"))?;

        let index_bytes = self.index.serialize_public()?;
        let root = self.blobs.put(&index_bytes)?;

        // Shards touched since the last push. A changed shard's layer must
        // repack the shard's complete live content, not just the blobs that
        // are new this round: its prefix record overwrites the previous
        // layer reference, so anything left out would become unreachable
        // for fresh pullers.
        let mut candidates: HashSet<String> = HashSet::new();
        candidates.insert(root.shard().to_string());
        for digest in self.blobs.pending() {
            candidates.insert(digest.shard().to_string());
        }

        let mut objects = BTreeMap::new();
        objects.insert(root.clone(), index_bytes);
        for (key, info) in self.index.list("") {
            if !candidates.contains(info.digest.shard()) || objects.contains_key(&info.digest) {
                continue;
            }
            let data = self.blobs.get(&info.digest).with_context(|| {
                format!("blob {} for key {key:?} is missing before push", info.digest)
            })?;
            objects.insert(info.digest.clone(), data);
        }

        let outcome = remote.push(PushRequest {
            root: root.clone(),
            objects,
            local_prefixes: self.index.prefix_records(),
            tags: tags.to_vec(),
        })?;

        self.index.set_prefix_records(&outcome.prefixes);
        self.blobs.clear_pending();
        self.sync()?;
        info!(
            reference = %self.store_ref,
            root = %root,
            layers = outcome.layers_uploaded,
            "push complete"
        );
        Ok(root)
    }

    /// Replace local state with the remote's, fetching only the layers whose
    /// shards differ. On failure the in-memory index is left untouched.
    pub fn pull(&self) -> Result<()> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::NoRemote(self.store_ref.to_string()))?;
        let _guard = self
            .sync_lock
            .lock()
            .map_err(|_| anyhow!("sync lock poisoned"))?;

        let mut outcome = remote.pull(&self.index.prefix_records())?;
        let index_blob_at_hand = outcome.objects.contains_key(&outcome.root)
            || self.blobs.stat(&outcome.root).1;
        if !index_blob_at_hand {
            // The local copy of an unchanged index blob can be gone (a gc
            // between syncs); refetch the whole image instead of failing.
            debug!(root = %outcome.root, "index blob unavailable, refetching all layers");
            outcome = remote.pull(&BTreeMap::new())?;
        }

        for (digest, data) in &outcome.objects {
            let actual = Digest::from_bytes(data);
            if actual != *digest {
                return Err(Error::DigestMismatch {
                    digest: digest.clone(),
                    actual,
                }
                .into());
            }
            self.blobs.put_with_digest(digest, data)?;
        }

        let index_bytes = match outcome.objects.get(&outcome.root) {
            Some(data) => data.clone(),
            None => self.blobs.get(&outcome.root).with_context(|| {
                format!("index blob {} is in neither the pulled layers nor the local store", outcome.root)
            })?,
        };
        let entries = Index::parse(&index_bytes)?;

        self.index.replace(entries);
        self.index.set_prefix_records(&outcome.prefixes);
        self.sync()?;
        info!(reference = %self.store_ref, root = %outcome.root, "pull complete");
        Ok(())
    }

    /// Delete every blob no non-internal index entry references. Returns how
    /// many files were removed.
    pub fn gc(&self) -> Result<usize> {
        let mut referenced: HashSet<Digest> = self
            .index
            .list("")
            .map(|(_, info)| info.digest)
            .collect();
        // The serialized-index blob is addressed by the sync labels rather
        // than an index key; spare the current one so pull's local fallback
        // keeps working after a sweep.
        referenced.insert(Digest::from_bytes(&self.index.serialize_public()?));
        let mut removed = 0;
        for (digest, path) in self.blobs.walk() {
            if !referenced.contains(&digest) {
                self.blobs.remove(&digest, &path)?;
                removed += 1;
            }
        }
        debug!(removed, "gc swept blob store");
        Ok(removed)
    }

    /// Re-hash every blob on disk and confirm each non-internal entry's
    /// blob exists. Corrupt or unreadable files are counted, not deleted;
    /// run [`Store::gc`] after deleting the offending keys to reclaim them.
    pub fn verify(&self) -> Result<VerifySummary> {
        let mut summary = VerifySummary::default();
        for (digest, path) in self.blobs.walk() {
            summary.scanned += 1;
            match self.blobs.read_from_disk(&path) {
                Ok(data) if Digest::from_bytes(&data) == digest => {}
                Ok(_) => {
                    warn!(digest = %digest, path = %path.display(), "blob content mismatch");
                    summary.corrupt += 1;
                }
                Err(err) => {
                    warn!(digest = %digest, path = %path.display(), error = %err, "blob unreadable");
                    summary.corrupt += 1;
                }
            }
        }
        for (key, info) in self.index.list("") {
            let (_, exists) = self.blobs.stat(&info.digest);
            if !exists {
                warn!(key = %key, digest = %info.digest, "entry references a missing blob");
                summary.missing += 1;
            }
        }
        Ok(summary)
    }

    /// Entry, blob, and size counters over the non-internal index.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut unique = HashSet::new();
        let mut stats = Stats::default();
        for (_, info) in self.index.list("") {
            stats.entries += 1;
            if unique.insert(info.digest.clone()) {
                stats.blobs += 1;
                stats.total_size += info.size;
            }
        }
        stats
    }

    /// Close the store; implies [`Store::sync`].
    pub fn close(&self) -> Result<()> {
        self.sync()
    }

    /// Warm the blob cache for every entry under a key prefix; read failures
    /// are ignored.
    fn prefetch(&self, prefix: &str) {
        for (_, info) in self.index.list(prefix) {
            let _ = self.blobs.get(&info.digest);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_remote(mut self, remote: Box<dyn Remote>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[cfg(test)]
    pub(crate) fn index_file(&self) -> &PathBuf {
        &self.index_path
    }
}
