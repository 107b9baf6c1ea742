use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::Digest;
use crate::shard::PrefixInfo;

/// Keys under this prefix are sync bookkeeping, invisible to callers.
pub const INTERNAL_PREFIX: &str = "_prefix/";

/// Index value: where a key's content lives and how big it is, plus
/// optional caller-defined metadata. Metadata rides along in the serialized
/// index but never participates in merkle hashing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(rename = "d")]
    pub digest: Digest,
    #[serde(rename = "s")]
    pub size: u64,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Info {
    /// Decode the metadata against a caller-provided shape.
    ///
    /// Returns `Ok(None)` when the entry carries no metadata.
    pub fn decode_meta<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.meta {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .context("failed to decode entry metadata"),
            None => Ok(None),
        }
    }
}

/// Concurrent key→[`Info`] mapping with prefix iteration, merkle hashing,
/// and lossless JSON serialization.
///
/// Single-key reads and writes are atomic; iteration is not
/// snapshot-consistent and may observe concurrent writes.
pub struct Index {
    entries: DashMap<String, Info>,
    dirty: AtomicBool,
}

impl Index {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            dirty: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Info> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Insert or overwrite an entry and mark the index dirty. Reserved-key
    /// policy is enforced by the store facade; the sync layer comes through
    /// here for its `_prefix/*` records.
    pub fn set(&self, key: &str, info: Info) {
        self.entries.insert(key.to_string(), info);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Remove an entry. Marks dirty only when something was removed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    /// Number of non-internal entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.key().starts_with(INTERNAL_PREFIX))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Single-pass listing of `(relative key, Info)` for every non-internal
    /// key starting with `prefix`.
    pub fn list(&self, prefix: &str) -> impl Iterator<Item = (String, Info)> {
        let mut matched: Vec<(String, Info)> = self
            .entries
            .iter()
            .filter(|entry| {
                !entry.key().starts_with(INTERNAL_PREFIX) && entry.key().starts_with(prefix)
            })
            .map(|entry| (entry.key()[prefix.len()..].to_string(), entry.value().clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        matched.into_iter()
    }

    /// Merkle hash of a key prefix.
    ///
    /// Pure function of the filtered `(relative key, digest, size)` set:
    /// each entry contributes `rel \x00 digest \x00 decimal(size)`, lines
    /// are byte-sorted and newline-joined, and the result is `sha256:` +
    /// hex. The empty set hashes to the empty string. Metadata does not
    /// participate. Concurrent writers make this a best-effort snapshot.
    #[must_use]
    pub fn hash(&self, prefix: &str) -> String {
        let mut lines: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|entry| {
                !entry.key().starts_with(INTERNAL_PREFIX) && entry.key().starts_with(prefix)
            })
            .map(|entry| {
                let rel = &entry.key()[prefix.len()..];
                let info = entry.value();
                let mut line =
                    Vec::with_capacity(rel.len() + info.digest.as_str().len() + 24);
                line.extend_from_slice(rel.as_bytes());
                line.push(0);
                line.extend_from_slice(info.digest.as_str().as_bytes());
                line.push(0);
                line.extend_from_slice(info.size.to_string().as_bytes());
                line
            })
            .collect();
        if lines.is_empty() {
            return String::new();
        }
        lines.sort();

        let mut hasher = Sha256::new();
        for (pos, line) in lines.iter().enumerate() {
            if pos > 0 {
                hasher.update(b"\n");
            }
            hasher.update(line);
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    /// Merkle hash of the whole tree.
    #[must_use]
    pub fn root(&self) -> String {
        self.hash("")
    }

    /// Serialize to the index file format: a JSON object keyed by the full
    /// key string, `_prefix/*` records included, keys in sorted order so the
    /// output is byte-stable.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let ordered: BTreeMap<String, Info> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        serde_json::to_vec(&ordered).context("failed to serialize index")
    }

    /// Serialize only the user-visible entries. This is the form pushed as
    /// the index blob: `_prefix/*` records change after every push, so
    /// including them would keep the blob digest moving and no-op pushes
    /// would never converge to manifest-only. The records travel in the
    /// image's prefix label instead.
    pub fn serialize_public(&self) -> Result<Vec<u8>> {
        let ordered: BTreeMap<String, Info> = self
            .entries
            .iter()
            .filter(|entry| !entry.key().starts_with(INTERNAL_PREFIX))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        serde_json::to_vec(&ordered).context("failed to serialize index")
    }

    /// Parse a serialized index into an entry map.
    pub fn parse(data: &[u8]) -> Result<BTreeMap<String, Info>> {
        serde_json::from_slice(data).context("failed to parse index")
    }

    /// Replace every entry with the given set. Marks dirty.
    pub fn replace(&self, entries: BTreeMap<String, Info>) {
        self.entries.clear();
        for (key, info) in entries {
            self.entries.insert(key, info);
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Load a serialized index, replacing the current contents without
    /// marking dirty (used when reading the persisted file at open).
    pub fn load(&self, data: &[u8]) -> Result<()> {
        let entries = Self::parse(data)?;
        self.entries.clear();
        for (key, info) in entries {
            self.entries.insert(key, info);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Decode the `_prefix/*` records into shard→[`PrefixInfo`] form.
    /// Records whose payload does not split into `<hash>|<layer>` are
    /// skipped.
    #[must_use]
    pub fn prefix_records(&self) -> BTreeMap<String, PrefixInfo> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let shard = entry.key().strip_prefix(INTERNAL_PREFIX)?;
                let (hash, layer) = entry.value().digest.as_str().split_once('|')?;
                Some((
                    shard.to_string(),
                    PrefixInfo {
                        hash: hash.to_string(),
                        layer: layer.to_string(),
                    },
                ))
            })
            .collect()
    }

    /// Replace the `_prefix/*` records with the given map. Marks dirty.
    pub fn set_prefix_records(&self, prefixes: &BTreeMap<String, PrefixInfo>) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(INTERNAL_PREFIX))
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            self.entries.remove(&key);
        }
        for (shard, info) in prefixes {
            self.entries.insert(
                format!("{INTERNAL_PREFIX}{shard}"),
                Info {
                    digest: Digest::raw(format!("{}|{}", info.hash, info.layer)),
                    size: 0,
                    meta: None,
                },
            );
        }
        self.dirty.store(true, Ordering::SeqCst);
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(data: &[u8]) -> Info {
        Info {
            digest: Digest::from_bytes(data),
            size: data.len() as u64,
            meta: None,
        }
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let forward = Index::new();
        forward.set("a/b", info(b"x"));
        forward.set("a/c", info(b"y"));
        forward.set("z", info(b"q"));

        let reverse = Index::new();
        reverse.set("z", info(b"q"));
        reverse.set("a/c", info(b"y"));
        reverse.set("a/b", info(b"x"));

        assert_eq!(forward.root(), reverse.root());
        assert_eq!(forward.hash("a/"), reverse.hash("a/"));
        assert_ne!(forward.hash("a/"), forward.root());
    }

    #[test]
    fn subtree_hash_tracks_its_prefix_only() {
        let index = Index::new();
        index.set("a/b", info(b"x"));
        index.set("a/c", info(b"y"));
        index.set("z", info(b"q"));

        let before_a = index.hash("a/");
        let before_z = index.hash("z/");
        index.set("a/b", info(b"x2"));
        assert_ne!(index.hash("a/"), before_a);
        assert_eq!(index.hash("z/"), before_z);
        assert_eq!(index.hash("z/"), "", "z/ matches no keys in either state");

        let before_root = index.root();
        index.set("z", info(b"q2"));
        assert_ne!(index.root(), before_root);
    }

    #[test]
    fn empty_prefix_set_hashes_to_empty_string() {
        let index = Index::new();
        assert_eq!(index.root(), "");
        index.set("a", info(b"x"));
        assert_ne!(index.root(), "");
        assert_eq!(index.hash("nothing/"), "");
    }

    #[test]
    fn metadata_does_not_affect_hashes() {
        let index = Index::new();
        index.set("k", info(b"v"));
        let before = index.root();

        let mut with_meta = info(b"v");
        with_meta.meta = Some(json!({"build": "id-1", "flags": [1, 2, 3]}));
        index.set("k", with_meta);
        assert_eq!(index.root(), before);
    }

    #[test]
    fn serialization_round_trips_byte_equal() {
        let index = Index::new();
        let mut rich = info(b"v");
        rich.meta = Some(json!({"n": 42, "s": "text", "b": true, "seq": [1, "two"]}));
        index.set("path/to/key", rich);
        index.set("other", info(b"w"));
        index.set_prefix_records(
            &[(
                "ab".to_string(),
                PrefixInfo {
                    hash: "sha256:feed".to_string(),
                    layer: "sha256:beef".to_string(),
                },
            )]
            .into_iter()
            .collect(),
        );

        let first = index.serialize().unwrap();
        let reloaded = Index::new();
        reloaded.load(&first).unwrap();
        let second = reloaded.serialize().unwrap();
        assert_eq!(first, second);
        assert_eq!(reloaded.prefix_records(), index.prefix_records());
    }

    #[test]
    fn public_serialization_is_stable_across_prefix_churn() {
        let index = Index::new();
        index.set("key", info(b"v"));

        let before = index.serialize_public().unwrap();
        index.set_prefix_records(
            &[(
                "ab".to_string(),
                PrefixInfo {
                    hash: "sha256:feed".to_string(),
                    layer: "sha256:beef".to_string(),
                },
            )]
            .into_iter()
            .collect(),
        );
        let after = index.serialize_public().unwrap();
        assert_eq!(before, after, "prefix records must not leak into the blob");

        let entries = Index::parse(&after).unwrap();
        assert!(entries.keys().all(|key| !key.starts_with(INTERNAL_PREFIX)));
        // The full form, by contrast, carries the records.
        let full = Index::parse(&index.serialize().unwrap()).unwrap();
        assert!(full.keys().any(|key| key.starts_with(INTERNAL_PREFIX)));
    }

    #[test]
    fn typed_meta_decode_matches_caller_shape() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct BuildMeta {
            action: String,
            outputs: Vec<String>,
        }

        let mut entry = info(b"v");
        entry.meta = Some(json!({"action": "compile", "outputs": ["a.o", "b.o"]}));
        let decoded: BuildMeta = entry.decode_meta().unwrap().unwrap();
        assert_eq!(
            decoded,
            BuildMeta {
                action: "compile".to_string(),
                outputs: vec!["a.o".to_string(), "b.o".to_string()],
            }
        );

        let bare = info(b"v");
        assert_eq!(bare.decode_meta::<BuildMeta>().unwrap(), None);
    }

    #[test]
    fn listing_is_relative_and_skips_internal_records() {
        let index = Index::new();
        index.set("a/b", info(b"x"));
        index.set("a/c", info(b"y"));
        index.set("z", info(b"q"));
        index.set_prefix_records(
            &[(
                "00".to_string(),
                PrefixInfo {
                    hash: "h".to_string(),
                    layer: "l".to_string(),
                },
            )]
            .into_iter()
            .collect(),
        );

        let under_a: Vec<String> = index.list("a/").map(|(rel, _)| rel).collect();
        assert_eq!(under_a, vec!["b", "c"]);

        let all: Vec<String> = index.list("").map(|(rel, _)| rel).collect();
        assert_eq!(all, vec!["a/b", "a/c", "z"]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn dirty_flag_follows_writes_not_reads() {
        let index = Index::new();
        assert!(!index.is_dirty());
        index.set("k", info(b"v"));
        assert!(index.is_dirty());

        index.clear_dirty();
        let _ = index.get("k");
        let _ = index.root();
        let _: Vec<_> = index.list("").collect();
        assert!(!index.is_dirty());

        assert!(index.delete("k"));
        assert!(index.is_dirty());
        index.clear_dirty();
        assert!(!index.delete("k"));
        assert!(!index.is_dirty());
    }

    #[test]
    fn prefix_records_round_trip_through_compound_digests() {
        let index = Index::new();
        let records: BTreeMap<String, PrefixInfo> = [
            ("ab", ("sha256:aaa", "sha256:lll")),
            ("cd", ("sha256:bbb", "sha256:mmm")),
        ]
        .into_iter()
        .map(|(shard, (hash, layer))| {
            (
                shard.to_string(),
                PrefixInfo {
                    hash: hash.to_string(),
                    layer: layer.to_string(),
                },
            )
        })
        .collect();

        index.set_prefix_records(&records);
        assert_eq!(index.prefix_records(), records);

        // Replacement drops records for shards no longer present.
        let smaller: BTreeMap<String, PrefixInfo> = records
            .iter()
            .take(1)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        index.set_prefix_records(&smaller);
        assert_eq!(index.prefix_records(), smaller);
    }
}
