use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::Digest;

/// Preferred layer payload size.
pub const LAYER_TARGET_SIZE: u64 = 5 * 1024 * 1024;

/// Layers below this are allowed to keep growing past the soft max.
pub const LAYER_MIN_SIZE: u64 = 2 * 1024 * 1024;

/// Greedy accumulation cut-off; small layers may grow to twice this.
pub const LAYER_SOFT_MAX: u64 = 10 * 1024 * 1024;

/// Remote-side state for one shard: its content hash and the OCI layer that
/// carries it. Serialized into the `dev.cafs.prefixes` image label and, as
/// `<hash>|<layer>`, into local `_prefix/*` index records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixInfo {
    pub hash: String,
    pub layer: String,
}

/// Partition blobs into the 256 two-hex-char shards.
#[must_use]
pub fn group_by_shard(
    objects: &BTreeMap<Digest, Vec<u8>>,
) -> BTreeMap<String, BTreeMap<Digest, Vec<u8>>> {
    let mut shards: BTreeMap<String, BTreeMap<Digest, Vec<u8>>> = BTreeMap::new();
    for (digest, data) in objects {
        shards
            .entry(digest.shard().to_string())
            .or_default()
            .insert(digest.clone(), data.clone());
    }
    shards
}

/// Deterministic content hash of a shard's blob set.
///
/// Digests are visited in sorted order; each contributes its canonical
/// string followed by the blob length as an 8-byte big-endian integer. Two
/// peers compare these to decide whether a shard needs re-transfer.
#[must_use]
pub fn shard_hash(blobs: &BTreeMap<Digest, Vec<u8>>) -> String {
    if blobs.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    for (digest, data) in blobs {
        hasher.update(digest.as_str().as_bytes());
        hasher.update((data.len() as u64).to_be_bytes());
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Total payload size of a shard.
#[must_use]
pub fn shard_size(blobs: &BTreeMap<Digest, Vec<u8>>) -> u64 {
    blobs.values().map(|data| data.len() as u64).sum()
}

/// Partition shards into ordered layer groups.
///
/// Walks shards by name, greedily accumulating until the next shard would
/// cross [`LAYER_SOFT_MAX`]; a layer still under [`LAYER_MIN_SIZE`] may grow
/// to twice the soft max before cutting. The trailing partial layer is
/// emitted. Deterministic for a given size map.
#[must_use]
pub fn build_layer_plan(shard_sizes: &BTreeMap<String, u64>) -> Vec<Vec<String>> {
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_size = 0u64;

    for (shard, &size) in shard_sizes {
        if current.is_empty() {
            current.push(shard.clone());
            current_size = size;
            continue;
        }
        let grown = current_size + size;
        if grown <= LAYER_SOFT_MAX
            || (current_size < LAYER_MIN_SIZE && grown <= 2 * LAYER_SOFT_MAX)
        {
            current.push(shard.clone());
            current_size = grown;
        } else {
            layers.push(std::mem::take(&mut current));
            current.push(shard.clone());
            current_size = size;
        }
    }
    if !current.is_empty() {
        layers.push(current);
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(data: &[u8]) -> (Digest, Vec<u8>) {
        (Digest::from_bytes(data), data.to_vec())
    }

    #[test]
    fn grouping_uses_first_two_hex_chars() {
        let objects: BTreeMap<_, _> = [blob(b"a"), blob(b"b"), blob(b"c")].into_iter().collect();
        let shards = group_by_shard(&objects);
        for (shard, blobs) in &shards {
            for digest in blobs.keys() {
                assert_eq!(digest.shard(), shard);
            }
        }
        let total: usize = shards.values().map(BTreeMap::len).sum();
        assert_eq!(total, objects.len());
    }

    #[test]
    fn shard_hash_is_deterministic_and_sensitive() {
        let blobs: BTreeMap<_, _> = [blob(b"x"), blob(b"y")].into_iter().collect();
        assert_eq!(shard_hash(&blobs), shard_hash(&blobs.clone()));
        assert!(shard_hash(&blobs).starts_with("sha256:"));

        let mut grown = blobs.clone();
        grown.extend([blob(b"z")]);
        assert_ne!(shard_hash(&blobs), shard_hash(&grown));

        assert_eq!(shard_hash(&BTreeMap::new()), "");
    }

    #[test]
    fn shard_hash_depends_on_lengths() {
        let (digest, _) = blob(b"payload");
        let short: BTreeMap<_, _> = [(digest.clone(), vec![0u8; 4])].into_iter().collect();
        let long: BTreeMap<_, _> = [(digest, vec![0u8; 8])].into_iter().collect();
        assert_ne!(shard_hash(&short), shard_hash(&long));
    }

    #[test]
    fn uniform_small_shards_pack_into_few_layers() {
        // 512 blobs of 4 KiB spread across 256 shards ≈ 8 KiB per shard.
        let sizes: BTreeMap<String, u64> =
            (0..256u32).map(|i| (format!("{i:02x}"), 8 * 1024)).collect();
        let plan = build_layer_plan(&sizes);
        assert!((1..=4).contains(&plan.len()), "got {} layers", plan.len());
        let shards: usize = plan.iter().map(Vec::len).sum();
        assert_eq!(shards, 256);
    }

    #[test]
    fn large_shards_get_their_own_layers() {
        let sizes: BTreeMap<String, u64> = ["aa", "bb", "cc", "dd"]
            .into_iter()
            .map(|s| (s.to_string(), 8 * 1024 * 1024))
            .collect();
        let plan = build_layer_plan(&sizes);
        assert_eq!(plan.len(), 4);
        for layer in &plan {
            assert_eq!(layer.len(), 1);
        }
    }

    #[test]
    fn plan_preserves_shard_order() {
        let sizes: BTreeMap<String, u64> = [("00", 1u64), ("01", 2), ("ff", 3)]
            .into_iter()
            .map(|(s, n)| (s.to_string(), n))
            .collect();
        let plan = build_layer_plan(&sizes);
        let flattened: Vec<_> = plan.into_iter().flatten().collect();
        assert_eq!(flattened, vec!["00", "01", "ff"]);
    }

    #[test]
    fn empty_plan_is_empty() {
        assert!(build_layer_plan(&BTreeMap::new()).is_empty());
    }
}
