use std::collections::BTreeMap;

use anyhow::Result;

use crate::compression;
use crate::digest::Digest;
use crate::layer;
use crate::shard::{self, PrefixInfo};

/// One planned image layer: the shards it carries, the packed payload, the
/// zstd frame that goes over the wire, and the frame's OCI digest.
pub(crate) struct BuiltLayer {
    pub(crate) shards: Vec<String>,
    pub(crate) packed: Vec<u8>,
    pub(crate) compressed: Vec<u8>,
    pub(crate) digest: String,
}

/// Turn a push's object set into layers, diffing against the local shard
/// records.
///
/// The object map must carry the complete live content of every shard it
/// touches: an emitted layer replaces that shard's prefix record, and a
/// fresh puller fetches nothing else for the shard. Shards whose content
/// hash matches the local record are carried forward untouched; the rest
/// run through the layer plan and are packed, one layer per shard group.
/// The returned prefix map covers every shard the remote will know about
/// after this push.
pub(crate) fn build_push_layers(
    objects: &BTreeMap<Digest, Vec<u8>>,
    local_prefixes: &BTreeMap<String, PrefixInfo>,
) -> Result<(Vec<BuiltLayer>, BTreeMap<String, PrefixInfo>)> {
    let by_shard = shard::group_by_shard(objects);

    let mut current_hashes = BTreeMap::new();
    for (name, blobs) in &by_shard {
        current_hashes.insert(name.clone(), shard::shard_hash(blobs));
    }

    let mut changed_sizes = BTreeMap::new();
    for (name, blobs) in &by_shard {
        let unchanged = local_prefixes
            .get(name)
            .is_some_and(|local| local.hash == current_hashes[name]);
        if !unchanged {
            changed_sizes.insert(name.clone(), shard::shard_size(blobs));
        }
    }

    let mut prefixes = local_prefixes.clone();
    let mut layers = Vec::new();
    for group in shard::build_layer_plan(&changed_sizes) {
        let mut blobs = BTreeMap::new();
        for name in &group {
            blobs.extend(by_shard[name].clone());
        }
        let packed = layer::pack(&blobs);
        let compressed = compression::compress_layer(&packed)?;
        let digest = Digest::from_bytes(&compressed).to_string();
        for name in &group {
            prefixes.insert(
                name.clone(),
                PrefixInfo {
                    hash: current_hashes[name].clone(),
                    layer: digest.clone(),
                },
            );
        }
        layers.push(BuiltLayer {
            shards: group,
            packed,
            compressed,
            digest,
        });
    }

    Ok((layers, prefixes))
}

/// Decide which remote layers a pull must fetch: one entry per distinct
/// layer whose shards are missing locally or differ in content hash.
pub(crate) fn needed_layers(
    remote_prefixes: &BTreeMap<String, PrefixInfo>,
    local_prefixes: &BTreeMap<String, PrefixInfo>,
) -> BTreeMap<String, Vec<String>> {
    let mut needed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, remote) in remote_prefixes {
        let unchanged = local_prefixes
            .get(name)
            .is_some_and(|local| local.hash == remote.hash);
        if !unchanged {
            needed.entry(remote.layer.clone()).or_default().push(name.clone());
        }
    }
    needed
}
