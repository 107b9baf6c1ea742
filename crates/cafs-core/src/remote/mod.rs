use std::collections::BTreeMap;

use anyhow::Result;

use crate::digest::Digest;
use crate::shard::PrefixInfo;

mod auth;
mod oci;
pub(crate) mod plan;
pub(crate) mod retry;

pub use auth::{Authenticator, EnvAuthenticator};
pub use oci::OciRemote;

/// Inputs to one push: the root index digest, the blobs to consider (the
/// serialized index plus everything pending), the local shard records for
/// diffing, and the tags to publish.
pub struct PushRequest {
    pub root: Digest,
    pub objects: BTreeMap<Digest, Vec<u8>>,
    pub local_prefixes: BTreeMap<String, PrefixInfo>,
    pub tags: Vec<String>,
}

/// What a push committed: the shard records to persist locally and how many
/// layers actually went over the wire.
pub struct PushOutcome {
    pub prefixes: BTreeMap<String, PrefixInfo>,
    pub layers_uploaded: usize,
}

/// What a pull produced: the remote root digest, the blobs recovered from
/// every layer the local state was missing, and the remote shard records.
pub struct PullOutcome {
    pub root: Digest,
    pub objects: BTreeMap<Digest, Vec<u8>>,
    pub prefixes: BTreeMap<String, PrefixInfo>,
}

/// Transport carrying store state to and from a registry. [`OciRemote`] is
/// the production implementation; tests substitute an in-memory one.
pub trait Remote: Send + Sync {
    fn push(&self, request: PushRequest) -> Result<PushOutcome>;

    fn pull(&self, local_prefixes: &BTreeMap<String, PrefixInfo>) -> Result<PullOutcome>;
}
