#![deny(clippy::all, warnings)]

//! Content-addressed object store with a key→digest index, merkle subtree
//! hashing, and incremental synchronization through OCI registries.
//!
//! State is addressed as `[registry/]path:tag`. Blobs live on disk keyed by
//! their SHA-256 digest; a flat index maps keys to blobs; sync ships only
//! the shards that changed since the last push, packed into image layers.

mod blobs;
mod compression;
mod digest;
mod error;
mod index;
pub mod layer;
mod options;
mod reference;
mod remote;
pub mod shard;
mod store;

pub use blobs::BlobStore;
pub use digest::{Digest, DIGEST_PREFIX};
pub use error::Error;
pub use index::{Index, Info, INTERNAL_PREFIX};
pub use options::{default_cache_dir, AutoPull, Options, DEFAULT_CACHE_SIZE, DEFAULT_CONCURRENCY};
pub use reference::{StoreRef, DEFAULT_TAG};
pub use remote::{
    Authenticator, EnvAuthenticator, OciRemote, PullOutcome, PushOutcome, PushRequest, Remote,
};
pub use shard::PrefixInfo;
pub use store::{Stats, Store, VerifySummary};
