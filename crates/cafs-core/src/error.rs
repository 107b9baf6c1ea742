use crate::digest::Digest;

/// Errors surfaced by the store.
///
/// Most functions return [`anyhow::Result`] with one of these as the root
/// cause; callers that need to branch on the kind use
/// `err.downcast_ref::<Error>()`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key absent from the index, or a blob missing from disk on a path
    /// that assumed presence.
    #[error("cafs: not found: {0}")]
    NotFound(String),

    /// Push/Pull on a store opened without a registry in its reference.
    #[error("cafs: no remote configured for {0}")]
    NoRemote(String),

    /// Put on a key starting with the reserved `_` prefix.
    #[error("cafs: key {0:?} uses the reserved '_' prefix")]
    ReservedKey(String),

    /// Unparseable `[registry/]path:tag` reference string.
    #[error("cafs: invalid reference {0:?}")]
    InvalidRef(String),

    /// Malformed content digest.
    #[error("cafs: invalid digest {0:?}")]
    InvalidDigest(String),

    /// Digest mismatch on decode.
    #[error("cafs: corrupted data for {digest} (computed {actual})")]
    DigestMismatch { digest: Digest, actual: Digest },

    /// Structurally invalid packed data.
    #[error("cafs: corrupted data: {0}")]
    Corrupted(String),

    /// A network primitive that kept failing after the retry budget.
    #[error("cafs: {op} failed after {attempts} attempts: {source}")]
    Network {
        op: &'static str,
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },
}
