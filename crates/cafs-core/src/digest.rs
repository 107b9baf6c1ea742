use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// Algorithm prefix carried by every canonical digest.
pub const DIGEST_PREFIX: &str = "sha256:";

/// Length of the hex portion of a canonical digest.
const HEX_LEN: usize = 64;

/// Canonical content identifier: `sha256:` followed by 64 lowercase hex
/// characters, computed over the raw (uncompressed) blob bytes.
///
/// The inner string is not always a digest: the sync layer reuses the same
/// slot for its `<hash>|<layer>` prefix records, so validation happens in
/// [`Digest::parse`] rather than on deserialization.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Hash raw bytes into their canonical digest.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(format!("{DIGEST_PREFIX}{}", hex::encode(Sha256::digest(data))))
    }

    /// Parse a digest string, normalizing inputs that lack the `sha256:`
    /// prefix by prepending it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDigest`] when the hex portion is not 64
    /// lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        let hex_part = value.strip_prefix(DIGEST_PREFIX).unwrap_or(value);
        if hex_part.len() != HEX_LEN
            || !hex_part
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(Error::InvalidDigest(value.to_string()).into());
        }
        Ok(Self(format!("{DIGEST_PREFIX}{hex_part}")))
    }

    /// Wrap an already-formed value without validation. The sync layer uses
    /// this for compound `_prefix/*` records.
    pub(crate) fn raw(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex portion without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.strip_prefix(DIGEST_PREFIX).unwrap_or(&self.0)
    }

    /// First two hex characters; the shard this digest belongs to.
    #[must_use]
    pub fn shard(&self) -> &str {
        let hex = self.hex();
        if hex.len() >= 2 {
            &hex[..2]
        } else {
            "00"
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn hashes_bytes_into_canonical_form() {
        let digest = Digest::from_bytes(b"");
        assert_eq!(digest.as_str(), format!("sha256:{EMPTY_SHA256}"));
        assert_eq!(digest.hex(), EMPTY_SHA256);
        assert_eq!(digest.shard(), "e3");
    }

    #[test]
    fn parse_normalizes_missing_prefix() {
        let bare = Digest::parse(EMPTY_SHA256).unwrap();
        let prefixed = Digest::parse(&format!("sha256:{EMPTY_SHA256}")).unwrap();
        assert_eq!(bare, prefixed);
        assert!(bare.as_str().starts_with("sha256:"));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for bad in ["", "sha256:", "sha256:abc", "sha256:XYZ", "notahash"] {
            let err = Digest::parse(bad).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<Error>(), Some(Error::InvalidDigest(_))),
                "expected InvalidDigest for {bad:?}"
            );
        }
        let upper = format!("sha256:{}", EMPTY_SHA256.to_uppercase());
        assert!(Digest::parse(&upper).is_err());
    }

    #[test]
    fn same_bytes_same_digest() {
        assert_eq!(Digest::from_bytes(b"payload"), Digest::from_bytes(b"payload"));
        assert_ne!(Digest::from_bytes(b"payload"), Digest::from_bytes(b"payload2"));
    }
}
