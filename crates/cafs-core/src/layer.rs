use std::collections::BTreeMap;

use anyhow::Result;

use crate::digest::Digest;
use crate::error::Error;

/// Fixed width of the digest field: "sha256:" (7) + 64 hex, NUL right-padded.
const DIGEST_FIELD_LEN: usize = 71;

/// Width of the big-endian length field.
const LEN_FIELD_LEN: usize = 8;

/// Pack a map of blobs into the layer wire format.
///
/// Each record is `digest (71 bytes, NUL padded) | length (8 bytes BE) |
/// data`. Records are emitted in ascending digest order so the output is
/// deterministic for a given input set. There is no header; an empty map
/// packs to empty bytes.
#[must_use]
pub fn pack(blobs: &BTreeMap<Digest, Vec<u8>>) -> Vec<u8> {
    let total: usize = blobs
        .values()
        .map(|data| DIGEST_FIELD_LEN + LEN_FIELD_LEN + data.len())
        .sum();
    let mut buf = Vec::with_capacity(total);
    for (digest, data) in blobs {
        let mut field = [0u8; DIGEST_FIELD_LEN];
        let text = digest.as_str().as_bytes();
        field[..text.len().min(DIGEST_FIELD_LEN)]
            .copy_from_slice(&text[..text.len().min(DIGEST_FIELD_LEN)]);
        buf.extend_from_slice(&field);
        buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
        buf.extend_from_slice(data);
    }
    buf
}

/// Invert [`pack`]. Trailing NULs are trimmed from the digest field; EOF
/// terminates the record stream.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] on truncated records and
/// [`Error::InvalidDigest`] when a digest field does not parse.
pub fn unpack(data: &[u8]) -> Result<BTreeMap<Digest, Vec<u8>>> {
    let mut blobs = BTreeMap::new();
    let mut rest = data;
    while !rest.is_empty() {
        let field = take(&mut rest, DIGEST_FIELD_LEN, "digest field")?;
        let trimmed = &field[..field
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |pos| pos + 1)];
        let text = std::str::from_utf8(trimmed)
            .map_err(|_| Error::Corrupted("digest field is not UTF-8".to_string()))?;
        let digest = Digest::parse(text)?;

        let len_bytes = take(&mut rest, LEN_FIELD_LEN, "length field")?;
        let mut len_field = [0u8; LEN_FIELD_LEN];
        len_field.copy_from_slice(len_bytes);
        let length = u64::from_be_bytes(len_field);
        let length = usize::try_from(length)
            .map_err(|_| Error::Corrupted(format!("record length {length} overflows")))?;

        let body = take(&mut rest, length, "record data")?;
        blobs.insert(digest, body.to_vec());
    }
    Ok(blobs)
}

/// Full-read slicing: a short remainder is corruption, never a partial read.
fn take<'a>(rest: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    if rest.len() < len {
        return Err(Error::Corrupted(format!(
            "truncated {what}: need {len} bytes, have {}",
            rest.len()
        ))
        .into());
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_map(entries: &[&[u8]]) -> BTreeMap<Digest, Vec<u8>> {
        entries
            .iter()
            .map(|data| (Digest::from_bytes(data), data.to_vec()))
            .collect()
    }

    #[test]
    fn round_trips_arbitrary_maps() {
        let blobs = blob_map(&[b"alpha", b"beta", &[0u8; 300], b"\x00\x01\x02"]);
        let packed = pack(&blobs);
        assert_eq!(unpack(&packed).unwrap(), blobs);
    }

    #[test]
    fn empty_map_packs_to_empty_bytes() {
        let blobs = BTreeMap::new();
        let packed = pack(&blobs);
        assert!(packed.is_empty());
        assert_eq!(unpack(&packed).unwrap(), blobs);
    }

    #[test]
    fn zero_byte_entry_is_79_bytes() {
        let blobs = blob_map(&[b""]);
        let packed = pack(&blobs);
        assert_eq!(packed.len(), 79);
        assert_eq!(unpack(&packed).unwrap(), blobs);
    }

    #[test]
    fn records_are_in_ascending_digest_order() {
        let blobs = blob_map(&[b"one", b"two", b"three", b"four"]);
        let packed = pack(&blobs);
        let mut seen = Vec::new();
        let mut offset = 0;
        while offset < packed.len() {
            let field = &packed[offset..offset + 71];
            let end = field.iter().position(|&b| b == 0).unwrap_or(71);
            seen.push(String::from_utf8(field[..end].to_vec()).unwrap());
            let len = u64::from_be_bytes(packed[offset + 71..offset + 79].try_into().unwrap());
            offset += 79 + len as usize;
        }
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn truncated_input_is_corrupted() {
        let blobs = blob_map(&[b"payload"]);
        let packed = pack(&blobs);
        for cut in [1, 70, 75, packed.len() - 1] {
            let err = unpack(&packed[..cut]).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<Error>(), Some(Error::Corrupted(_))),
                "cut at {cut} should be corrupted"
            );
        }
    }
}
