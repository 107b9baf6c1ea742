use std::io::Cursor;

use anyhow::{Context, Result};

/// Frames smaller than this are never worth compressing.
const MIN_COMPRESS_SIZE: usize = 128;

/// First four bytes of every zstd frame.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Optional zstd compression for on-disk blob files.
///
/// Digests are always computed over the uncompressed bytes; compression is a
/// storage detail beneath the blob path. Payloads that do not shrink are
/// stored raw, and decode sniffs the zstd magic so either form reads back.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Compressor {
    enabled: bool,
    level: i32,
}

impl Compressor {
    /// Level is the configuration scale {1 = fastest, 2 = default, 3 = best},
    /// not a raw zstd level.
    pub(crate) fn new(level: u8, enabled: bool) -> Self {
        let level = match level {
            1 => 1,
            3 => 19,
            _ => zstd::DEFAULT_COMPRESSION_LEVEL,
        };
        Self { enabled, level }
    }

    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self {
            enabled: false,
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub(crate) fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.enabled || data.len() < MIN_COMPRESS_SIZE {
            return Ok(data.to_vec());
        }
        let compressed =
            zstd::bulk::compress(data, self.level).context("failed to compress blob")?;
        if compressed.len() >= data.len() {
            return Ok(data.to_vec());
        }
        Ok(compressed)
    }

    pub(crate) fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.enabled || !data.starts_with(&ZSTD_MAGIC) {
            return Ok(data.to_vec());
        }
        match zstd::stream::decode_all(Cursor::new(data)) {
            Ok(decoded) => Ok(decoded),
            // Raw content can begin with the magic bytes by coincidence.
            Err(_) => Ok(data.to_vec()),
        }
    }
}

/// Compress a wire layer with the transport's default zstd level.
pub(crate) fn compress_layer(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(Cursor::new(data), zstd::DEFAULT_COMPRESSION_LEVEL)
        .context("failed to compress layer")
}

/// Decompress a downloaded wire layer.
pub(crate) fn decompress_layer(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(Cursor::new(data)).context("failed to decompress layer")
}
