//! Value compression.
//!
//! Compression is attempted once per stored value and the result is kept only
//! when it is strictly smaller than the input.

use crate::config::CompressionType;
use crate::error::{Error, Result};

/// Compresses `data` if it is longer than `compress_min` and compression
/// actually shrinks it. Returns `None` when the value should be stored as is.
pub fn try_compress(compression: CompressionType, compress_min: usize, data: &[u8]) -> Option<Vec<u8>> {
    if data.len() <= compress_min {
        return None;
    }
    let compressed = match compression {
        CompressionType::None => return None,
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new().compress_vec(data).ok()?,
        #[cfg(feature = "lz4-compression")]
        CompressionType::Lz4 => lz4::block::compress(data, None, true).ok()?,
    };
    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Reverses [`try_compress`].
pub fn decompress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Err(Error::corruption(
            "value is flagged compressed but the table has no compression type",
        )),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::corruption(format!("Decompression failed: {}", e))),
        #[cfg(feature = "lz4-compression")]
        CompressionType::Lz4 => lz4::block::decompress(data, None)
            .map_err(|e| Error::corruption(format!("Decompression failed: {}", e))),
    }
}
