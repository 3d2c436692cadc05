//! Snappy, gzip, and LZ4 compression stages.
//!
//! Each encoder produces a self-describing payload decodable by the matching
//! decoder; a payload that fails to decode reports as corrupted.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Compression codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressorKind {
    /// Snappy raw block format.
    Snappy,
    /// Gzip with a codec-specific level (0..=9).
    Gzip {
        /// Compression level, 0 (store) through 9 (best).
        level: u32,
    },
    /// LZ4 block format with a length prefix.
    Lz4,
}

/// Configuration for a compressor stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressorConfig {
    /// The codec to use.
    pub algorithm: CompressorKind,
}

/// Compress a chunk with the given codec.
pub fn compress(data: &[u8], kind: CompressorKind) -> Result<Vec<u8>> {
    match kind {
        CompressorKind::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| PipelineError::CompressionFailed(e.to_string())),
        CompressorKind::Gzip { level } => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| PipelineError::CompressionFailed(e.to_string()))
        }
        CompressorKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
    }
}

/// Decompress a chunk produced by [`compress`] with the same codec.
pub fn decompress(data: &[u8], kind: CompressorKind) -> Result<Vec<u8>> {
    match kind {
        CompressorKind::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| PipelineError::Corrupted(format!("snappy payload: {}", e))),
        CompressorKind::Gzip { .. } => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| PipelineError::Corrupted(format!("gzip payload: {}", e)))?;
            Ok(out)
        }
        CompressorKind::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| PipelineError::Corrupted(format!("lz4 payload: {}", e))),
    }
}
