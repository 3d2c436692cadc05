//! Fixed-maximum chunking of user values.
//!
//! The chunk boundary list is recoverable from the descriptors' `size` fields
//! alone; no per-chunk offsets are encoded. Reassembly concatenates chunk
//! plaintexts in descriptor order.

use serde::{Deserialize, Serialize};

/// Configuration for the chunker stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum size of one chunk in bytes.
    pub max_chunk_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1024 * 1024,
        }
    }
}

/// Split a value into chunks of at most `max_chunk_size` bytes.
///
/// Every chunk except possibly the last is exactly `max_chunk_size` long.
/// An empty input yields no chunks.
pub fn split(data: &[u8], config: &ChunkerConfig) -> Vec<Vec<u8>> {
    data.chunks(config.max_chunk_size)
        .map(|c| c.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_smaller_than_max_is_one_chunk() {
        let config = ChunkerConfig { max_chunk_size: 16 };
        let chunks = split(b"hello", &config);
        assert_eq!(chunks, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_exact_multiple_splits_evenly() {
        let config = ChunkerConfig { max_chunk_size: 4 };
        let chunks = split(&[0u8; 12], &config);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 4));
    }

    #[test]
    fn test_trailing_partial_chunk() {
        let config = ChunkerConfig { max_chunk_size: 1024 * 1024 };
        let data = vec![7u8; 3 * 1024 * 1024 + 512 * 1024];
        let chunks = split(&data, &config);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].len(), 1024 * 1024);
        assert_eq!(chunks[3].len(), 512 * 1024);
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let config = ChunkerConfig::default();
        assert!(split(b"", &config).is_empty());
    }

    #[test]
    fn test_concatenation_restores_input() {
        let config = ChunkerConfig { max_chunk_size: 7 };
        let data: Vec<u8> = (0..100).collect();
        let joined: Vec<u8> = split(&data, &config).concat();
        assert_eq!(joined, data);
    }
}
