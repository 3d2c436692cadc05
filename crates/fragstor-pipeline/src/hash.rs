//! Digest stage (BLAKE2b-256 / SHA-256).
//!
//! The digest of a chunk is stored in its descriptor for integrity checking
//! and doubles as the content-addressed shard object key when the hasher is
//! part of the pipeline.

use blake2::digest::consts::U32;
use blake2::Blake2b;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type Blake2b256 = Blake2b<U32>;

/// Digest algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HasherKind {
    /// BLAKE2b with a 256-bit digest.
    Blake2b256,
    /// SHA-256.
    Sha256,
}

/// Configuration for a hasher stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasherConfig {
    /// The digest algorithm to use.
    pub algorithm: HasherKind,
}

/// Digest length in bytes for both supported algorithms.
pub const DIGEST_SIZE: usize = 32;

/// Compute the digest of a chunk.
pub fn digest(data: &[u8], kind: HasherKind) -> Vec<u8> {
    match kind {
        HasherKind::Blake2b256 => {
            let mut hasher = Blake2b256::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
        HasherKind::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_length() {
        for kind in [HasherKind::Blake2b256, HasherKind::Sha256] {
            assert_eq!(digest(b"abc", kind).len(), DIGEST_SIZE);
        }
    }

    #[test]
    fn test_digest_deterministic() {
        for kind in [HasherKind::Blake2b256, HasherKind::Sha256] {
            assert_eq!(digest(b"abc", kind), digest(b"abc", kind));
        }
    }

    #[test]
    fn test_digest_differs_per_input() {
        for kind in [HasherKind::Blake2b256, HasherKind::Sha256] {
            assert_ne!(digest(b"abc", kind), digest(b"abd", kind));
        }
    }

    #[test]
    fn test_algorithms_disagree() {
        assert_ne!(
            digest(b"abc", HasherKind::Blake2b256),
            digest(b"abc", HasherKind::Sha256)
        );
    }

    #[test]
    fn test_sha256_known_vector() {
        let d = digest(b"abc", HasherKind::Sha256);
        assert_eq!(
            d[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "SHA-256(\"abc\") prefix mismatch"
        );
    }
}
