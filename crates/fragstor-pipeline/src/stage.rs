//! Stage composition: ordered, reversible byte transforms.
//!
//! A [`StageChain`] applies its stages 1..n on the write path and inverts
//! them n..1 on the read path. The hasher stage does not transform bytes; it
//! records the digest of whatever flows through its position, and the same
//! position is where the digest is re-verified during inversion.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::compress::{compress, decompress, CompressorConfig};
use crate::encrypt::{decrypt, encrypt, EncryptorConfig};
use crate::error::{PipelineError, Result};
use crate::hash::{digest, HasherConfig};

/// One processing stage, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageConfig {
    /// Compression stage.
    Compressor(CompressorConfig),
    /// AEAD encryption stage.
    Encryptor(EncryptorConfig),
    /// Digest stage; records the chunk digest at its chain position.
    Hasher(HasherConfig),
}

/// An ordered chain of processing stages.
#[derive(Debug, Clone, Default)]
pub struct StageChain {
    stages: Vec<StageConfig>,
}

impl StageChain {
    /// Build a chain from an explicit, ordered stage list.
    ///
    /// At most one hasher is allowed; its digest is the one stored in the
    /// chunk descriptor.
    pub fn new(stages: Vec<StageConfig>) -> Result<Self> {
        let hashers = stages
            .iter()
            .filter(|s| matches!(s, StageConfig::Hasher(_)))
            .count();
        if hashers > 1 {
            return Err(PipelineError::InvalidConfig(
                "at most one hasher stage is supported".to_string(),
            ));
        }
        for stage in &stages {
            if let StageConfig::Encryptor(config) = stage {
                config.key.validate()?;
            }
        }
        Ok(Self { stages })
    }

    /// Whether the chain ends in a hasher, i.e. the recorded digest covers
    /// exactly the bytes handed to the chunk storage.
    pub fn digest_covers_stored_bytes(&self) -> bool {
        matches!(self.stages.last(), Some(StageConfig::Hasher(_)))
    }

    /// Push a chunk through all stages in order.
    ///
    /// Returns the processed bytes and, when a hasher is present, the digest
    /// recorded at its position.
    pub fn encode(&self, data: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let mut current = data.to_vec();
        let mut recorded = None;

        for stage in &self.stages {
            match stage {
                StageConfig::Compressor(config) => {
                    current = compress(&current, config.algorithm)?;
                }
                StageConfig::Encryptor(config) => {
                    current = encrypt(&current, &config.key)?;
                }
                StageConfig::Hasher(config) => {
                    recorded = Some(digest(&current, config.algorithm));
                }
            }
            trace!(len = current.len(), "stage applied");
        }

        Ok((current, recorded))
    }

    /// Invert all stages in reverse order.
    ///
    /// When a hasher is present, `expected_digest` is re-verified against the
    /// bytes flowing through the hasher's position; a mismatch is corruption.
    pub fn decode(&self, data: &[u8], expected_digest: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut current = data.to_vec();

        for stage in self.stages.iter().rev() {
            match stage {
                StageConfig::Compressor(config) => {
                    current = decompress(&current, config.algorithm)?;
                }
                StageConfig::Encryptor(config) => {
                    current = decrypt(&current, &config.key)?;
                }
                StageConfig::Hasher(config) => {
                    let expected = expected_digest.ok_or_else(|| {
                        PipelineError::Corrupted(
                            "descriptor carries no digest for the hasher stage".to_string(),
                        )
                    })?;
                    let computed = digest(&current, config.algorithm);
                    if computed != expected {
                        return Err(PipelineError::Corrupted(
                            "chunk digest mismatch".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(current)
    }

    /// The ordered stage list.
    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressorKind;
    use crate::encrypt::AeadKey;
    use crate::hash::HasherKind;
    use proptest::prelude::*;

    fn full_chain() -> StageChain {
        StageChain::new(vec![
            StageConfig::Compressor(CompressorConfig {
                algorithm: CompressorKind::Lz4,
            }),
            StageConfig::Encryptor(EncryptorConfig {
                key: AeadKey(vec![0u8; 16]),
            }),
            StageConfig::Hasher(HasherConfig {
                algorithm: HasherKind::Blake2b256,
            }),
        ])
        .unwrap()
    }

    proptest! {
        #[test]
        fn prop_chain_roundtrip(data in prop::collection::vec(0u8..=255, 1..32_768)) {
            let chain = full_chain();
            let (encoded, digest) = chain.encode(&data).unwrap();
            let decoded = chain.decode(&encoded, digest.as_deref()).unwrap();
            prop_assert_eq!(decoded, data);
        }
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = StageChain::new(vec![]).unwrap();
        let (encoded, digest) = chain.encode(b"payload").unwrap();
        assert_eq!(encoded, b"payload");
        assert!(digest.is_none());
        assert_eq!(chain.decode(&encoded, None).unwrap(), b"payload");
    }

    #[test]
    fn test_tail_hasher_digest_covers_stored_bytes() {
        let chain = full_chain();
        assert!(chain.digest_covers_stored_bytes());

        let (encoded, recorded) = chain.encode(b"some data").unwrap();
        assert_eq!(
            recorded.unwrap(),
            digest(&encoded, HasherKind::Blake2b256),
            "tail hasher must digest the stored bytes"
        );
    }

    #[test]
    fn test_mid_chain_hasher_digests_intermediate_bytes() {
        let chain = StageChain::new(vec![
            StageConfig::Compressor(CompressorConfig {
                algorithm: CompressorKind::Snappy,
            }),
            StageConfig::Hasher(HasherConfig {
                algorithm: HasherKind::Sha256,
            }),
            StageConfig::Encryptor(EncryptorConfig {
                key: AeadKey(vec![1u8; 32]),
            }),
        ])
        .unwrap();
        assert!(!chain.digest_covers_stored_bytes());

        let data = b"mid chain hashing".repeat(16);
        let (encoded, recorded) = chain.encode(&data).unwrap();
        let compressed = compress(&data, CompressorKind::Snappy).unwrap();
        assert_eq!(recorded.clone().unwrap(), digest(&compressed, HasherKind::Sha256));
        assert_eq!(
            chain.decode(&encoded, recorded.as_deref()).unwrap(),
            data
        );
    }

    #[test]
    fn test_digest_mismatch_is_corrupted() {
        let chain = full_chain();
        let (encoded, digest) = chain.encode(b"original").unwrap();
        let mut wrong = digest.unwrap();
        wrong[0] ^= 0xFF;
        assert!(matches!(
            chain.decode(&encoded, Some(&wrong)),
            Err(PipelineError::Corrupted(_))
        ));
    }

    #[test]
    fn test_missing_digest_is_corrupted() {
        let chain = full_chain();
        let (encoded, _) = chain.encode(b"original").unwrap();
        assert!(matches!(
            chain.decode(&encoded, None),
            Err(PipelineError::Corrupted(_))
        ));
    }

    #[test]
    fn test_two_hashers_rejected() {
        let hasher = StageConfig::Hasher(HasherConfig {
            algorithm: HasherKind::Sha256,
        });
        assert!(matches!(
            StageChain::new(vec![hasher.clone(), hasher]),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_key_rejected_at_construction() {
        let result = StageChain::new(vec![StageConfig::Encryptor(EncryptorConfig {
            key: AeadKey(vec![0u8; 5]),
        })]);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
