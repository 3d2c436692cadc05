//! Declarative pipeline configuration.
//!
//! A pipeline is a chunker, an explicit ordered stage list, a terminal
//! storage strategy, and a chunk-level worker count. The configuration is
//! frozen at write time: its hash is stored in every metadata record and
//! re-verified before any read touches a shard.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunker::ChunkerConfig;
use crate::error::{PipelineError, Result};
use crate::stage::StageConfig;

/// The terminal chunk-storage strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageConfig {
    /// One shard, no redundancy.
    Random,
    /// `n` full copies across `n` distinct shards.
    Replication {
        /// Copy count, at least 2.
        n: usize,
    },
    /// Reed-Solomon over `k` data plus `m` parity fragments.
    Distribution {
        /// Data fragment count, at least 1.
        k: usize,
        /// Parity fragment count, at least 1.
        m: usize,
    },
}

impl StorageConfig {
    /// How many distinct shards one chunk write fans out to.
    pub fn fanout(&self) -> usize {
        match self {
            StorageConfig::Random => 1,
            StorageConfig::Replication { n } => *n,
            StorageConfig::Distribution { k, m } => k + m,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chunker parameters; always the first stage.
    pub chunker: ChunkerConfig,
    /// Ordered processing stages between chunker and storage.
    pub stages: Vec<StageConfig>,
    /// Terminal storage strategy.
    pub storage: StorageConfig,
    /// Chunk-level write/read concurrency, at least 1.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            stages: Vec::new(),
            storage: StorageConfig::Random,
            workers: 1,
        }
    }
}

impl PipelineConfig {
    /// Validate every parameter; called at pipeline construction.
    pub fn validate(&self) -> Result<()> {
        if self.chunker.max_chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunker max_chunk_size must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        match self.storage {
            StorageConfig::Random => {}
            StorageConfig::Replication { n } => {
                if n < 2 {
                    return Err(PipelineError::InvalidConfig(
                        "replication requires n >= 2".to_string(),
                    ));
                }
            }
            StorageConfig::Distribution { k, m } => {
                if k < 1 || m < 1 {
                    return Err(PipelineError::InvalidConfig(
                        "distribution requires k >= 1 and m >= 1".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical encoding of the semantic configuration.
    ///
    /// `workers` is excluded: it is a concurrency knob and must not change
    /// the metadata record a write produces.
    pub fn config_hash(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Semantic<'a> {
            chunker: &'a ChunkerConfig,
            stages: &'a [StageConfig],
            storage: &'a StorageConfig,
        }
        let encoded = bincode::serialize(&Semantic {
            chunker: &self.chunker,
            stages: &self.stages,
            storage: &self.storage,
        })
        .expect("pipeline config is always serializable");

        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hasher.finalize().to_vec()
    }
}
