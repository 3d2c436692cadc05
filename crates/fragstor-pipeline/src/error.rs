//! Error types for the processing pipeline and chunk storage strategies.

use thiserror::Error;

use fragstor_client::ClientError;
use fragstor_transport::CancelReason;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error variants for pipeline and chunk storage operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A pipeline configuration parameter is invalid. Never retried.
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The metadata record was written under a different stage configuration
    /// than the one this pipeline carries. Detected before any shard fetch.
    #[error("Pipeline configuration mismatch: record written with a different stage configuration")]
    ConfigMismatch,

    /// A compression stage failed on the encode side.
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// An encryption stage failed on the encode side.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Data failed an integrity check on the decode side: undecodable
    /// compressed payload, AEAD authentication failure, or digest mismatch.
    #[error("Data corrupted: {0}")]
    Corrupted(String),

    /// A write fan-out could not meet the storage strategy's durability
    /// minimum.
    #[error("Shards unavailable: {0}")]
    ShardsUnavailable(String),

    /// Too few fragments survive to reconstruct the chunk.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    /// A chunk-scoped failure, annotated with the chunk's index in the
    /// metadata record for diagnostics.
    #[error("Chunk {index}: {source}")]
    Chunk {
        /// Position of the failing chunk in the metadata record.
        index: usize,
        /// The underlying failure.
        #[source]
        source: Box<PipelineError>,
    },

    /// A delete left shard objects behind.
    #[error("Delete incomplete: {failed} of {total} shard objects still present")]
    DeleteIncomplete {
        /// How many shard deletes failed.
        failed: usize,
        /// How many shard objects the record referenced.
        total: usize,
    },

    /// The operation observed cancellation and stopped.
    #[error("Cancelled: {0}")]
    Cancelled(CancelReason),

    /// A shard client error that no strategy could recover from.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl PipelineError {
    /// Wrap an error with the index of the chunk it occurred in.
    pub fn at_chunk(self, index: usize) -> Self {
        PipelineError::Chunk {
            index,
            source: Box::new(self),
        }
    }

    /// The chunk index annotation, when present.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            PipelineError::Chunk { index, .. } => Some(*index),
            _ => None,
        }
    }
}
