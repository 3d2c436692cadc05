//! The pipeline: user-facing write/read engine over a shard cluster.
//!
//! Write splits the value into chunks, pushes each through the stage chain,
//! and fans the results out through the terminal chunk storage; the returned
//! metadata record is the reverse map. Read is the dual and verifies the
//! configuration hash before touching any shard. Chunks may be processed
//! concurrently up to the configured worker count, but descriptor order
//! always equals plaintext order.

use std::sync::Arc;

use rand::RngCore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use fragstor_client::{ClientError, ShardCluster};
use fragstor_transport::CancelToken;

use crate::chunker::{self, ChunkerConfig};
use crate::config::{PipelineConfig, StorageConfig};
use crate::distribution::DistributedStorage;
use crate::error::{PipelineError, Result};
use crate::metadata::{unix_epoch_now, ChunkDescriptor, Metadata};
use crate::random::RandomStorage;
use crate::replication::ReplicatedStorage;
use crate::stage::{StageChain, StageConfig};
use crate::storage::{CheckStatus, ChunkStorage};

/// The ordered stage chain with a terminal chunk storage.
pub struct Pipeline {
    chunker: ChunkerConfig,
    chain: Arc<StageChain>,
    storage: Arc<dyn ChunkStorage>,
    workers: usize,
    config_hash: Vec<u8>,
}

impl Pipeline {
    /// Build a pipeline from its configuration over a cluster.
    ///
    /// Fails with `InvalidConfig` when the configuration is inconsistent or
    /// the cluster holds fewer shards than the storage strategy fans out to.
    pub fn new(config: PipelineConfig, cluster: Arc<ShardCluster>) -> Result<Self> {
        config.validate()?;

        let fanout = config.storage.fanout();
        if cluster.count() < fanout {
            return Err(PipelineError::InvalidConfig(format!(
                "cluster has {} shards, storage strategy needs {}",
                cluster.count(),
                fanout
            )));
        }

        let chain = StageChain::new(config.stages.clone())?;
        // When the digest covers exactly the stored bytes, storage strategies
        // can use it to verify fetched fragments themselves.
        let integrity = if chain.digest_covers_stored_bytes() {
            match config.stages.last() {
                Some(StageConfig::Hasher(h)) => Some(h.algorithm),
                _ => None,
            }
        } else {
            None
        };

        let storage: Arc<dyn ChunkStorage> = match config.storage {
            StorageConfig::Random => Arc::new(RandomStorage::new(Arc::clone(&cluster), integrity)),
            StorageConfig::Replication { n } => {
                Arc::new(ReplicatedStorage::new(Arc::clone(&cluster), n, integrity))
            }
            StorageConfig::Distribution { k, m } => Arc::new(DistributedStorage::new(
                Arc::clone(&cluster),
                k,
                m,
                integrity,
            )?),
        };

        Ok(Self {
            chunker: config.chunker,
            chain: Arc::new(chain),
            storage,
            workers: config.workers,
            config_hash: config.config_hash(),
        })
    }

    /// The hash of the configuration this pipeline was built from.
    pub fn config_hash(&self) -> &[u8] {
        &self.config_hash
    }

    /// Write a value under a user key, returning its metadata record.
    ///
    /// Persisting the record is the caller's responsibility. On mid-write
    /// failure, already-written chunk fragments are cleaned up best-effort and
    /// no record is emitted; on cancellation, partial uploads are left for
    /// repair to heal and no record is emitted.
    #[instrument(skip_all, fields(key_len = key.len(), value_len = value.len()))]
    pub async fn write(
        &self,
        key: &[u8],
        value: &[u8],
        cancel: &CancelToken,
    ) -> Result<Metadata> {
        if key.is_empty() {
            return Err(ClientError::InvalidKey.into());
        }
        if value.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "cannot write an empty value".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(cancelled(cancel));
        }

        let chunks = chunker::split(value, &self.chunker);
        let total = chunks.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let chain = Arc::clone(&self.chain);
            let storage = Arc::clone(&self.storage);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if cancel.is_cancelled() {
                    return (index, Err(cancelled(&cancel)));
                }
                (index, process_chunk(&chain, &*storage, &chunk).await)
            });
        }

        let mut descriptors: Vec<Option<ChunkDescriptor>> = vec![None; total];
        let mut failure: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(descriptor))) => descriptors[index] = Some(descriptor),
                Ok((index, Err(e))) => {
                    if failure.is_none() {
                        failure = Some(e.at_chunk(index));
                        tasks.abort_all();
                    }
                }
                Err(join_err) => {
                    if !join_err.is_cancelled() && failure.is_none() {
                        failure = Some(PipelineError::Unrecoverable(join_err.to_string()));
                        tasks.abort_all();
                    }
                }
            }
        }

        if let Some(err) = failure {
            let written: Vec<ChunkDescriptor> = descriptors.into_iter().flatten().collect();
            // Cancellation leaves partial uploads in place for repair; other
            // failures clean up what already landed.
            if !is_cancellation(&err) && !written.is_empty() {
                self.cleanup_chunks(&written).await;
            }
            return Err(err);
        }

        let now = unix_epoch_now();
        let record = Metadata {
            key: key.to_vec(),
            size: value.len() as i64,
            creation_epoch: now,
            last_write_epoch: now,
            config_hash: self.config_hash.clone(),
            chunks: descriptors
                .into_iter()
                .map(|d| d.expect("every chunk completed"))
                .collect(),
            previous_key: None,
            next_key: None,
        };
        info!(chunks = record.chunks.len(), size = record.size, "value written");
        Ok(record)
    }

    /// Read the value a metadata record describes. Never returns partial data.
    #[instrument(skip_all, fields(chunks = metadata.chunks.len()))]
    pub async fn read(&self, metadata: &Metadata) -> Result<Vec<u8>> {
        self.verify_config(metadata)?;

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for (index, descriptor) in metadata.chunks.iter().cloned().enumerate() {
            let chain = Arc::clone(&self.chain);
            let storage = Arc::clone(&self.storage);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = async {
                    let stored = storage.read_chunk(&descriptor).await?;
                    let expected = (!descriptor.hash.is_empty()).then_some(descriptor.hash.as_slice());
                    chain.decode(&stored, expected)
                }
                .await;
                (index, result)
            });
        }

        let mut plaintexts: Vec<Option<Vec<u8>>> = vec![None; metadata.chunks.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(plaintext))) => plaintexts[index] = Some(plaintext),
                Ok((index, Err(e))) => {
                    tasks.abort_all();
                    return Err(e.at_chunk(index));
                }
                Err(join_err) => {
                    if !join_err.is_cancelled() {
                        tasks.abort_all();
                        return Err(PipelineError::Unrecoverable(join_err.to_string()));
                    }
                }
            }
        }

        let mut value = Vec::with_capacity(metadata.size as usize);
        for plaintext in plaintexts {
            value.extend_from_slice(&plaintext.expect("every chunk completed"));
        }
        value.truncate(metadata.size as usize);
        Ok(value)
    }

    /// Classify the record's health: the minimum over its chunks.
    pub async fn check(&self, metadata: &Metadata, fast: bool) -> Result<CheckStatus> {
        self.verify_config(metadata)?;

        let mut overall = CheckStatus::Optimal;
        for (index, descriptor) in metadata.chunks.iter().enumerate() {
            let status = self
                .storage
                .check_chunk(descriptor, fast)
                .await
                .map_err(|e| e.at_chunk(index))?;
            overall = overall.min(status);
            if fast && overall == CheckStatus::Invalid {
                break;
            }
        }
        Ok(overall)
    }

    /// Repair every chunk, returning the updated record. A single
    /// unrecoverable chunk aborts with its index annotated.
    pub async fn repair(&self, metadata: &Metadata) -> Result<Metadata> {
        self.verify_config(metadata)?;

        let mut repaired = metadata.clone();
        for (index, descriptor) in metadata.chunks.iter().enumerate() {
            repaired.chunks[index] = self
                .storage
                .repair_chunk(descriptor)
                .await
                .map_err(|e| e.at_chunk(index))?;
        }
        repaired.last_write_epoch = unix_epoch_now();
        Ok(repaired)
    }

    /// Delete every shard object the record references.
    ///
    /// Errors are collected, not short-circuited; the call succeeds iff every
    /// shard delete went through (absent keys count as success).
    pub async fn delete(&self, metadata: &Metadata) -> Result<()> {
        let mut failed = 0usize;
        let mut total = 0usize;
        for descriptor in &metadata.chunks {
            total += descriptor.objects.len();
            match self.storage.delete_chunk(descriptor).await {
                Ok(()) => {}
                Err(PipelineError::DeleteIncomplete { failed: f, .. }) => failed += f,
                Err(_) => failed += descriptor.objects.len(),
            }
        }
        if failed > 0 {
            return Err(PipelineError::DeleteIncomplete { failed, total });
        }
        Ok(())
    }

    fn verify_config(&self, metadata: &Metadata) -> Result<()> {
        if metadata.config_hash != self.config_hash {
            return Err(PipelineError::ConfigMismatch);
        }
        Ok(())
    }

    async fn cleanup_chunks(&self, written: &[ChunkDescriptor]) {
        for descriptor in written {
            if let Err(e) = self.storage.delete_chunk(descriptor).await {
                warn!(error = %e, "orphaned chunk fragments left after failed write");
            }
        }
    }
}

async fn process_chunk(
    chain: &StageChain,
    storage: &dyn ChunkStorage,
    chunk: &[u8],
) -> Result<ChunkDescriptor> {
    let (processed, digest) = chain.encode(chunk)?;
    // Content-address by digest when a hasher is present, random otherwise.
    let shard_key = match &digest {
        Some(d) => d.clone(),
        None => random_object_key(),
    };
    let mut descriptor = storage.write_chunk(&shard_key, &processed).await?;
    descriptor.hash = digest.unwrap_or_default();
    Ok(descriptor)
}

fn random_object_key() -> Vec<u8> {
    let mut key = vec![0u8; 24];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn cancelled(cancel: &CancelToken) -> PipelineError {
    PipelineError::Cancelled(cancel.cancelled_reason().unwrap_or_default())
}

fn is_cancellation(err: &PipelineError) -> bool {
    match err {
        PipelineError::Cancelled(_) => true,
        PipelineError::Chunk { source, .. } => is_cancellation(source),
        _ => false,
    }
}
