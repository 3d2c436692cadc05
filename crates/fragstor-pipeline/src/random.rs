//! Random storage: one shard, no redundancy.
//!
//! The cheapest strategy and the weakest: if the single shard loses the
//! object, nothing can bring it back. Repair without external data can only
//! confirm health or report the chunk unrecoverable.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fragstor_client::{Object, ObjectStatus, ShardCluster};

use crate::error::{PipelineError, Result};
use crate::hash::HasherKind;
use crate::metadata::{ChunkDescriptor, ObjectLocation};
use crate::storage::{
    delete_locations, digest_matches, location_status, CheckStatus, ChunkStorage,
};

/// Stores each chunk on one randomly selected shard.
pub struct RandomStorage {
    cluster: Arc<ShardCluster>,
    integrity: Option<HasherKind>,
}

impl RandomStorage {
    /// Create the strategy over a cluster. `integrity` enables digest
    /// verification of fetched bytes when the descriptor carries one.
    pub fn new(cluster: Arc<ShardCluster>, integrity: Option<HasherKind>) -> Self {
        Self { cluster, integrity }
    }
}

#[async_trait]
impl ChunkStorage for RandomStorage {
    async fn write_chunk(&self, key: &[u8], data: &[u8]) -> Result<ChunkDescriptor> {
        let shard = self
            .cluster
            .get_random_shards(1)
            .map_err(|e| PipelineError::ShardsUnavailable(format!("single-shard pick: {}", e)))?
            .pop()
            .expect("selection returned the requested count");

        let object = Object {
            key: key.to_vec(),
            data: data.to_vec(),
            reference_list: Vec::new(),
        };
        shard
            .set_object(&object)
            .await
            .map_err(|e| PipelineError::ShardsUnavailable(format!("single-shard write: {}", e)))?;

        debug!(shard = shard.addr(), len = data.len(), "chunk stored");
        Ok(ChunkDescriptor {
            size: data.len() as i64,
            hash: Vec::new(),
            objects: vec![ObjectLocation {
                key: key.to_vec(),
                shard_id: shard.addr().to_string(),
            }],
        })
    }

    async fn read_chunk(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        let location = descriptor.objects.first().ok_or_else(|| {
            PipelineError::Unrecoverable("descriptor references no shard object".to_string())
        })?;

        let client = self
            .cluster
            .get_shard(&location.shard_id)
            .map_err(|e| PipelineError::Unrecoverable(format!("sole shard: {}", e)))?;
        let object = client
            .get_object(&location.key)
            .await
            .map_err(|e| PipelineError::Unrecoverable(format!("sole copy: {}", e)))?;

        if !digest_matches(self.integrity, &descriptor.hash, &object.data) {
            return Err(PipelineError::Unrecoverable(
                "sole copy fails digest verification".to_string(),
            ));
        }
        Ok(object.data)
    }

    async fn check_chunk(&self, descriptor: &ChunkDescriptor, _fast: bool) -> Result<CheckStatus> {
        let location = descriptor.objects.first().ok_or_else(|| {
            PipelineError::Unrecoverable("descriptor references no shard object".to_string())
        })?;
        // With a single copy there is no middle ground between healthy and lost.
        match location_status(&self.cluster, location).await {
            ObjectStatus::Ok => Ok(CheckStatus::Optimal),
            ObjectStatus::Missing | ObjectStatus::Corrupted => Ok(CheckStatus::Invalid),
        }
    }

    async fn repair_chunk(&self, descriptor: &ChunkDescriptor) -> Result<ChunkDescriptor> {
        match self.check_chunk(descriptor, false).await? {
            CheckStatus::Invalid => Err(PipelineError::Unrecoverable(
                "single-shard chunk lost; repair needs external data".to_string(),
            )),
            _ => Ok(descriptor.clone()),
        }
    }

    async fn delete_chunk(&self, descriptor: &ChunkDescriptor) -> Result<()> {
        delete_locations(&self.cluster, &descriptor.objects).await
    }
}
