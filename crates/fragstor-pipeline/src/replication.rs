//! Replicated storage: `n` full copies across `n` distinct shards.
//!
//! Writes fan out concurrently and are strict: every copy must land or the
//! write fails. Reads cascade through the copies in descriptor order and
//! return the first one that passes digest verification.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use fragstor_client::{ClientError, Object, ObjectStatus, ShardCluster};

use crate::error::{PipelineError, Result};
use crate::hash::HasherKind;
use crate::metadata::{ChunkDescriptor, ObjectLocation};
use crate::storage::{
    delete_locations, digest_matches, location_status, replacement_candidates, rewrite_fragment,
    CheckStatus, ChunkStorage,
};

/// Stores each chunk as `n` identical copies on `n` distinct shards.
pub struct ReplicatedStorage {
    cluster: Arc<ShardCluster>,
    n: usize,
    integrity: Option<HasherKind>,
}

impl ReplicatedStorage {
    /// Create the strategy over a cluster with copy count `n`.
    pub fn new(cluster: Arc<ShardCluster>, n: usize, integrity: Option<HasherKind>) -> Self {
        Self {
            cluster,
            n,
            integrity,
        }
    }

    async fn write_copies(
        &self,
        key: &[u8],
        data: &Arc<Vec<u8>>,
        shards: Vec<Arc<fragstor_client::ShardClient>>,
    ) -> std::result::Result<Vec<ObjectLocation>, (Vec<ObjectLocation>, ClientError)> {
        let mut tasks = JoinSet::new();
        for shard in shards {
            let key = key.to_vec();
            let data = Arc::clone(data);
            tasks.spawn(async move {
                let object = Object {
                    key: key.clone(),
                    data: (*data).clone(),
                    reference_list: Vec::new(),
                };
                let result = shard.set_object(&object).await;
                (shard.addr().to_string(), key, result)
            });
        }

        let mut written = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((shard_id, key, Ok(()))) => written.push(ObjectLocation { key, shard_id }),
                Ok((shard_id, _, Err(e))) => {
                    debug!(shard = %shard_id, error = %e, "replica write failed");
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    first_error.get_or_insert(ClientError::Internal(join_err.to_string()));
                }
            }
        }

        match first_error {
            None => Ok(written),
            Some(e) => Err((written, e)),
        }
    }
}

#[async_trait]
impl ChunkStorage for ReplicatedStorage {
    async fn write_chunk(&self, key: &[u8], data: &[u8]) -> Result<ChunkDescriptor> {
        let shards = self.cluster.get_random_shards(self.n).map_err(|e| {
            PipelineError::ShardsUnavailable(format!("replication fan-out: {}", e))
        })?;

        let payload = Arc::new(data.to_vec());
        match self.write_copies(key, &payload, shards).await {
            Ok(locations) => Ok(ChunkDescriptor {
                size: data.len() as i64,
                hash: Vec::new(),
                objects: locations,
            }),
            Err((written, e)) => {
                // Strict write: undo the copies that did land.
                if !written.is_empty() {
                    if let Err(cleanup) = delete_locations(&self.cluster, &written).await {
                        warn!(error = %cleanup, "orphaned replicas left after failed write");
                    }
                }
                Err(PipelineError::ShardsUnavailable(format!(
                    "replica write: {}",
                    e
                )))
            }
        }
    }

    async fn read_chunk(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        for location in &descriptor.objects {
            let client = match self.cluster.get_shard(&location.shard_id) {
                Ok(client) => client,
                Err(_) => continue,
            };
            match client.get_object(&location.key).await {
                Ok(object) => {
                    if digest_matches(self.integrity, &descriptor.hash, &object.data) {
                        return Ok(object.data);
                    }
                    debug!(shard = %location.shard_id, "replica fails digest verification, cascading");
                }
                Err(e) => {
                    debug!(shard = %location.shard_id, error = %e, "replica read failed, cascading");
                }
            }
        }
        Err(PipelineError::Unrecoverable(format!(
            "no healthy replica among {}",
            descriptor.objects.len()
        )))
    }

    async fn check_chunk(&self, descriptor: &ChunkDescriptor, fast: bool) -> Result<CheckStatus> {
        if fast {
            // Stop as soon as one healthy and one unhealthy copy are known:
            // that already pins the status to Valid.
            let mut any_ok = false;
            let mut any_bad = false;
            for location in &descriptor.objects {
                match location_status(&self.cluster, location).await {
                    ObjectStatus::Ok => any_ok = true,
                    _ => any_bad = true,
                }
                if any_ok && any_bad {
                    return Ok(CheckStatus::Valid);
                }
            }
            return Ok(classify(any_ok, any_bad));
        }

        let mut tasks = JoinSet::new();
        for location in descriptor.objects.clone() {
            let cluster = Arc::clone(&self.cluster);
            tasks.spawn(async move { location_status(&cluster, &location).await });
        }
        let mut any_ok = false;
        let mut any_bad = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ObjectStatus::Ok) => any_ok = true,
                _ => any_bad = true,
            }
        }
        Ok(classify(any_ok, any_bad))
    }

    async fn repair_chunk(&self, descriptor: &ChunkDescriptor) -> Result<ChunkDescriptor> {
        let mut healthy = Vec::new();
        let mut broken = Vec::new();
        for (position, location) in descriptor.objects.iter().enumerate() {
            match location_status(&self.cluster, location).await {
                ObjectStatus::Ok => healthy.push(position),
                _ => broken.push(position),
            }
        }
        if broken.is_empty() {
            return Ok(descriptor.clone());
        }
        if healthy.is_empty() {
            return Err(PipelineError::Unrecoverable(
                "no healthy replica to repair from".to_string(),
            ));
        }

        let data = self.read_chunk(descriptor).await?;

        let survivors: HashSet<String> = healthy
            .iter()
            .map(|&p| descriptor.objects[p].shard_id.clone())
            .collect();
        let mut candidates = replacement_candidates(&self.cluster, &survivors);

        let mut repaired = descriptor.clone();
        let mut stale = Vec::new();
        for &position in &broken {
            let old = repaired.objects[position].clone();
            let new_shard = rewrite_fragment(&mut candidates, &old.key, data.clone()).await?;
            if old.shard_id != new_shard {
                stale.push(old);
            }
            repaired.objects[position].shard_id = new_shard;
        }

        // Drop stale copies only after every rewrite landed: a stale shard may
        // have been reused as another position's replacement under the same key.
        let reused: HashSet<&str> = repaired.objects.iter().map(|o| o.shard_id.as_str()).collect();
        for old in stale {
            if !reused.contains(old.shard_id.as_str()) {
                if let Ok(client) = self.cluster.get_shard(&old.shard_id) {
                    let _ = client.delete_object(&old.key).await;
                }
            }
        }

        debug!(repaired = broken.len(), copies = self.n, "replica set restored");
        Ok(repaired)
    }

    async fn delete_chunk(&self, descriptor: &ChunkDescriptor) -> Result<()> {
        delete_locations(&self.cluster, &descriptor.objects).await
    }
}

fn classify(any_ok: bool, any_bad: bool) -> CheckStatus {
    match (any_ok, any_bad) {
        (true, false) => CheckStatus::Optimal,
        (true, true) => CheckStatus::Valid,
        _ => CheckStatus::Invalid,
    }
}
