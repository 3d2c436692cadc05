//! The chunk storage contract shared by all three strategies.
//!
//! A strategy writes one processed chunk to *some* set of shards and can read
//! it back, health-check it, repair it from surviving fragments, and delete
//! it. Strategies borrow the cluster for the duration of each call; they own
//! no shard state of their own.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::debug;

use fragstor_client::{ObjectStatus, ShardClient, ShardCluster};

use crate::error::{PipelineError, Result};
use crate::hash::{digest, HasherKind};
use crate::metadata::{ChunkDescriptor, ObjectLocation};

/// Post-write health of a chunk, ordered `Invalid < Valid < Optimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckStatus {
    /// Not enough fragments left to read the chunk.
    Invalid,
    /// Readable, but fragments are missing or corrupted.
    Valid,
    /// Every expected fragment is present and healthy.
    Optimal,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Invalid => write!(f, "invalid"),
            CheckStatus::Valid => write!(f, "valid"),
            CheckStatus::Optimal => write!(f, "optimal"),
        }
    }
}

/// Writes and reads single chunks against a shard cluster.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Write one processed chunk under `key`, fanning out to the strategy's
    /// shard count. Fails with `ShardsUnavailable` when the durability
    /// minimum cannot be met.
    async fn write_chunk(&self, key: &[u8], data: &[u8]) -> Result<ChunkDescriptor>;

    /// Reconstruct the chunk bytes, or fail with `Unrecoverable`.
    async fn read_chunk(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>>;

    /// Classify the chunk's health. With `fast`, stop at the first evidence
    /// sufficient to classify.
    async fn check_chunk(&self, descriptor: &ChunkDescriptor, fast: bool) -> Result<CheckStatus>;

    /// Rewrite missing or corrupted fragments from surviving ones, returning
    /// the updated descriptor. Shard ids may change.
    async fn repair_chunk(&self, descriptor: &ChunkDescriptor) -> Result<ChunkDescriptor>;

    /// Best-effort delete of every referenced shard object.
    async fn delete_chunk(&self, descriptor: &ChunkDescriptor) -> Result<()>;
}

/// Health of one fragment location; status-call failures count as missing.
pub(crate) async fn location_status(
    cluster: &ShardCluster,
    location: &ObjectLocation,
) -> ObjectStatus {
    let client = match cluster.get_shard(&location.shard_id) {
        Ok(client) => client,
        Err(_) => return ObjectStatus::Missing,
    };
    match client.object_status(&location.key).await {
        Ok(status) => status,
        Err(e) => {
            debug!(shard = %location.shard_id, error = %e, "status probe failed, counting fragment as missing");
            ObjectStatus::Missing
        }
    }
}

/// Verify fetched bytes against the descriptor digest when one is available.
pub(crate) fn digest_matches(
    integrity: Option<HasherKind>,
    expected: &[u8],
    data: &[u8],
) -> bool {
    match integrity {
        Some(kind) if !expected.is_empty() => digest(data, kind) == expected,
        _ => true,
    }
}

/// Every reachable shard not in the excluded set, shuffled. Repair walks this
/// list and falls over to the next candidate when a rewrite fails.
pub(crate) fn replacement_candidates(
    cluster: &ShardCluster,
    exclude: &HashSet<String>,
) -> Vec<Arc<ShardClient>> {
    let mut ids: Vec<String> = cluster
        .listed_shard_identifiers()
        .into_iter()
        .filter(|id| !exclude.contains(id))
        .collect();
    ids.shuffle(&mut rand::thread_rng());

    ids.into_iter()
        .filter_map(|id| cluster.get_shard(&id).ok())
        .filter(|client| !client.is_closed())
        .collect()
}

/// Write one fragment onto the first candidate shard that accepts it,
/// consuming candidates as they are tried.
pub(crate) async fn rewrite_fragment(
    candidates: &mut Vec<Arc<ShardClient>>,
    key: &[u8],
    data: Vec<u8>,
) -> Result<String> {
    let object = fragstor_client::Object {
        key: key.to_vec(),
        data,
        reference_list: Vec::new(),
    };
    while let Some(shard) = candidates.pop() {
        match shard.set_object(&object).await {
            Ok(()) => return Ok(shard.addr().to_string()),
            Err(e) => {
                debug!(shard = shard.addr(), error = %e, "replacement write failed, trying next candidate");
            }
        }
    }
    Err(PipelineError::ShardsUnavailable(
        "no replacement shard accepted the rewrite".to_string(),
    ))
}

/// Delete every referenced object, tolerating absent keys; reports how many
/// deletes failed outright.
pub(crate) async fn delete_locations(
    cluster: &ShardCluster,
    locations: &[ObjectLocation],
) -> Result<()> {
    let mut failed = 0usize;
    for location in locations {
        let result = match cluster.get_shard(&location.shard_id) {
            Ok(client) => client.delete_object(&location.key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            // delete_object is idempotent; KeyNotFound cannot occur, so any
            // error here is a real failure.
            debug!(shard = %location.shard_id, error = %e, "shard delete failed");
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(PipelineError::DeleteIncomplete {
            failed,
            total: locations.len(),
        });
    }
    Ok(())
}
