//! Metadata records: the serialisable reverse-map of a pipeline write.
//!
//! A record owns its chunk descriptors exclusively. Descriptor order equals
//! plaintext byte order; concatenating decoded chunks in order reconstructs
//! the value. Field order inside [`Metadata`] is frozen so `size` and
//! `config_hash` keep their wire positions across versions.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Where one fragment of a chunk lives: an object key on a specific shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Shard object key.
    pub key: Vec<u8>,
    /// Identifier of the shard holding the object.
    pub shard_id: String,
}

/// The metadata needed to read one chunk back from the shards.
///
/// For distribution the `objects` order is load-bearing: positions `0..k`
/// are data fragments, `k..k+m` parity, the position being the erasure index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Byte length of the chunk as handed to the storage strategy.
    pub size: i64,
    /// Digest recorded by the hasher stage; empty when no hasher is present.
    pub hash: Vec<u8>,
    /// Fragment locations, one per copy or erasure position.
    pub objects: Vec<ObjectLocation>,
}

impl ChunkDescriptor {
    /// The shard identifiers referenced by this descriptor, in fragment order.
    pub fn shard_ids(&self) -> Vec<&str> {
        self.objects.iter().map(|o| o.shard_id.as_str()).collect()
    }
}

/// The compact reverse-map produced by a pipeline write.
///
/// Field order is part of the wire format; `size` and `config_hash` must
/// retain their positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// The user key the value was written under.
    pub key: Vec<u8>,
    /// Total plaintext size of the value in bytes.
    pub size: i64,
    /// Unix seconds at record creation.
    pub creation_epoch: i64,
    /// Unix seconds of the last write touching this record.
    pub last_write_epoch: i64,
    /// Hash of the pipeline configuration used for the write.
    pub config_hash: Vec<u8>,
    /// Ordered chunk descriptors; order equals plaintext byte order.
    pub chunks: Vec<ChunkDescriptor>,
    /// Optional link to the previous version's record key.
    pub previous_key: Option<Vec<u8>>,
    /// Optional link to the next version's record key.
    pub next_key: Option<Vec<u8>>,
}

impl Metadata {
    /// Serialize the record for external persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| PipelineError::InvalidConfig(format!("metadata encoding: {}", e)))
    }

    /// Deserialize a record previously produced by [`Metadata::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| PipelineError::Corrupted(format!("metadata record: {}", e)))
    }
}

/// Unix seconds right now, for record epochs.
pub fn unix_epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// An in-memory record store keyed by user key.
///
/// Persistence of records is the caller's responsibility; this store is a
/// convenience collaborator, not a core invariant.
#[derive(Debug, Default)]
pub struct MetadataStore {
    records: RwLock<HashMap<Vec<u8>, Metadata>>,
}

impl MetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for its user key.
    pub fn set(&self, record: Metadata) {
        self.records
            .write()
            .unwrap()
            .insert(record.key.clone(), record);
    }

    /// Fetch the record for a user key.
    pub fn get(&self, key: &[u8]) -> Option<Metadata> {
        self.records.read().unwrap().get(key).cloned()
    }

    /// Remove the record for a user key, returning it.
    pub fn delete(&self, key: &[u8]) -> Option<Metadata> {
        self.records.write().unwrap().remove(key)
    }

    /// Every stored user key.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.records.read().unwrap().keys().cloned().collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_record() -> Metadata {
        Metadata {
            key: b"user-key".to_vec(),
            size: 1024,
            creation_epoch: 1_700_000_000,
            last_write_epoch: 1_700_000_500,
            config_hash: vec![9u8; 32],
            chunks: vec![ChunkDescriptor {
                size: 1024,
                hash: vec![7u8; 32],
                objects: vec![
                    ObjectLocation {
                        key: vec![7u8; 32],
                        shard_id: "shard-a:9000".to_string(),
                    },
                    ObjectLocation {
                        key: vec![7u8; 32],
                        shard_id: "shard-b:9000".to_string(),
                    },
                ],
            }],
            previous_key: None,
            next_key: None,
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample_record();
        let bytes = record.to_bytes().unwrap();
        assert_eq!(Metadata::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_garbage_record_is_corrupted() {
        assert!(matches!(
            Metadata::from_bytes(&[0xFF; 3]),
            Err(PipelineError::Corrupted(_))
        ));
    }

    #[test]
    fn test_version_links_roundtrip() {
        let mut record = sample_record();
        record.previous_key = Some(b"v1".to_vec());
        record.next_key = Some(b"v3".to_vec());
        let bytes = record.to_bytes().unwrap();
        let back = Metadata::from_bytes(&bytes).unwrap();
        assert_eq!(back.previous_key.as_deref(), Some(b"v1".as_slice()));
        assert_eq!(back.next_key.as_deref(), Some(b"v3".as_slice()));
    }

    #[test]
    fn test_descriptor_shard_ids_in_order() {
        let record = sample_record();
        assert_eq!(
            record.chunks[0].shard_ids(),
            vec!["shard-a:9000", "shard-b:9000"]
        );
    }

    #[test]
    fn test_store_set_get_delete() {
        let store = MetadataStore::new();
        assert!(store.is_empty());

        let record = sample_record();
        store.set(record.clone());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"user-key").unwrap(), record);

        assert_eq!(store.delete(b"user-key").unwrap(), record);
        assert!(store.get(b"user-key").is_none());
    }

    #[test]
    fn test_store_overwrite_replaces() {
        let store = MetadataStore::new();
        let mut record = sample_record();
        store.set(record.clone());
        record.size = 2048;
        store.set(record.clone());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"user-key").unwrap().size, 2048);
    }

    #[test]
    fn test_store_keys() {
        let store = MetadataStore::new();
        let mut a = sample_record();
        a.key = b"a".to_vec();
        let mut b = sample_record();
        b.key = b"b".to_vec();
        store.set(a);
        store.set(b);
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    proptest! {
        #[test]
        fn prop_metadata_roundtrip(
            key in prop::collection::vec(0u8..=255, 1..64),
            size in 0i64..i64::MAX / 2,
            hash in prop::collection::vec(0u8..=255, 0..32),
        ) {
            let record = Metadata {
                key,
                size,
                creation_epoch: 1,
                last_write_epoch: 2,
                config_hash: hash.clone(),
                chunks: vec![ChunkDescriptor { size, hash, objects: vec![] }],
                previous_key: None,
                next_key: None,
            };
            let bytes = record.to_bytes().unwrap();
            prop_assert_eq!(Metadata::from_bytes(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn test_unix_epoch_now_is_positive() {
        assert!(unix_epoch_now() > 1_500_000_000);
    }
}
