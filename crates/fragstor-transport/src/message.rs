//! RPC message types for the shard protocol.
//!
//! This module defines the request and response bodies for every shard
//! operation. Bodies are serialized with bincode into the frame payload.
//! Every request carries the namespace label and, when auth is enabled on the
//! cluster, a bearer token.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Metadata attached to every request: namespace label plus optional bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestContext {
    /// Namespace label the caller is bound to.
    pub label: String,
    /// Bearer token, present when the cluster has auth enabled.
    pub token: Option<String>,
}

/// Health of an object as reported by the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireObjectStatus {
    /// Object present and its payload checksum verifies.
    Ok,
    /// Object absent.
    Missing,
    /// Object present but its payload checksum does not verify.
    Corrupted,
}

/// Error codes a shard can return in an `ERROR`-flagged response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorCode {
    /// The requested key does not exist.
    KeyNotFound,
    /// Stored object data failed the shard's integrity check.
    ObjectCorrupted,
    /// Stored reference list failed the shard's integrity check.
    RefListCorrupted,
    /// The presented token does not grant this operation.
    PermissionDenied,
    /// The shard rejected the offered key.
    KeyRejected,
    /// The shard is unable to serve requests right now.
    Unavailable,
    /// Unclassified server-side failure.
    Internal,
}

/// Body of an `ERROR`-flagged response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub code: WireErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Store an object under a key, overwriting any previous value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetObjectRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
    /// Object payload.
    pub data: Vec<u8>,
    /// Initial reference list.
    pub reference_list: Vec<String>,
}

/// Empty response for a successful SetObject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetObjectResponse {}

/// Fetch an object by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetObjectRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
}

/// Object payload and reference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetObjectResponse {
    /// Object payload; empty means the data went missing server-side.
    pub data: Vec<u8>,
    /// Current reference list.
    pub reference_list: Vec<String>,
}

/// Delete an object. Deleting an absent key succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteObjectRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
}

/// Empty response for a successful DeleteObject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteObjectResponse {}

/// Query an object's health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStatusRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
}

/// Reported object health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStatusResponse {
    /// Status as determined by the shard's own integrity check.
    pub status: WireObjectStatus,
}

/// Begin a finite server-streamed listing of every key in the namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListObjectKeysRequest {
    /// Request metadata.
    pub ctx: RequestContext,
}

/// One streamed key of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListObjectKeysResponse {
    /// The listed key; empty on the terminating `END_STREAM` frame.
    pub key: Vec<u8>,
}

/// Replace an object's reference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetReferenceListRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
    /// New reference list.
    pub reference_list: Vec<String>,
}

/// Empty response for a successful SetReferenceList.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetReferenceListResponse {}

/// Fetch an object's reference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReferenceListRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
}

/// Current reference list; empty means no list is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReferenceListResponse {
    /// The stored entries.
    pub reference_list: Vec<String>,
}

/// Merge entries into a reference list. Duplicates are dropped server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendToReferenceListRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
    /// Entries to merge in.
    pub reference_list: Vec<String>,
}

/// Empty response for a successful AppendToReferenceList.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendToReferenceListResponse {}

/// Remove entries from a reference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFromReferenceListRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
    /// Entries to remove.
    pub reference_list: Vec<String>,
}

/// Count of entries remaining after the removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFromReferenceListResponse {
    /// Remaining entry count.
    pub count: i64,
}

/// Drop a reference list entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReferenceListRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
}

/// Empty response for a successful DeleteReferenceList.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReferenceListResponse {}

/// Count the entries of a reference list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReferenceCountRequest {
    /// Request metadata.
    pub ctx: RequestContext,
    /// Object key.
    pub key: Vec<u8>,
}

/// Current entry count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReferenceCountResponse {
    /// Number of stored entries, zero when no list exists.
    pub count: i64,
}

/// Fetch the namespace descriptor of the connected shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNamespaceRequest {
    /// Request metadata.
    pub ctx: RequestContext,
}

/// Namespace descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNamespaceResponse {
    /// Namespace label the shard is serving.
    pub label: String,
    /// Number of objects stored.
    pub nr_objects: u64,
    /// Read requests per hour budget.
    pub read_rph: u64,
    /// Write requests per hour budget.
    pub write_rph: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_object_roundtrip() {
        let req = SetObjectRequest {
            ctx: RequestContext {
                label: "ns-a".to_string(),
                token: Some("tok".to_string()),
            },
            key: b"key".to_vec(),
            data: vec![0, 1, 2, 3],
            reference_list: vec!["user1".to_string()],
        };
        let bytes = serialize_message(&req).unwrap();
        let back: SetObjectRequest = deserialize_message(&bytes).unwrap();
        assert_eq!(back.ctx.label, "ns-a");
        assert_eq!(back.ctx.token.as_deref(), Some("tok"));
        assert_eq!(back.key, b"key");
        assert_eq!(back.data, vec![0, 1, 2, 3]);
        assert_eq!(back.reference_list, vec!["user1".to_string()]);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            WireObjectStatus::Ok,
            WireObjectStatus::Missing,
            WireObjectStatus::Corrupted,
        ] {
            let bytes = serialize_message(&ObjectStatusResponse { status }).unwrap();
            let back: ObjectStatusResponse = deserialize_message(&bytes).unwrap();
            assert_eq!(back.status, status);
        }
    }

    #[test]
    fn test_error_body_roundtrip() {
        let body = ErrorBody {
            code: WireErrorCode::KeyNotFound,
            message: "no such key".to_string(),
        };
        let bytes = serialize_message(&body).unwrap();
        let back: ErrorBody = deserialize_message(&bytes).unwrap();
        assert_eq!(back.code, WireErrorCode::KeyNotFound);
        assert_eq!(back.message, "no such key");
    }

    #[test]
    fn test_namespace_roundtrip() {
        let resp = GetNamespaceResponse {
            label: "ns-a".to_string(),
            nr_objects: 12,
            read_rph: 100,
            write_rph: 50,
        };
        let bytes = serialize_message(&resp).unwrap();
        let back: GetNamespaceResponse = deserialize_message(&bytes).unwrap();
        assert_eq!(back.label, "ns-a");
        assert_eq!(back.nr_objects, 12);
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        let result: Result<GetNamespaceResponse> = deserialize_message(&[0xFF, 0xFE, 0xFD]);
        assert!(matches!(result, Err(TransportError::SerializationError(_))));
    }
}
