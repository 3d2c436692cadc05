//! Domain errors for shard operations.
//!
//! Transport errors are translated into this enum exactly once, at the shard
//! client boundary; everything above works in domain terms.

use thiserror::Error;

use fragstor_transport::message::WireErrorCode;
use fragstor_transport::TransportError;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error variants for shard client and cluster operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A construction-time parameter is invalid. Never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller supplied an unusable key (e.g. empty).
    #[error("Invalid key")]
    InvalidKey,

    /// The shard serves a different namespace label than the client is bound
    /// to. Fatal: indicates misconfiguration or re-provisioning.
    #[error("Invalid namespace label: bound to {bound:?}, shard serves {served:?}")]
    InvalidLabel {
        /// The label the client was constructed with.
        bound: String,
        /// The label the shard reported.
        served: String,
    },

    /// The requested key does not exist on the shard.
    #[error("Key not found")]
    KeyNotFound,

    /// The shard returned an object with an empty payload.
    #[error("Object data is missing")]
    MissingData,

    /// A key listing produced an empty key.
    #[error("Listed object key is missing")]
    MissingKey,

    /// The shard holds no reference list for the key.
    #[error("Reference list is missing")]
    MissingRefList,

    /// The shard rejected the offered key.
    #[error("Key rejected by shard")]
    KeyRejected,

    /// Stored data failed an integrity check, either server-side or against a
    /// client-held content hash.
    #[error("Object data is corrupted")]
    Corrupted,

    /// The presented token does not grant this operation. Never retried.
    #[error("Permission denied")]
    PermissionDenied,

    /// The auth token provider failed; the call never reached the transport.
    #[error("Token fetch failed: {0}")]
    TokenFetch(String),

    /// A shard call exceeded its deadline.
    #[error("Shard call timed out")]
    Timeout,

    /// The transport connection to the shard was lost.
    #[error("Shard connection lost")]
    ConnectionLost,

    /// The operation was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// The client or cluster has been closed.
    #[error("Client closed")]
    Closed,

    /// No shard with the requested identifier is part of the cluster.
    #[error("Unknown shard: {0}")]
    UnknownShard(String),

    /// Fewer reachable shards than the caller asked for.
    #[error("Insufficient shards: requested {requested}, available {available}")]
    InsufficientShards {
        /// How many distinct shards were requested.
        requested: usize,
        /// How many were reachable.
        available: usize,
    },

    /// Unclassified shard-side or protocol failure.
    #[error("Internal shard error: {0}")]
    Internal(String),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionTimeout { .. } | TransportError::RequestTimeout { .. } => {
                ClientError::Timeout
            }
            TransportError::ConnectionReset
            | TransportError::ConnectionRefused { .. }
            | TransportError::IoError(_) => ClientError::ConnectionLost,
            TransportError::Closed => ClientError::Closed,
            TransportError::Cancelled => ClientError::Cancelled,
            other => ClientError::Internal(other.to_string()),
        }
    }
}

/// Map a shard-reported wire error code into the domain enum.
pub fn from_wire_error(code: WireErrorCode, message: &str) -> ClientError {
    match code {
        WireErrorCode::KeyNotFound => ClientError::KeyNotFound,
        WireErrorCode::ObjectCorrupted | WireErrorCode::RefListCorrupted => ClientError::Corrupted,
        WireErrorCode::PermissionDenied => ClientError::PermissionDenied,
        WireErrorCode::KeyRejected => ClientError::KeyRejected,
        WireErrorCode::Unavailable => ClientError::ConnectionLost,
        WireErrorCode::Internal => ClientError::Internal(message.to_string()),
    }
}
