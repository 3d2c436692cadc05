//! Error types for the transport layer.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Error variants for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The remote peer closed the connection mid-exchange.
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// Connecting to the remote address failed outright.
    #[error("Connection refused: {addr}")]
    ConnectionRefused {
        /// The address that refused the connection.
        addr: String,
    },

    /// Establishing the connection exceeded the configured deadline.
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The address being connected to.
        addr: String,
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// An in-flight request exceeded its deadline.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request id that timed out.
        request_id: u64,
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// Frame carried the wrong protocol magic.
    #[error("Invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic {
        /// The expected magic value.
        expected: u32,
        /// The value actually received.
        got: u32,
    },

    /// Frame carried an unsupported protocol version.
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// The supported version.
        expected: u8,
        /// The version actually received.
        got: u8,
    },

    /// Payload checksum did not match the header.
    #[error("Frame checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch {
        /// The checksum carried in the header.
        expected: u32,
        /// The checksum computed over the received payload.
        computed: u32,
    },

    /// Frame payload exceeds the configured cap.
    #[error("Payload too large: {size} bytes exceeds cap of {max_size}")]
    PayloadTooLarge {
        /// The declared payload size.
        size: u32,
        /// The configured maximum.
        max_size: u32,
    },

    /// Frame carried an opcode this peer does not understand.
    #[error("Unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The connection has been closed locally.
    #[error("Connection closed")]
    Closed,

    /// The operation was cancelled before completion.
    #[error("Cancelled")]
    Cancelled,
}

/// True for transient errors worth retrying; permanent errors fail immediately.
pub fn is_retryable(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::ConnectionReset
            | TransportError::ConnectionTimeout { .. }
            | TransportError::RequestTimeout { .. }
            | TransportError::IoError(_)
    )
}
