#![warn(missing_docs)]

//! fragstor transport subsystem: binary frame protocol and RPC plumbing for
//! shard connections.
//!
//! This crate provides the thin transport the shard client sits on:
//! - Frame-based binary protocol with a fixed 24-byte header
//! - Request/response message bodies for the twelve shard operations
//! - TCP transport with an abstract [`transport::Connection`] seam
//! - Per-connection request multiplexing
//! - Retry with exponential backoff, cooperative cancellation

pub mod cancel;
pub mod error;
pub mod message;
pub mod mux;
pub mod protocol;
pub mod retry;
pub mod transport;

pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken, CancelledError};
pub use error::{is_retryable, Result, TransportError};
pub use message::{deserialize_message, serialize_message, RequestContext};
pub use mux::{MuxConfig, MuxConnection};
pub use protocol::{Frame, FrameFlags, FrameHeader, Opcode, DEFAULT_MAX_PAYLOAD};
pub use retry::{RetryConfig, RetryExecutor};
pub use transport::{Connection, StreamConnection, TcpTransport, TcpTransportConfig, Transport};
