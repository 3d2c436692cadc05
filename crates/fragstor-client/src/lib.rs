#![warn(missing_docs)]

//! fragstor client subsystem: shard clients and the shard cluster.
//!
//! A [`ShardClient`] is a stateless facade over one long-lived, multiplexed
//! transport connection to a storage shard, bound to a namespace label. A
//! [`ShardCluster`] pools clients by endpoint identity and hands them out by
//! id or at random. Everything above (the processing pipeline) works against
//! these two types.

pub mod cluster;
pub mod error;
pub mod listing;
pub mod object;
pub mod shard;
pub mod token;

pub use cluster::ShardCluster;
pub use error::{ClientError, Result};
pub use listing::{KeyListing, ListingState, ObjectKeyResult};
pub use object::{Namespace, Object, ObjectStatus, MAX_REFERENCE_LENGTH};
pub use shard::{ShardClient, ShardClientConfig};
pub use token::{StaticTokenProvider, TokenProvider};
