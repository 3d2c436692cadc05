//! Integration harness and end-to-end scenarios for fragstor.
//!
//! [`harness`] provides an in-memory shard server speaking the real wire
//! protocol over in-process connections, with fault injection (down shards,
//! corrupted objects). The test modules drive the shard client, the chunk
//! storage strategies, and the full pipeline against it.

pub mod harness;
