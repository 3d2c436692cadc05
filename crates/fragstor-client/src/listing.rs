//! The key-listing stream.
//!
//! A producer task reads streamed frames off the multiplexed connection and
//! forwards decoded keys into a bounded channel, polling the caller's cancel
//! token between items. States: `Open` while items flow, `Draining` once the
//! stream has decided to stop but an in-flight item may still be delivered,
//! `Closed` when the producer has exited. No resumption from `Closed`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use fragstor_transport::message::{deserialize_message, ErrorBody, ListObjectKeysResponse};
use fragstor_transport::{CancelToken, Frame};

use crate::error::{from_wire_error, ClientError, Result};

/// One item of a key listing: a key, or the error that ended the stream.
pub type ObjectKeyResult = Result<Vec<u8>>;

/// Lifecycle state of a key listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingState {
    /// Items are flowing.
    Open,
    /// The stream is stopping; at most one in-flight item remains.
    Draining,
    /// The producer has exited. Terminal.
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// How often the producer re-checks the cancel token while idle.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A finite, cancellable stream of object keys from one shard.
pub struct KeyListing {
    rx: mpsc::Receiver<ObjectKeyResult>,
    state: Arc<AtomicU8>,
}

impl KeyListing {
    /// Spawn the producer task over a stream of response frames.
    pub(crate) fn spawn(frames: mpsc::Receiver<Frame>, cancel: CancelToken) -> Self {
        let state = Arc::new(AtomicU8::new(STATE_OPEN));
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(produce(frames, cancel, tx, state.clone()));
        Self { rx, state }
    }

    /// Receive the next item; `None` once the stream is exhausted or drained.
    pub async fn recv(&mut self) -> Option<ObjectKeyResult> {
        self.rx.recv().await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListingState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ListingState::Open,
            STATE_DRAINING => ListingState::Draining,
            _ => ListingState::Closed,
        }
    }
}

async fn produce(
    mut frames: mpsc::Receiver<Frame>,
    cancel: CancelToken,
    tx: mpsc::Sender<ObjectKeyResult>,
    state: Arc<AtomicU8>,
) {
    let drain = |state: &AtomicU8| state.store(STATE_DRAINING, Ordering::SeqCst);
    let mut saw_end = false;

    loop {
        if cancel.is_cancelled() {
            debug!(reason = ?cancel.cancelled_reason(), "key listing cancelled");
            drain(&state);
            break;
        }

        let frame = match tokio::time::timeout(CANCEL_POLL_INTERVAL, frames.recv()).await {
            // Idle tick: go around and re-check the cancel token.
            Err(_) => continue,
            Ok(None) => {
                // Connection gone before the server finished the stream.
                drain(&state);
                if !saw_end {
                    let _ = tx.send(Err(ClientError::ConnectionLost)).await;
                }
                break;
            }
            Ok(Some(frame)) => frame,
        };

        if frame.header.flags.error {
            drain(&state);
            let item = match deserialize_message::<ErrorBody>(&frame.payload) {
                Ok(body) => Err(from_wire_error(body.code, &body.message)),
                Err(e) => Err(e.into()),
            };
            let _ = tx.send(item).await;
            break;
        }

        let end_stream = frame.header.flags.end_stream;
        let resp: ListObjectKeysResponse = match deserialize_message(&frame.payload) {
            Ok(resp) => resp,
            Err(e) => {
                drain(&state);
                let _ = tx.send(Err(e.into())).await;
                break;
            }
        };

        if end_stream {
            saw_end = true;
            drain(&state);
            if !resp.key.is_empty() {
                let _ = tx.send(Ok(resp.key)).await;
            }
            break;
        }

        if resp.key.is_empty() {
            drain(&state);
            let _ = tx.send(Err(ClientError::MissingKey)).await;
            break;
        }

        if tx.send(Ok(resp.key)).await.is_err() {
            // Consumer dropped the listing.
            drain(&state);
            break;
        }
    }

    state.store(STATE_CLOSED, Ordering::SeqCst);
}
