//! Cooperative cancellation for in-flight shard calls.
//!
//! A caller holds a [`CancelHandle`] and hands the paired [`CancelToken`] down
//! into RPC calls, fan-out workers, and key-listing streams. Cancelling the
//! handle wakes every clone of the token, including child tokens derived from
//! it. Partially uploaded shard objects are not rolled back on cancel; repair
//! heals them on the next access.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit caller cancellation.
    #[default]
    UserRequested,
    /// A deadline elapsed.
    DeadlineExceeded,
    /// The owning cluster is shutting down.
    ClusterClosed,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::ClusterClosed => write!(f, "ClusterClosed"),
        }
    }
}

/// Error returned by an operation that observed cancellation.
#[derive(Error, Debug)]
#[error("Operation cancelled: {0}")]
pub struct CancelledError(pub CancelReason);

/// A lightweight, cloneable cancellation token. Many recipients may listen.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<CancelReason>>>,
    children: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl CancelToken {
    /// A token that can never be cancelled; for callers without a deadline.
    pub fn never() -> Self {
        new_cancel_pair().0
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The cancellation reason, once cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap()
    }

    /// Create a child token that is cancelled together with its parent but can
    /// also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let cancelled = Arc::new(AtomicBool::new(self.is_cancelled()));
        let reason = Arc::new(Mutex::new(self.cancelled_reason()));
        let children = Arc::new(Mutex::new(Vec::new()));

        if let Ok(mut c) = self.children.lock() {
            c.push(cancelled.clone());
        }

        let token = CancelToken {
            cancelled: cancelled.clone(),
            reason: reason.clone(),
            children: children.clone(),
        };
        let handle = CancelHandle {
            cancelled,
            reason,
            children,
        };
        (token, handle)
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<CancelReason>>>,
    children: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl CancelHandle {
    /// Trigger cancellation. The first reason wins on repeated cancels.
    pub fn cancel(&self, reason: CancelReason) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        if let Ok(children) = self.children.lock() {
            for child in children.iter() {
                child.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Check whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a fresh token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let reason = Arc::new(Mutex::new(None));
    let children = Arc::new(Mutex::new(Vec::new()));

    let token = CancelToken {
        cancelled: cancelled.clone(),
        reason: reason.clone(),
        children: children.clone(),
    };
    let handle = CancelHandle {
        cancelled,
        reason,
        children,
    };
    (token, handle)
}
