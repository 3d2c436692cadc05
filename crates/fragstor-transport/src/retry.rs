//! Retry with exponential backoff for shard RPC calls.
//!
//! Only transient errors (timeouts, resets, I/O) are retried; permanent
//! errors such as protocol violations or a closed connection surface
//! immediately.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::{is_retryable, Result, TransportError};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts beyond the first try.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries; useful for tests and for callers
    /// doing their own failover across shards.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Executes operations under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new executor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, retrying transient failures with exponential backoff.
    ///
    /// Returns the first success, or the last error once retries are
    /// exhausted or a permanent error is hit.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !is_retryable(&e) || attempt > self.config.max_retries {
                        return Err(e);
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying shard call");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Backoff for a given zero-based attempt: `initial * multiplier^attempt`,
    /// capped at `max_backoff`, plus up to 50% jitter when enabled.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_backoff.as_millis() as f64;
        let computed = base_ms * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(self.config.max_backoff.as_millis() as f64) as u64;

        if self.config.jitter {
            Duration::from_millis(capped.saturating_add(simple_jitter(capped / 2)))
        } else {
            Duration::from_millis(capped)
        }
    }
}

/// Cheap jitter from system time entropy; not security-relevant.
fn simple_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let nanos = Instant::now().elapsed().subsec_nanos() as u64;
    let ts_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    (nanos ^ ts_nanos) % max_ms
}
