//! Explicit retry policy values.
//!
//! A policy is plain data driving a loop over a fallible async operation;
//! there are no callback chains and no shared retry state.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Fixed-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub backoff: Duration,
    /// Total attempts; `None` retries until success.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever with a fixed backoff. Used for transient KV errors,
    /// which are never surfaced.
    pub const fn fixed(backoff: Duration) -> Self {
        RetryPolicy {
            backoff,
            max_attempts: None,
        }
    }

    /// Retry up to `attempts` times, then return the last error.
    pub const fn bounded(backoff: Duration, attempts: u32) -> Self {
        RetryPolicy {
            backoff,
            max_attempts: Some(attempts),
        }
    }

    /// Drive `op` until it succeeds or the attempt bound is exhausted.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    if let Some(max) = self.max_attempts {
                        if attempt >= max {
                            return Err(err);
                        }
                    }
                    sleep(self.backoff).await;
                }
            }
        }
    }
}

/// Default backoff between metadata bucket operations.
pub const BUCKET_OP_BACKOFF: Duration = Duration::from_millis(100);

/// Default backoff between cluster topology lookups.
pub const CLUSTER_OP_BACKOFF: Duration = Duration::from_millis(250);

/// Bounded attempts for CAS read-modify-write loops; past this another
/// writer is authoritative and the write is dropped.
pub const CAS_RETRY_LIMIT: u32 = 10;
