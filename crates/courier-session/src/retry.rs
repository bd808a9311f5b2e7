//! Bounded retry with exponential backoff and jitter.
//!
//! Only operations documented as idempotent go through [`with_retry`]:
//! the handshake, the list operations, resource reads, and prompt gets.
//! Tool calls are never retried; a tool may have side effects, and a
//! duplicate execution is worse than a surfaced transport error.

use std::future::Future;
use std::time::Duration;

use courier_core::{CourierError, CourierResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configures retry behaviour for idempotent operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// The delay before retry number `attempt` (0-based): full jitter
    /// over an exponentially growing window capped at `backoff_max_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.backoff_max_ms);
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }
}

/// Whether an error is a transient transport failure worth retrying.
pub(crate) fn is_transient(err: &CourierError) -> bool {
    match err {
        CourierError::Transport(t) => t.is_transient(),
        _ => false,
    }
}

/// Runs `op` until it succeeds, fails terminally, or the retry budget is
/// exhausted; the last error is surfaced unchanged.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> CourierResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CourierResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < policy.max_retries => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient transport failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
