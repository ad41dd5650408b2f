//! Bounded exponential backoff for fallible provider calls.
//!
//! Retry classification is the caller's job: an operation reports each
//! failure as [`Transient`](Retry::Transient) (retried until the budget
//! runs out) or [`Permanent`](Retry::Permanent) (returned immediately).
//! Backoff doubles per attempt from a configurable base, capped at 2^5
//! times the base.

use std::future::Future;
use std::time::Duration;

/// How a failed attempt should be handled.
#[derive(Debug)]
pub enum Retry<E> {
    /// Worth retrying: rate limits, server errors, network faults.
    Transient(E),
    /// Not worth retrying: invalid input, bad credentials, policy refusal.
    Permanent(E),
}

/// Retry schedule for one class of external call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per subsequent retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * (1 << attempt.saturating_sub(1).min(5))
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the retry
/// budget. The final transient error is returned unchanged.
///
/// `op` receives the 0-based attempt number.
pub async fn with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Retry<E>>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Retry::Permanent(err)) => return Err(err),
            Err(Retry::Transient(err)) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                attempt += 1;
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}
