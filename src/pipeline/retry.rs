//! Exponential-backoff retry shared by every external call.
//!
//! The delay before attempt `n` (1-indexed, `n > 1`) is
//! `base_delay * 2^(n-2)`: with a 1 s base and 3 attempts the waits are
//! 1 s then 2 s. Errors that report themselves as permanent end the loop
//! immediately.

use crate::error::UpstreamError;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Always ≥ 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Backoff before attempt `attempt` (1-indexed). Zero for the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.base_delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2)))
        }
    }
}

/// Errors that know whether another attempt may help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for UpstreamError {
    fn is_transient(&self) -> bool {
        UpstreamError::is_transient(self)
    }
}

/// The final error of a retried operation plus how many attempts were made.
#[derive(Debug, Clone)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds, fails permanently, or the policy is spent.
///
/// `label` identifies the operation in logs ("pages 1-10", "crop Q4").
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt - 1,
                policy.max_attempts - 1,
                delay.as_millis()
            );
            sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let transient = e.is_transient();
                warn!("{}: attempt {} failed: {}", label, attempt, e);
                if !transient || attempt >= policy.max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }
        attempt += 1;
    }
}
