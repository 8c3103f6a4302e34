// src/retry.rs

//! Bounded retries with exponential backoff for every external call the
//! control plane makes (config store, container engine, peer nodes).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry budget for one class of external calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    pub max_backoff_ms: u64,

    /// Timeout applied to every single attempt, in milliseconds
    pub timeout_ms: u64,
}

impl RetryPolicy {
    /// Conservative defaults used when presets do not override them
    pub const fn conservative() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            timeout_ms: 10_000,
        }
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay to wait after the given (1-based) failed attempt, without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Delay with up to 20% random jitter so followers do not retry in lockstep
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let spread = base.as_millis() as u64 / 5;
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Outcome of a single attempt, as classified by the caller
pub enum Attempt<T, E> {
    /// The call succeeded
    Done(T),

    /// The call failed but may succeed if tried again
    Transient(E),

    /// The call failed and retrying cannot help
    Fatal(E),
}

/// Why a retried call gave up
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("attempt {attempt} timed out after {timeout:?}")]
    TimedOut { attempt: u32, timeout: Duration },

    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// Whether the retry budget was used up (as opposed to a fatal error)
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. } | RetryError::TimedOut { .. })
    }
}

/// Runs `op` until it succeeds, fails fatally, or the policy's budget is spent.
///
/// Every attempt is bounded by the policy timeout. A timed out final attempt
/// is reported as `TimedOut`, other exhausted budgets as `Exhausted`.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let last = match tokio::time::timeout(policy.timeout(), op(attempt)).await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::Fatal(err)) => return Err(RetryError::Fatal(err)),
            Ok(Attempt::Transient(err)) => {
                debug!("{} failed on attempt {}/{}: {}", what, attempt, attempts, err);
                RetryError::Exhausted { attempts: attempt, last: err }
            }
            Err(_) => {
                debug!("{} timed out on attempt {}/{}", what, attempt, attempts);
                RetryError::TimedOut { attempt, timeout: policy.timeout() }
            }
        };

        if attempt >= attempts {
            return Err(last);
        }

        tokio::time::sleep(policy.backoff_with_jitter(attempt)).await;
    }
}
