//! Bounded exponential backoff shared by every outbound call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Retry limits for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every retry.
    pub base_delay_ms: u64,
    /// Ceiling for a single delay.
    pub max_delay_ms: u64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests and tight loops.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.max_delay_ms);
        let jittered = if self.jitter && capped > 0 {
            capped + rand::rng().random_range(0..=capped / 4)
        } else {
            capped
        };
        Duration::from_millis(jittered)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
    /// A non-transient error ended the loop early.
    Fatal { attempts: u32, error: E },
    /// The cancellation token fired.
    Cancelled,
}

/// Run `op` until it succeeds, fails with a non-transient error, runs out of
/// attempts, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. Backoff sleeps race against
/// the cancellation token.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            r = op(attempt) => r,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if !is_transient(&e) => {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) if attempt >= max => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(_) => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
