// Bounded exponential backoff for transient portal failures

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter {
            let factor: f64 = rand::rng().random_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// What a retried operation ended with, and how many attempts it took
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Re-evaluates `$call` until it succeeds, fails with an error whose
/// `is_retryable()` is false, or the policy runs out of attempts.
macro_rules! with_retry {
    ($policy:expr, $operation:expr, $call:expr) => {{
        let policy: &$crate::workflow::retry::RetryPolicy = &$policy;
        let mut attempt: u32 = 1;
        loop {
            match $call.await {
                Ok(value) => {
                    break $crate::workflow::retry::Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    ::tracing::warn!(
                        operation = $operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    ::tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    break $crate::workflow::retry::Attempted {
                        result: Err(err),
                        attempts: attempt,
                    }
                }
            }
        }
    }};
}

pub(crate) use with_retry;
