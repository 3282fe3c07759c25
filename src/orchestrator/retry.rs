//! Retry policy for per-tenant units of work.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::SyncFailure;

/// Bounded exponential backoff: `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    pub fn is_retryable(&self, failure: &SyncFailure) -> bool {
        failure.is_retryable()
    }
}

/// A unit of work that gave up
#[derive(Debug, thiserror::Error)]
#[error("failed after {attempts} attempt(s) in {failure}")]
pub struct RetryExhausted {
    pub attempts: u32,
    #[source]
    pub failure: SyncFailure,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// budget runs out. `op` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SyncFailure>>,
{
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                if !policy.is_retryable(&failure) || attempt >= policy.max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        failure,
                    });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_secs = delay.as_secs(),
                    error = %failure,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
