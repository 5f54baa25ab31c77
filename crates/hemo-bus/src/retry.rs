//! Bounded exponential backoff shared by every transport path.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempt cap and base delay for retried operations. The delay doubles on
/// each attempt: base, base*2, base*4, ...
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retrying after `attempt` failures (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `op` until it succeeds or the attempt cap is reached. The last error
/// is returned to the caller; intermediate failures are logged.
pub async fn with_backoff<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = label,
                        attempts = attempt,
                        error = %e,
                        "retries exhausted"
                    );
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
