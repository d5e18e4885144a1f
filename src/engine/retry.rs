//! Bounded retry with exponential backoff for outbound deliveries.
//!
//! Used by the outbox worker for refunds and cross-group auction messages.
//! Notifications are never retried.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial try).
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Cap for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 1500,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits; for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the retry that follows `attempt` (1-based).
    ///
    /// `min(max_delay, base_delay * 2^(attempt-1))`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = if exponent >= 32 { u64::MAX } else { 1u64 << exponent };
        let delay = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// Returns the last error when every attempt failed.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Delivery succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(label, attempt, error = %e, "Giving up after final attempt");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1500));
        assert_eq!(policy.backoff(64), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = RetryPolicy::immediate(3)
            .run("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = RetryPolicy::immediate(2)
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
