//! Exponential backoff for transient exchange failures

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::TradingResult;

/// Retry policy: delays double from `initial_delay_ms` up to `max_delay_ms`.
/// `max_retries = None` retries forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            max_retries: Some(3),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_retries: Option<u32>) -> Self {
        RetryPolicy {
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            max_retries,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Stateful delay sequence for one run of consecutive failures
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Backoff { policy, attempt: 0 }
    }

    /// Delay before the next retry, or `None` once the retry ceiling is hit
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.attempt >= max {
                return None;
            }
        }

        let factor = 2u64.saturating_pow(self.attempt.min(32));
        let delay = self
            .policy
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.policy.max_delay_ms);
        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `operation`, retrying transient errors according to `policy`.
/// Any other error is returned immediately.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, what: &str, operation: F) -> TradingResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = TradingResult<T>>,
{
    let mut backoff = policy.backoff();

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "{} failed (attempt {}): {}. Retrying in {}ms",
                        what,
                        backoff.attempts(),
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
                None => {
                    warn!("{} failed, retries exhausted: {}", what, e);
                    return Err(e);
                }
            },
            Err(e) => {
                debug!("{} failed with non-retryable error: {}", what, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TradingError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5), Some(5));
        let mut backoff = policy.backoff();

        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_unbounded_policy_keeps_going() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), None);
        let mut backoff = policy.backoff();
        for _ in 0..100 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), Some(2)).backoff();
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), Some(3));

        let result = retry_transient(&policy, "fetch", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TradingError::TransientNetwork("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), Some(3));

        let result: TradingResult<()> = retry_transient(&policy, "order", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TradingError::ExchangeRejection("insufficient balance".into())) }
        })
        .await;

        assert!(matches!(result, Err(TradingError::ExchangeRejection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1), Some(2));

        let result: TradingResult<()> = retry_transient(&policy, "fetch", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TradingError::TransientNetwork("down".into())) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
