//! Retry policies.
//!
//! Two distinct kinds of retry exist:
//! - [`RetryPolicy`] schedules the next attempt of a failed job or message,
//!   persisted as `next_retry_at` on the row.
//! - [`TransientRetry`] re-issues a single store call that failed because the
//!   store was briefly unreachable.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::{Result, time};

/// Exponential backoff for failed jobs and messages.
///
/// `max_retries` counts failed attempts, the last of which dead-letters. With
/// the defaults a job waits 5m after its first failure and 10m after its
/// second, and its third failure is final. A budget of 4 adds a 20m wait,
/// and each further unit doubles again up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure; doubles with every further failure.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Retry budget given to newly created jobs and messages.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5 * 60),
            max_delay: Duration::from_secs(6 * 60 * 60),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// When to try again, or `None` once the budget is spent.
    pub fn next_retry_at(
        &self,
        failures: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if failures >= max_retries {
            return None;
        }
        Some(time::saturating_add(now, self.delay_for(failures)))
    }
}

/// Bounded local retry of store calls that failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientRetry {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

impl TransientRetry {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Run `op`, retrying while it fails with a transient error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(operation, attempt, error = %e, "Transient store failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn five_minutes() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(24 * 3600),
            max_retries: 3,
        }
    }

    #[test]
    fn test_delay_doubles_per_failure() {
        let policy = five_minutes();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5 * 60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10 * 60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20 * 60));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(600),
            ..five_minutes()
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(600));
        assert_eq!(policy.delay_for(200), Duration::from_secs(600));
    }

    #[test]
    fn test_budget_exhaustion_stops_retries() {
        let policy = five_minutes();
        let now = Utc::now();
        assert_eq!(
            policy.next_retry_at(1, 3, now),
            Some(now + chrono::Duration::minutes(5))
        );
        assert_eq!(
            policy.next_retry_at(2, 3, now),
            Some(now + chrono::Duration::minutes(10))
        );
        assert_eq!(policy.next_retry_at(3, 3, now), None);
        assert_eq!(policy.next_retry_at(1, 0, now), None);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let retry = TransientRetry {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
        };

        let result = retry
            .run("claim", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::TransientStoreFailure("connection reset".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let retry = TransientRetry {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
        };

        let result: Result<()> = retry
            .run("claim", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::TransientStoreFailure("down".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::TransientStoreFailure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = TransientRetry::default()
            .run("approve", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::NotFound("approval".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
