//! Resilience: bounded retries for external reasoning calls.
//!
//! ```text
//! attempt 1 ──fail(transient|timeout)──▶ sleep backoff ──▶ attempt 2 ──▶ ...
//!     │                                                        │
//!     └─ ok → return                     attempts exhausted ───┴─▶ RetryExhausted
//!     └─ fail(permanent) → RetryExhausted immediately
//! ```
//!
//! Each attempt is bounded by `attempt_timeout_ms`; a timeout counts as a
//! retryable failure rather than a silent stall.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::reasoning::GenerationError;

/// Retry budget for one external call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Sleep before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubled backoff.
    pub max_backoff_ms: u64,
    /// Wall-clock budget per attempt. `None` = unbounded.
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            attempt_timeout_ms: Some(120_000),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and local backends.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            attempt_timeout_ms: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Sleep after failed attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Retries ran out (or a permanent error stopped them).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{label}: gave up after {attempts} attempts: {last_error}")]
pub struct RetryExhausted {
    pub label: String,
    pub attempts: u32,
    pub last_error: GenerationError,
}

/// Run `op` under `policy`. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match policy.attempt_timeout_ms {
            Some(ms) => {
                let budget = Duration::from_millis(ms);
                match tokio::time::timeout(budget, op(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::Timeout(budget)),
                }
            }
            None => op(attempt).await,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= max_attempts {
            return Err(RetryExhausted {
                label: label.to_string(),
                attempts: attempt,
                last_error: err,
            });
        }

        let backoff = policy.backoff_for(attempt);
        warn!(
            label,
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Transient error, retrying"
        );
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::immediate(3), "stmt", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(GenerationError::Transient("503".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let err = retry_with_backoff(&RetryPolicy::immediate(2), "stmt", |attempt| async move {
            Err::<(), _>(GenerationError::Transient(format!("fail {}", attempt)))
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_error, GenerationError::Transient("fail 2".into()));
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&RetryPolicy::immediate(5), "vote", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(GenerationError::Permanent("401".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let policy = RetryPolicy::immediate(2).with_attempt_timeout(Duration::from_millis(50));
        let result = retry_with_backoff(&policy, "stmt", |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok::<_, GenerationError>(attempt)
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::immediate(0).attempts(), 1);
    }
}
