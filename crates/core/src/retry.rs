// Retry with exponential backoff for transient node failures

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::NodeError;

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Attempt budget and backoff curve. `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Same curve, different attempt budget (per-node override)
    pub fn with_max_attempts(&self, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts: max_attempts.unwrap_or(self.max_attempts),
            ..self.clone()
        }
    }

    /// Delay before retry number `retry` (0-based), with 0.8x-1.2x jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` is called before
    /// each backoff sleep. Cancellation interrupts both the call and the sleep.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: impl FnMut(u32, &NodeError),
    ) -> Result<T, NodeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                result = op(attempt) => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff(attempt - 1);
                    warn!(
                        attempt = attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying {}",
                        label
                    );
                    on_retry(attempt, &err);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(NodeError::Transient(message)) => {
                    return Err(NodeError::Exhausted {
                        attempts: attempt,
                        message,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing_until(successful_attempt: u32, calls: &AtomicU32) -> Result<&'static str, NodeError> {
        let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < successful_attempt {
            Err(NodeError::Transient("503".to_string()))
        } else {
            Ok("done")
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let first = policy.backoff(0).as_millis();
        assert!((80..=120).contains(&first));
        let third = policy.backoff(2).as_millis();
        assert!((320..=480).contains(&third));
        let capped = policy.backoff(10).as_millis();
        assert!(capped <= 1_200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_within_budget_succeed() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let mut retries = Vec::new();

        let result = policy
            .run(
                "test",
                &CancellationToken::new(),
                move |_| async move { failing_until(3, counter) },
                |attempt, _| retries.push(attempt),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let policy = RetryPolicy::default().with_max_attempts(Some(2));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let err = policy
            .run(
                "test",
                &CancellationToken::new(),
                move |_| async move { failing_until(3, counter) },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, NodeError::Exhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let err = policy
            .run(
                "test",
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(NodeError::Permanent("400".to_string())) }
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, NodeError::Permanent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = policy
            .run(
                "test",
                &cancel,
                |_| async { Err::<(), _>(NodeError::Transient("429".to_string())) },
                |_, _| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Cancelled));
    }
}
