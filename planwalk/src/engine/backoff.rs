//! Bounded exponential backoff for transient infrastructure errors.
//!
//! Store or channel hiccups are retried locally at the call site and never
//! surfaced as a pipeline failure unless the attempts exhaust.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::errors::EngineError;

/// Retry policy for transient errors.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum attempts, including the initial one.
    pub max_attempts: usize,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Apply full jitter (random delay in `0..=computed`).
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disables jitter (deterministic delays, mainly for tests).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Computes the delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.min(20)).unwrap_or(20);
        let computed = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter && !computed.is_zero() {
            let nanos = rand::thread_rng().gen_range(0..=computed.as_nanos());
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        } else {
            computed
        }
    }
}

/// Runs `op`, retrying transient errors per the policy.
///
/// Non-transient errors propagate immediately; the last transient error
/// propagates once attempts exhaust.
pub async fn retry_transient<T, F, Fut>(
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                tracing::debug!(?err, attempt, "retrying transient error");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = BackoffPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .without_jitter();

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let attempts = AtomicUsize::new(0);
        let policy = BackoffPolicy::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .without_jitter();

        let result = retry_transient(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Store("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_propagate_last_error() {
        let policy = BackoffPolicy::new()
            .with_max_attempts(2)
            .with_base_delay(Duration::from_millis(1))
            .without_jitter();

        let err = retry_transient::<(), _, _>(&policy, || async {
            Err(EngineError::Store("still down".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let policy = BackoffPolicy::new().with_max_attempts(5);

        let err = retry_transient::<(), _, _>(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EngineError::CorruptPlan {
                    reason: "bad graph".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
