//! Bounded retry with multiplicative backoff and per-attempt timeouts

use std::future::Future;
use std::time::Duration;

use super::types::Step;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub multiplier: f64,
    /// Raced against every attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            multiplier: 1.0,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// A step without a `retry` table gets exactly one attempt.
    pub fn from_step(step: &Step) -> Self {
        let mut policy = match &step.retry {
            Some(retry) => Self {
                max_attempts: retry.max_attempts.max(1),
                delay: Duration::from_secs(retry.delay_secs),
                multiplier: retry.backoff_multiplier.unwrap_or(1.0),
                attempt_timeout: None,
            },
            None => Self::default(),
        };
        policy.attempt_timeout = step.timeout_secs.map(Duration::from_secs);
        policy
    }

    /// Delay after failed attempt `attempt` (1-based): `delay * multiplier^(attempt-1)`,
    /// saturating at [`Duration::MAX`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(0.0).powi(exponent);
        let secs = self.delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Run `attempt` until it succeeds or attempts run out.
    ///
    /// `on_retry(failed_attempt, error, delay)` runs before each backoff
    /// sleep. Cancellation errors are returned immediately.
    pub async fn run<T, F, Fut, R, RFut>(&self, mut attempt: F, mut on_retry: R) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        R: FnMut(u32, AppError, Duration) -> RFut,
        RFut: Future<Output = ()>,
    {
        let max = self.max_attempts.max(1);
        let mut n = 1;
        loop {
            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt(n)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::timeout(format!(
                        "Attempt {n} timed out after {}s",
                        limit.as_secs()
                    ))),
                },
                None => attempt(n).await,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_cancelled() || n >= max {
                return Err(err);
            }

            let delay = self.delay_for(n);
            tracing::debug!(attempt = n, max_attempts = max, ?delay, "retrying after failure: {}", err.message);
            on_retry(n, err, delay).await;
            tokio::time::sleep(delay).await;
            n += 1;
        }
    }
}
