//! Retry policy: bounded attempts with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Retry policy for transient operation failures.
///
/// An operation runs at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s initial delay, 2x backoff.
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the `attempts`-th failure (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`, capped.
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map(|d| d.min(MAX_BACKOFF))
            .unwrap_or(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The last error is returned unchanged.
    ///
    /// `op` receives the 1-indexed attempt number. `on_retry` runs before each
    /// backoff sleep with the failed attempt's number, its error and the delay.
    /// Once `cancel` fires no new attempt starts; an attempt already running
    /// is allowed to finish.
    pub async fn run<T, E, Op, Fut, P, C>(
        &self,
        cancel: &CancellationToken,
        is_retryable: P,
        mut on_retry: C,
        mut op: Op,
    ) -> Result<T, E>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        C: FnMut(u32, &E, Duration),
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.max_attempts() || !is_retryable(&err) || cancel.is_cancelled() {
                return Err(err);
            }

            let delay = self.next_delay(attempt);
            on_retry(attempt, &err, delay);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
