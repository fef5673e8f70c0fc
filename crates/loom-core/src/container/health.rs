//! HTTP readiness polling.
//!
//! Any HTTP response counts as ready, including 4xx/5xx: the process is
//! listening even if it is erroring. Only connection failures mean "not yet".

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::ports::HttpProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Ready { status: u16, attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled,
}

#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn HttpProbe>,
    interval: Duration,
    max_attempts: u32,
    request_timeout: Duration,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HttpProbe>, config: &HealthConfig) -> Self {
        Self {
            probe,
            interval: Duration::from_millis(config.interval_ms),
            max_attempts: config.max_attempts.max(1),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    /// Poll `url` until it answers, attempts run out, or `cancel` fires.
    /// A cancelled check returns at once without issuing further requests.
    pub async fn wait_until_ready(&self, url: &str, cancel: &CancellationToken) -> HealthOutcome {
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return HealthOutcome::Cancelled;
            }

            match self.probe.probe(url, self.request_timeout).await {
                Ok(status) => {
                    tracing::debug!(url, status, attempt, "health check answered");
                    return HealthOutcome::Ready {
                        status,
                        attempts: attempt,
                    };
                }
                Err(e) => tracing::trace!(url, attempt, error = %e, "health check not ready"),
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return HealthOutcome::Cancelled,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        HealthOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }
}
