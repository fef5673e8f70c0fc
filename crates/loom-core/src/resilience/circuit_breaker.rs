//! Circuit breaker over container creation.
//!
//! Closed counts consecutive failures. Reaching the threshold opens the
//! breaker; while open every request is rejected without touching the
//! engine. After the cooldown the breaker turns half-open and lets exactly
//! one trial through: success closes it, failure re-opens it.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker open ({consecutive_failures} consecutive failures)")]
pub struct CircuitOpen {
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_secs(config.reset_timeout_secs),
        )
    }

    /// Ask permission for one creation attempt.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let Some(opened_at) = inner.opened_at else {
            return Ok(());
        };

        if now.duration_since(opened_at) < self.reset_timeout {
            return Err(CircuitOpen {
                consecutive_failures: inner.consecutive_failures,
            });
        }

        // Half-open: one trial at a time. A trial that never reported back
        // is given up on after another cooldown window.
        match inner.trial_started {
            Some(started) if now.duration_since(started) < self.reset_timeout => Err(CircuitOpen {
                consecutive_failures: inner.consecutive_failures,
            }),
            _ => {
                inner.trial_started = Some(now);
                tracing::info!("circuit breaker half-open, permitting one trial");
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.opened_at.is_some() {
            tracing::info!("circuit breaker closed");
        }
        *inner = Inner::default();
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_started = None;

        if inner.consecutive_failures >= self.failure_threshold {
            if inner.opened_at.is_none() {
                tracing::warn!(
                    consecutive_failures = inner.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            inner.opened_at = Some(now);
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock();
        match inner.opened_at {
            None => BreakerState::Closed,
            Some(opened_at) if opened_at.elapsed() < self.reset_timeout => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}
