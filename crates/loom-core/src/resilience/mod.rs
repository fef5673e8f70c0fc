//! Resilience primitives shared by container creation.
//!
//! - [`RetryPolicy`]: bounded retry with exponential backoff
//! - [`CircuitBreaker`]: sheds creation load after consecutive failures

pub mod circuit_breaker;
pub mod retry;

pub use self::circuit_breaker::{BreakerState, CircuitBreaker, CircuitOpen};
pub use self::retry::RetryPolicy;
