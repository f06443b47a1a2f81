//! Resilience patterns for production deployment.
//!
//! Exponential backoff for retries, a three-state circuit breaker, and a
//! signal-driven kill switch for graceful/emergency shutdown.

pub mod backoff;
pub mod circuit_breaker;
pub mod kill_switch;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use kill_switch::{KillSwitch, KillSwitchState};
