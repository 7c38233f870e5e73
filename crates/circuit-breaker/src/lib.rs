//! Circuit breakers for synchronous calls between services.
//!
//! A [`BreakerRegistry`] belongs to one calling service and holds a
//! [`CircuitBreaker`] per target service. Each breaker moves through
//! `Closed -> Open -> HalfOpen -> Closed | Open`:
//!
//! - **Closed**: calls pass; consecutive transient failures and timeouts are
//!   counted, and reaching the threshold opens the circuit.
//! - **Open**: calls fail with [`BreakerError::CircuitOpen`] without invoking
//!   the target until the recovery timeout has elapsed.
//! - **HalfOpen**: exactly one probe call is let through; its result closes
//!   or reopens the circuit.
//!
//! Permanent errors (the target rejected the request) never count.

pub mod breaker;
pub mod config;
pub mod error;
pub mod registry;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use config::BreakerConfig;
pub use error::{BreakerError, CallError};
pub use registry::BreakerRegistry;
