use std::time::Duration;

use crate::BreakerError;

/// Configuration for one breaker target.
///
/// There is no `Default`: every target must be configured explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed.
    pub recovery_timeout: Duration,
    /// Upper bound for a single guarded call.
    pub call_timeout: Duration,
}

impl BreakerConfig {
    /// Creates a validated configuration.
    pub fn new(
        failure_threshold: u32,
        recovery_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, BreakerError> {
        if failure_threshold == 0 {
            return Err(BreakerError::InvalidConfig(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if call_timeout.is_zero() {
            return Err(BreakerError::InvalidConfig(
                "call_timeout must be greater than zero".into(),
            ));
        }
        Ok(Self {
            failure_threshold,
            recovery_timeout,
            call_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_threshold() {
        let result = BreakerConfig::new(0, Duration::from_secs(30), Duration::from_secs(2));
        assert!(matches!(result, Err(BreakerError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_call_timeout() {
        let result = BreakerConfig::new(3, Duration::from_secs(30), Duration::ZERO);
        assert!(matches!(result, Err(BreakerError::InvalidConfig(_))));
    }

    #[test]
    fn accepts_valid_values() {
        let config = BreakerConfig::new(3, Duration::from_secs(30), Duration::from_secs(2)).unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.recovery_timeout, Duration::from_secs(30));
    }
}
