use std::time::Duration;

use thiserror::Error;

/// How a guarded call failed, as classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The target is unavailable: connection refused, 5xx, overload.
    /// Counts toward opening the circuit.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The target rejected the request itself (validation, 4xx).
    /// Never retried and never counted by the breaker.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// Errors returned to callers of a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError {
    /// The circuit is open (or a half-open probe is already in flight);
    /// the target was not invoked.
    #[error("circuit open for target '{target}'")]
    CircuitOpen { target: String },

    /// The call did not complete within the call timeout.
    #[error("call to '{target}' timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// The target reported itself unavailable.
    #[error("transient failure calling '{target}': {reason}")]
    Transient { target: String, reason: String },

    /// The target rejected the request.
    #[error("permanent failure calling '{target}': {reason}")]
    Permanent { target: String, reason: String },

    /// No configuration was supplied for the target.
    #[error("no circuit breaker configured for target '{0}'")]
    Unconfigured(String),

    /// A breaker configuration failed validation.
    #[error("invalid circuit breaker configuration: {0}")]
    InvalidConfig(String),
}

impl BreakerError {
    /// Returns true for errors worth retrying later: unavailability of the
    /// target, timeouts and open circuits.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. }
        )
    }

    /// Returns true if the call was rejected without reaching the target.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub(crate) fn from_call(target: &str, error: CallError) -> Self {
        match error {
            CallError::Transient(reason) => Self::Transient {
                target: target.to_string(),
                reason,
            },
            CallError::Permanent(reason) => Self::Permanent {
                target: target.to_string(),
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        let open = BreakerError::CircuitOpen {
            target: "payment-gateway".into(),
        };
        assert!(open.is_transient());
        assert!(open.is_open());

        let permanent = BreakerError::from_call(
            "payment-gateway",
            CallError::Permanent("card declined".into()),
        );
        assert!(!permanent.is_transient());
        assert_eq!(
            permanent.to_string(),
            "permanent failure calling 'payment-gateway': card declined"
        );
    }
}
