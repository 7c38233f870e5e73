//! The per-target breaker state machine.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::{BreakerConfig, BreakerError, CallError};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through and failures are counted.
    Closed,
    /// Calls fail fast until the recovery timeout elapses.
    Open,
    /// A single probe call decides whether to close or reopen.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub caller: String,
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    /// The target answered but rejected the request.
    Neutral,
}

/// Guards synchronous calls from one caller to one target.
///
/// State lives behind a plain mutex that is never held across an await, so
/// the breaker can be shared freely between tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    caller: String,
    target: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(caller: impl Into<String>, target: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self {
            caller: caller.into(),
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_failure_wall: None,
                probe_in_flight: false,
            }),
        };
        breaker.set_state_gauge(CircuitState::Closed);
        breaker
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose recovery timeout elapsed still
    /// reports `Open` until the next call turns it half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            caller: self.caller.clone(),
            target: self.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_wall,
            probe_in_flight: inner.probe_in_flight,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout.as_millis() as u64,
        }
    }

    /// Invokes `call` through the breaker using the configured call timeout.
    pub async fn call<F, Fut, T>(&self, call: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.call_with_timeout(self.config.call_timeout, call).await
    }

    /// Invokes `call` through the breaker with an explicit timeout.
    ///
    /// `call` is not invoked at all when the circuit rejects the attempt.
    /// Timeouts and transient errors count as failures; permanent errors
    /// are passed through without touching the failure count.
    pub async fn call_with_timeout<F, Fut, T>(
        &self,
        timeout: Duration,
        call: F,
    ) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                self.record_call("rejected");
                return Err(e);
            }
        };

        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => {
                permit.settle(Outcome::Success);
                self.record_call("success");
                Ok(value)
            }
            Ok(Err(error @ CallError::Permanent(_))) => {
                permit.settle(Outcome::Neutral);
                self.record_call("permanent");
                Err(BreakerError::from_call(&self.target, error))
            }
            Ok(Err(error @ CallError::Transient(_))) => {
                permit.settle(Outcome::Failure);
                self.record_call("failure");
                Err(BreakerError::from_call(&self.target, error))
            }
            Err(_) => {
                permit.settle(Outcome::Failure);
                self.record_call("timeout");
                Err(BreakerError::Timeout {
                    target: self.target.clone(),
                    timeout,
                })
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self) -> Result<Permit<'_>, BreakerError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_at
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return Err(self.open_error());
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.open_error());
                }
                inner.probe_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn settle(&self, probe: bool, outcome: Outcome) {
        let mut inner = self.lock();

        if probe {
            inner.probe_in_flight = false;
            match outcome {
                Outcome::Success | Outcome::Neutral => {
                    inner.consecutive_failures = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
                Outcome::Failure => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    self.mark_failure(&mut inner);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            return;
        }

        // Results of calls admitted before the circuit left CLOSED are dropped
        if inner.state != CircuitState::Closed {
            return;
        }

        match outcome {
            Outcome::Success => inner.consecutive_failures = 0,
            Outcome::Neutral => {}
            Outcome::Failure => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                self.mark_failure(&mut inner);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
        }
    }

    fn mark_failure(&self, inner: &mut Inner) {
        inner.last_failure_at = Some(Instant::now());
        inner.last_failure_wall = Some(Utc::now());
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitState::Open => tracing::error!(
                caller = %self.caller,
                target = %self.target,
                %from,
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            ),
            _ => tracing::info!(
                caller = %self.caller,
                target = %self.target,
                %from,
                %to,
                "circuit state changed"
            ),
        }

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "caller" => self.caller.clone(),
            "target" => self.target.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        self.set_state_gauge(to);
    }

    fn open_error(&self) -> BreakerError {
        BreakerError::CircuitOpen {
            target: self.target.clone(),
        }
    }

    fn set_state_gauge(&self, state: CircuitState) {
        metrics::gauge!(
            "circuit_breaker_state",
            "caller" => self.caller.clone(),
            "target" => self.target.clone()
        )
        .set(state.gauge_value());
    }

    fn record_call(&self, outcome: &'static str) {
        metrics::counter!(
            "circuit_breaker_calls_total",
            "caller" => self.caller.clone(),
            "target" => self.target.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Admission to make one call. A probe permit dropped without being
/// settled (the caller's future was cancelled) counts as a failed probe.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.settle(self.probe, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.settle(true, Outcome::Failure);
        }
    }
}
