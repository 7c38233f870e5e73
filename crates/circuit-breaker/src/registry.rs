use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::{BreakerConfig, BreakerError, BreakerSnapshot, CallError, CircuitBreaker};

/// The breakers one caller keeps for the targets it calls.
///
/// Breakers are created lazily on first use from the per-target
/// configuration and live as long as the registry. The map is only locked
/// to look up or insert a breaker; each breaker synchronizes itself.
#[derive(Debug)]
pub struct BreakerRegistry {
    caller: String,
    configs: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Creates a registry with no configured targets.
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            configs: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry from a set of target configurations.
    pub fn from_configs<I, S>(caller: impl Into<String>, configs: I) -> Self
    where
        I: IntoIterator<Item = (S, BreakerConfig)>,
        S: Into<String>,
    {
        configs
            .into_iter()
            .fold(Self::new(caller), |registry, (target, config)| {
                registry.with_target(target, config)
            })
    }

    /// Adds configuration for a target.
    pub fn with_target(mut self, target: impl Into<String>, config: BreakerConfig) -> Self {
        self.configure(target, config);
        self
    }

    /// Adds or replaces configuration for a target. Breakers already created
    /// keep the configuration they were created with.
    pub fn configure(&mut self, target: impl Into<String>, config: BreakerConfig) {
        self.configs.insert(target.into(), config);
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// Returns true if the target has a configuration.
    pub fn is_configured(&self, target: &str) -> bool {
        self.configs.contains_key(target)
    }

    /// Returns the breaker for a target, creating it on first use.
    pub fn breaker(&self, target: &str) -> Result<Arc<CircuitBreaker>, BreakerError> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
        {
            return Ok(Arc::clone(breaker));
        }

        let config = self
            .configs
            .get(target)
            .copied()
            .ok_or_else(|| BreakerError::Unconfigured(target.to_string()))?;

        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(target.to_string()).or_insert_with(|| {
            tracing::debug!(caller = %self.caller, target = %target, "circuit breaker created");
            Arc::new(CircuitBreaker::new(self.caller.clone(), target, config))
        });
        Ok(Arc::clone(breaker))
    }

    /// Invokes `call` against `target` through its breaker.
    pub async fn invoke<F, Fut, T>(&self, target: &str, call: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let breaker = self.breaker(target)?;
        breaker.call(call).await
    }

    /// Like [`invoke`](Self::invoke) with a per-call timeout override.
    pub async fn invoke_with_timeout<F, Fut, T>(
        &self,
        target: &str,
        timeout: Duration,
        call: F,
    ) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let breaker = self.breaker(target)?;
        breaker.call_with_timeout(timeout, call).await
    }

    /// Snapshots of every breaker created so far, sorted by target.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|breaker| breaker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }
}
