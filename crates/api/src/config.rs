//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use circuit_breaker::{BreakerConfig, BreakerError, BreakerRegistry};
use event_channel::ChannelConfig;
use saga::order_fulfillment::{PAYMENT_GATEWAY, SagaSettings};
use saga::BackoffPolicy;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Breaker(#[from] BreakerError),
}

/// Output format of the `fmt` tracing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

/// Server configuration.
///
/// Reads from environment variables:
/// - `HOST` bind address (default: `"0.0.0.0"`)
/// - `PORT` listen port (default: `3000`)
/// - `RUST_LOG` tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` `text` or `json` (default: `text`)
/// - `DATABASE_URL` PostgreSQL for the event log and step log; in-memory
///   storage when unset
/// - `BREAKER_TARGETS` comma-separated breaker targets (required), each
///   with `BREAKER_<T>_FAILURE_THRESHOLD`, `BREAKER_<T>_RECOVERY_TIMEOUT_MS`
///   and `BREAKER_<T>_CALL_TIMEOUT_MS` (required)
/// - `CHANNEL_VISIBILITY_TIMEOUT_MS`, `CHANNEL_MAX_DELIVERIES`,
///   `CHANNEL_REDELIVERY_DELAY_MS`
/// - `STEP_MAX_ATTEMPTS`, `STEP_RETRY_DELAY_MS`, `COMPENSATION_MAX_ATTEMPTS`,
///   `COMPENSATION_INITIAL_DELAY_MS`, `COMPENSATION_MAX_DELAY_MS`
///
/// Breaker settings have no defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub breakers: Vec<(String, BreakerConfig)>,
    pub channel: ChannelConfig,
    pub saga: SagaSettings,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let breakers = env.breakers()?;

        let defaults = ChannelConfig::default();
        let channel = ChannelConfig {
            visibility_timeout: env
                .millis("CHANNEL_VISIBILITY_TIMEOUT_MS")?
                .unwrap_or(defaults.visibility_timeout),
            max_deliveries: env
                .parsed("CHANNEL_MAX_DELIVERIES")?
                .unwrap_or(defaults.max_deliveries),
            redelivery_delay: env
                .millis("CHANNEL_REDELIVERY_DELAY_MS")?
                .unwrap_or(defaults.redelivery_delay),
            partition_idle_timeout: defaults.partition_idle_timeout,
        };

        let saga = SagaSettings {
            step_retry: BackoffPolicy::fixed(
                env.parsed("STEP_MAX_ATTEMPTS")?.unwrap_or(3),
                env.millis("STEP_RETRY_DELAY_MS")?
                    .unwrap_or(Duration::from_millis(100)),
            ),
            compensation: BackoffPolicy::exponential(
                env.parsed("COMPENSATION_MAX_ATTEMPTS")?.unwrap_or(5),
                env.millis("COMPENSATION_INITIAL_DELAY_MS")?
                    .unwrap_or(Duration::from_millis(200)),
                env.millis("COMPENSATION_MAX_DELAY_MS")?
                    .unwrap_or(Duration::from_secs(5)),
            ),
        };

        Ok(Self {
            host: env.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.parsed("PORT")?.unwrap_or(3000),
            log_level: env.get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            log_format: env.parsed("LOG_FORMAT")?.unwrap_or_default(),
            database_url: env.get("DATABASE_URL"),
            breakers,
            channel,
            saga,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the breaker registry `caller` uses for its outbound calls.
    pub fn breaker_registry(&self, caller: &str) -> BreakerRegistry {
        BreakerRegistry::from_configs(caller, self.breakers.iter().cloned())
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|value| parse(key, &value))
            .transpose()
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed(key)?.map(Duration::from_millis))
    }

    fn breakers(&self) -> Result<Vec<(String, BreakerConfig)>, ConfigError> {
        let targets = self.required("BREAKER_TARGETS")?;
        let mut breakers = Vec::new();
        for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let prefix = format!("BREAKER_{}", target.to_ascii_uppercase().replace('-', "_"));
            let threshold_key = format!("{prefix}_FAILURE_THRESHOLD");
            let recovery_key = format!("{prefix}_RECOVERY_TIMEOUT_MS");
            let timeout_key = format!("{prefix}_CALL_TIMEOUT_MS");

            let threshold = parse(&threshold_key, &self.required(&threshold_key)?)?;
            let recovery: u64 = parse(&recovery_key, &self.required(&recovery_key)?)?;
            let timeout: u64 = parse(&timeout_key, &self.required(&timeout_key)?)?;

            let config = BreakerConfig::new(
                threshold,
                Duration::from_millis(recovery),
                Duration::from_millis(timeout),
            )?;
            breakers.push((target.to_string(), config));
        }

        if !breakers.iter().any(|(target, _)| target == PAYMENT_GATEWAY) {
            return Err(BreakerError::Unconfigured(PAYMENT_GATEWAY.to_string()).into());
        }
        Ok(breakers)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}
