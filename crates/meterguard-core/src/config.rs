//! Resilience settings, environment overrides and per-call feature toggles.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::concurrent::BatchConfig;
use crate::http_client::PoolConfig;
use crate::retry::RetryConfig;

const ENV_PREFIX: &str = "METERGUARD_";

/// Errors raised while building or validating a [`ResilienceConfig`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("environment variable {var}={value:?} is not valid: {message}")]
    Env {
        var: String,
        value: String,
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Every tunable of the resilience layer.
///
/// Deserializes from any serde format with missing fields taking their defaults.
/// Durations are expressed in (fractional) seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Total attempt budget per logical call.
    pub max_retries: u32,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    pub exponential_backoff_base: f64,
    /// Cap on a single backoff window. `None` leaves it uncapped.
    #[serde(with = "opt_secs")]
    pub max_backoff: Option<Duration>,
    #[serde(with = "secs")]
    pub network_error_delay: Duration,
    /// Stagger between batch submissions.
    #[serde(with = "secs")]
    pub rate_limit_delay: Duration,

    pub failure_threshold: u32,
    #[serde(with = "secs")]
    pub recovery_timeout: Duration,
    pub success_threshold: u32,

    pub max_workers: usize,
    pub pool_connections: usize,
    pub pool_maxsize: usize,
    #[serde(with = "secs")]
    pub batch_item_timeout: Duration,

    #[serde(with = "secs")]
    pub cache_ttl: Duration,
    pub cache_dir: PathBuf,

    /// Request timeout overrides keyed by endpoint.
    #[serde(with = "secs_map")]
    pub endpoint_timeouts: BTreeMap<String, Duration>,

    pub data_point_limit: usize,
    pub data_point_warning_ratio: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: Duration::from_secs(60),
            exponential_backoff_base: 2.0,
            max_backoff: Some(Duration::from_secs(60)),
            network_error_delay: Duration::from_secs(1),
            rate_limit_delay: Duration::from_millis(100),
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            max_workers: 3,
            pool_connections: 10,
            pool_maxsize: 20,
            batch_item_timeout: Duration::from_secs(120),
            cache_ttl: Duration::from_secs(7200),
            cache_dir: PathBuf::from(".cache"),
            endpoint_timeouts: BTreeMap::new(),
            data_point_limit: 50_000,
            data_point_warning_ratio: 0.9,
        }
    }
}

impl ResilienceConfig {
    /// Defaults with `METERGUARD_*` environment overrides applied, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides found through `lookup`, which receives full variable names
    /// such as `METERGUARD_MAX_RETRIES`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup: &lookup };

        env.parse("MAX_RETRIES", &mut self.max_retries)?;
        env.seconds("REQUEST_TIMEOUT", &mut self.request_timeout)?;
        env.parse("EXPONENTIAL_BACKOFF_BASE", &mut self.exponential_backoff_base)?;
        if let Some(raw) = env.raw("MAX_BACKOFF") {
            self.max_backoff = if raw.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(env.duration("MAX_BACKOFF", &raw)?)
            };
        }
        env.seconds("NETWORK_ERROR_DELAY", &mut self.network_error_delay)?;
        env.seconds("RATE_LIMIT_DELAY", &mut self.rate_limit_delay)?;
        env.parse("FAILURE_THRESHOLD", &mut self.failure_threshold)?;
        env.seconds("RECOVERY_TIMEOUT", &mut self.recovery_timeout)?;
        env.parse("SUCCESS_THRESHOLD", &mut self.success_threshold)?;
        env.parse("MAX_WORKERS", &mut self.max_workers)?;
        env.parse("POOL_CONNECTIONS", &mut self.pool_connections)?;
        env.parse("POOL_MAXSIZE", &mut self.pool_maxsize)?;
        env.seconds("BATCH_ITEM_TIMEOUT", &mut self.batch_item_timeout)?;
        env.seconds("CACHE_TTL", &mut self.cache_ttl)?;
        if let Some(raw) = env.raw("CACHE_DIR") {
            self.cache_dir = PathBuf::from(raw);
        }
        env.parse("DATA_POINT_LIMIT", &mut self.data_point_limit)?;
        env.parse("DATA_POINT_WARNING_RATIO", &mut self.data_point_warning_ratio)?;

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < 1 {
            return Err(ConfigError::invalid("max_retries", "must be at least 1"));
        }
        if !(self.exponential_backoff_base >= 2.0) {
            return Err(ConfigError::invalid(
                "exponential_backoff_base",
                "must be at least 2",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout", "must be positive"));
        }
        if self.rate_limit_delay.is_zero() || self.rate_limit_delay > Duration::from_secs(10) {
            return Err(ConfigError::invalid(
                "rate_limit_delay",
                "must be greater than 0 and at most 10 seconds",
            ));
        }
        check_range("failure_threshold", self.failure_threshold, 1, 20)?;
        check_range("success_threshold", self.success_threshold, 1, 10)?;
        if self.recovery_timeout < Duration::from_secs(1)
            || self.recovery_timeout > Duration::from_secs(600)
        {
            return Err(ConfigError::invalid(
                "recovery_timeout",
                "must be between 1 and 600 seconds",
            ));
        }
        check_range("max_workers", self.max_workers, 1, 20)?;
        check_range("pool_connections", self.pool_connections, 1, 100)?;
        check_range("pool_maxsize", self.pool_maxsize, 1, 200)?;
        if self.batch_item_timeout.is_zero() {
            return Err(ConfigError::invalid("batch_item_timeout", "must be positive"));
        }
        if !(self.data_point_warning_ratio > 0.0 && self.data_point_warning_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "data_point_warning_ratio",
                "must be in (0, 1]",
            ));
        }
        if let Some((endpoint, _)) = self
            .endpoint_timeouts
            .iter()
            .find(|(_, timeout)| timeout.is_zero())
        {
            return Err(ConfigError::invalid(
                "endpoint_timeouts",
                format!("timeout for `{endpoint}` must be positive"),
            ));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::exponential(
            self.max_retries,
            self.exponential_backoff_base,
            self.max_backoff,
        )
        .with_network_delay(self.network_error_delay)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: self.recovery_timeout,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_connections: self.pool_connections,
            pool_maxsize: self.pool_maxsize,
            ..PoolConfig::default()
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_workers: self.max_workers,
            rate_limit_delay: self.rate_limit_delay,
            item_timeout: self.batch_item_timeout,
        }
    }

    /// Request timeout for `endpoint`, falling back to `request_timeout`.
    pub fn timeout_for(&self, endpoint: &str) -> Duration {
        self.endpoint_timeouts
            .get(endpoint)
            .copied()
            .unwrap_or(self.request_timeout)
    }

    /// Payload size at which a data-point warning is logged.
    pub fn data_point_warning_threshold(&self) -> usize {
        let threshold = self.data_point_limit as f64 * self.data_point_warning_ratio;
        threshold.floor() as usize
    }
}

fn check_range<T>(field: &'static str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(ConfigError::invalid(
            field,
            format!("must be between {min} and {max}, got {value}"),
        ));
    }
    Ok(())
}

struct EnvReader<'a, L: Fn(&str) -> Option<String>> {
    lookup: &'a L,
}

impl<L: Fn(&str) -> Option<String>> EnvReader<'_, L> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn error(&self, key: &str, value: &str, message: impl Into<String>) -> ConfigError {
        ConfigError::Env {
            var: format!("{ENV_PREFIX}{key}"),
            value: value.to_owned(),
            message: message.into(),
        }
    }

    fn parse<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.raw(key) {
            *target = raw
                .parse()
                .map_err(|e: T::Err| self.error(key, &raw, e.to_string()))?;
        }
        Ok(())
    }

    fn seconds(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(raw) = self.raw(key) {
            *target = self.duration(key, &raw)?;
        }
        Ok(())
    }

    fn duration(&self, key: &str, raw: &str) -> Result<Duration, ConfigError> {
        let secs = raw
            .parse::<f64>()
            .map_err(|e| self.error(key, raw, e.to_string()))?;
        Duration::try_from_secs_f64(secs).map_err(|e| self.error(key, raw, e.to_string()))
    }
}

/// Process-wide switches read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureToggles {
    /// `ENABLE_API_CACHE`
    pub cache: bool,
    /// `ENABLE_SCHEMA_VALIDATION`
    pub schema_validation: bool,
}

impl FeatureToggles {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            cache: lookup("ENABLE_API_CACHE").is_some_and(|v| is_truthy(&v)),
            schema_validation: lookup("ENABLE_SCHEMA_VALIDATION").is_some_and(|v| is_truthy(&v)),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Per-call overrides for [`crate::ResilientClient::call_with_resilience`].
///
/// `None` fields fall back to the environment toggles and configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub use_cache: Option<bool>,
    pub validate_schema: Option<bool>,
    pub timeout: Option<Duration>,
    pub correlation_id: Option<String>,
}

impl CallOptions {
    pub fn cached(mut self, enabled: bool) -> Self {
        self.use_cache = Some(enabled);
        self
    }

    pub fn validated(mut self, enabled: bool) -> Self {
        self.validate_schema = Some(enabled);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Effective toggles after applying these overrides on top of `toggles`.
    pub fn resolve(&self, toggles: FeatureToggles) -> FeatureToggles {
        FeatureToggles {
            cache: self.use_cache.unwrap_or(toggles.cache),
            schema_validation: self.validate_schema.unwrap_or(toggles.schema_validation),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod secs_map {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .iter()
            .map(|(endpoint, timeout)| (endpoint, timeout.as_secs_f64()))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Duration>, D::Error> {
        BTreeMap::<String, f64>::deserialize(deserializer)?
            .into_iter()
            .map(|(endpoint, secs)| {
                Duration::try_from_secs_f64(secs)
                    .map(|timeout| (endpoint, timeout))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
