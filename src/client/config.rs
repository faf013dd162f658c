//! Connection manager configuration.
//!
//! Configuration comes from [`ManagerConfig::default`], any serde format
//! (keys are camelCase, durations are milliseconds), the
//! [`ManagerConfigBuilder`], or `RELINK_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::LinkError;
use crate::core::constants::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_CONNECTION_ATTEMPTS,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MAX_SEND_ATTEMPTS, DEFAULT_POLLING_RATE,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_UPGRADE_INTERVAL, ENV_PREFIX, MAX_BACKOFF_JITTER,
};
use crate::transport::BackoffPolicy;

/// Tuning of a [`ConnectionManager`](super::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Interval between poll cycles while degraded.
    #[serde(with = "millis")]
    pub polling_rate: Duration,

    /// Consecutive push failures before falling back to polling; `0` means
    /// push only.
    pub max_connection_attempts: u32,

    /// Failed upgrade probes before probing stops, or failed attempts in
    /// push-only mode before the session is given up.
    pub max_reconnect_attempts: u32,

    /// Interval between upgrade probes while polling.
    #[serde(rename = "upgradeIntervalMs", with = "millis")]
    pub upgrade_interval: Duration,

    /// Reconnect delay after the first failure.
    #[serde(rename = "backoffBaseMs", with = "millis")]
    pub backoff_base: Duration,

    /// Cap for reconnect delays.
    #[serde(rename = "backoffMaxMs", with = "millis")]
    pub backoff_max: Duration,

    /// Symmetric jitter fraction applied to reconnect delays.
    pub backoff_jitter: f64,

    /// Outbound messages buffered before the oldest is evicted.
    pub queue_capacity: usize,

    /// Failed sends tolerated per message before it is dropped.
    pub max_send_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            polling_rate: DEFAULT_POLLING_RATE,
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            upgrade_interval: DEFAULT_UPGRADE_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            backoff_jitter: 0.0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
        }
    }
}

impl ManagerConfig {
    /// Start a [`ManagerConfigBuilder`] from the defaults.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::new()
    }

    /// Defaults overridden by `RELINK_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if a variable is set but unparsable.
    pub fn from_env() -> Result<Self, LinkError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `RELINK_*` key.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if a value is present but unparsable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LinkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = read::<u64, _>(&lookup, "POLLING_RATE_MS")? {
            config.polling_rate = Duration::from_millis(ms);
        }
        if let Some(n) = read::<u32, _>(&lookup, "MAX_CONNECTION_ATTEMPTS")? {
            config.max_connection_attempts = n;
        }
        if let Some(n) = read::<u32, _>(&lookup, "MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = n;
        }
        if let Some(ms) = read::<u64, _>(&lookup, "UPGRADE_INTERVAL_MS")? {
            config.upgrade_interval = Duration::from_millis(ms);
        }
        if let Some(n) = read::<usize, _>(&lookup, "QUEUE_CAPACITY")? {
            config.queue_capacity = n;
        }
        if let Some(n) = read::<u32, _>(&lookup, "MAX_SEND_ATTEMPTS")? {
            config.max_send_attempts = n;
        }

        Ok(config)
    }

    /// Check the values a manager cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.polling_rate.is_zero() {
            return Err(LinkError::Config("pollingRate must be positive".into()));
        }
        if self.upgrade_interval.is_zero() {
            return Err(LinkError::Config("upgradeIntervalMs must be positive".into()));
        }
        if self.backoff_base.is_zero() {
            return Err(LinkError::Config("backoffBaseMs must be positive".into()));
        }
        if self.backoff_max < self.backoff_base {
            return Err(LinkError::Config(
                "backoffMaxMs must not be below backoffBaseMs".into(),
            ));
        }
        if !(0.0..=MAX_BACKOFF_JITTER).contains(&self.backoff_jitter) {
            return Err(LinkError::Config(format!(
                "backoffJitter must be within 0..={MAX_BACKOFF_JITTER}"
            )));
        }
        if self.queue_capacity == 0 {
            return Err(LinkError::Config("queueCapacity must be positive".into()));
        }
        if self.max_send_attempts == 0 {
            return Err(LinkError::Config("maxSendAttempts must be positive".into()));
        }
        Ok(())
    }

    /// Reconnect backoff derived from this configuration.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max).with_jitter(self.backoff_jitter)
    }

    /// Whether push failures may degrade the session to polling.
    pub fn fallback_enabled(&self) -> bool {
        self.max_connection_attempts > 0
    }
}

fn read<T, F>(lookup: &F, name: &str) -> Result<Option<T>, LinkError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{ENV_PREFIX}{name}");
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| LinkError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Create a builder starting from the defaults.
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    /// Set the polling interval.
    pub fn polling_rate(mut self, rate: Duration) -> Self {
        self.config.polling_rate = rate;
        self
    }

    /// Set the push failures tolerated before falling back to polling.
    pub fn max_connection_attempts(mut self, attempts: u32) -> Self {
        self.config.max_connection_attempts = attempts;
        self
    }

    /// Disable the polling fallback entirely.
    pub fn push_only(self) -> Self {
        self.max_connection_attempts(0)
    }

    /// Set the reconnect attempt budget.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Set the upgrade probe interval.
    pub fn upgrade_interval(mut self, interval: Duration) -> Self {
        self.config.upgrade_interval = interval;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_base = base;
        self.config.backoff_max = max;
        self
    }

    /// Set the reconnect jitter fraction.
    pub fn backoff_jitter(mut self, fraction: f64) -> Self {
        self.config.backoff_jitter = fraction;
        self
    }

    /// Set the outbound queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the per-message send attempt budget.
    pub fn max_send_attempts(mut self, attempts: u32) -> Self {
        self.config.max_send_attempts = attempts;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

impl Default for ManagerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
