// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session configuration.
//!
//! [`SessionConfig`] can be built in code with [`SessionConfig::builder`] or
//! loaded from a JSON file where all durations are given in milliseconds:
//!
//! ```json
//! {
//!   "connect_timeout_ms": 5000,
//!   "subscribe_timeout_ms": 5000,
//!   "inbound_capacity": 500,
//!   "log_capacity": 1000,
//!   "reconnect": { "enabled": true, "max_retries": 10, "initial_delay_ms": 500 }
//! }
//! ```
//!
//! Missing fields take their default values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default bound for connecting to a broker.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for a subscription to be acknowledged.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of inbound messages buffered for a slow consumer.
pub const DEFAULT_INBOUND_CAPACITY: usize = 500;

/// Default number of lines kept by the event log.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for a connection attempt.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Upper bound for a subscription to be acknowledged.
    #[serde(rename = "subscribe_timeout_ms", with = "duration_ms")]
    pub subscribe_timeout: Duration,
    /// Inbound messages buffered before the oldest are dropped.
    pub inbound_capacity: usize,
    /// Lines kept by the event log before the oldest are evicted.
    pub log_capacity: usize,
    /// Behaviour after the broker connection drops.
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Creates a new builder starting from the defaults.
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed input and
    /// [`ConfigError::InvalidValue`] if a capacity is zero.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// same errors as [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Checks that all values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for zero capacities or a backoff
    /// multiplier below 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inbound_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inbound_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "log_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.backoff_multiplier",
                message: format!("{} is below 1.0", self.reconnect.backoff_multiplier),
            });
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use subcon::{ReconnectPolicy, SessionConfig};
///
/// let config = SessionConfig::builder()
///     .connect_timeout(Duration::from_secs(2))
///     .inbound_capacity(100)
///     .reconnect(ReconnectPolicy::disabled())
///     .build();
/// assert_eq!(config.inbound_capacity, 100);
/// ```
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Sets the connection timeout (default: 5 seconds).
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the subscription timeout (default: 5 seconds).
    #[must_use]
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.config.subscribe_timeout = timeout;
        self
    }

    /// Sets the inbound buffer capacity (default: 500). Zero is raised to 1.
    #[must_use]
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity.max(1);
        self
    }

    /// Sets the event log capacity (default: 1000). Zero is raised to 1.
    #[must_use]
    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.config.log_capacity = capacity.max(1);
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Returns the finished configuration.
    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// Policy for re-establishing a dropped broker connection.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use subcon::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::new()
///     .with_max_retries(5)
///     .with_initial_delay(Duration::from_millis(500))
///     .with_max_delay(Duration::from_secs(30));
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Whether automatic reconnection is enabled.
    pub enabled: bool,
    /// Maximum number of retries before giving up (None = infinite).
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for the delay between retries.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: Some(10),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a new reconnection policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a disabled reconnection policy.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Retries forever.
    #[must_use]
    pub fn with_infinite_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay between retries.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given retry attempt (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let multiplier = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));

        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay.as_millis() as f32 * multiplier;

        // Infinite or NaN products saturate to max_delay.
        if !delay_ms.is_finite() {
            return self.max_delay;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Returns true if another retry should be attempted.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && self.max_retries.is_none_or(|max| attempt < max)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::error::millis(*value))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_console_behaviour() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(5));
        assert_eq!(config.inbound_capacity, 500);
        assert_eq!(config.log_capacity, 1000);
        assert!(config.reconnect.enabled);
    }

    #[test]
    fn builder_chain() {
        let config = SessionConfig::builder()
            .connect_timeout(Duration::from_millis(250))
            .subscribe_timeout(Duration::from_millis(750))
            .inbound_capacity(0)
            .log_capacity(20)
            .reconnect(ReconnectPolicy::disabled())
            .build();

        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.subscribe_timeout, Duration::from_millis(750));
        assert_eq!(config.inbound_capacity, 1);
        assert_eq!(config.log_capacity, 20);
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn json_missing_fields_use_defaults() {
        let config =
            SessionConfig::from_json_str(r#"{ "inbound_capacity": 64, "reconnect": { "max_retries": null } }"#)
                .unwrap();
        assert_eq!(config.inbound_capacity, 64);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.reconnect.max_retries, None);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn json_durations_are_milliseconds() {
        let config = SessionConfig::from_json_str(
            r#"{ "connect_timeout_ms": 1500, "reconnect": { "max_delay_ms": 2000 } }"#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn json_rejects_zero_capacity() {
        let err = SessionConfig::from_json_str(r#"{ "log_capacity": 0 }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "log_capacity",
                ..
            }
        ));
    }

    #[test]
    fn json_round_trips_through_serde() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"connect_timeout_ms\":5000"));
        assert_eq!(SessionConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn from_json_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subcon.json");
        std::fs::write(&path, r#"{ "log_capacity": 42 }"#).unwrap();

        let config = SessionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.log_capacity, 42);

        let missing = SessionConfig::from_json_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn should_retry_respects_limits() {
        let policy = ReconnectPolicy::new().with_max_retries(2);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        assert!(ReconnectPolicy::new().with_infinite_retries().should_retry(10_000));
        assert!(!ReconnectPolicy::disabled().should_retry(0));
    }
}
