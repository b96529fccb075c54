//! Configuration management for the task grid driver core
//!
//! This module handles all configuration settings. Values come from built-in
//! defaults, then an optional TOML file, then `TASKGRID_*` environment
//! variables; the binary applies its command line flags last.

use crate::core::error::{BalancerError, Error, Result, SerializationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "taskgrid.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Load-balancing configuration
    #[serde(default)]
    pub balancing: BalancingConfig,

    /// Class-loading channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Deferred action scheduling
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Metrics and monitoring
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Load-balancing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalancingConfig {
    /// Name of the bundling algorithm (manual, nodethreads, proportional, autotuned, rl)
    pub algorithm: String,

    /// Name of the parameter profile to use from `profiles`
    pub profile: String,

    /// System-wide bundle size ceiling until the dispatch layer publishes one
    pub max_bundle_size: usize,

    /// Named parameter tables, one per profile
    #[serde(default)]
    pub profiles: BTreeMap<String, TypedProperties>,

    /// Directory where bundler states survive node reconnections; disabled when unset
    #[serde(default)]
    pub persistence_dir: Option<PathBuf>,
}

/// Class-loading channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Maximum frame size accepted or produced on a channel (bytes)
    pub max_message_size: usize,

    /// Pending request count above which a context logs a warning
    pub pending_warning_threshold: usize,
}

/// Deferred action scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Thread name of the schedule executor
    pub executor_name: String,

    /// Expiration applied to jobs that do not carry their own
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub default_expiration: Duration,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    pub enable_prometheus: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "default".to_string(),
            TypedProperties::new()
                .set_int("performanceCacheSize", 3000)
                .set_int("proportionalityFactor", 2)
                .set_int("initialSize", 1)
                .set_float("initialMeanTime", 1e9),
        );
        Self {
            algorithm: "proportional".to_string(),
            profile: "default".to_string(),
            max_bundle_size: 300,
            profiles,
            persistence_dir: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024, // 16MB
            pending_warning_threshold: 1000,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            executor_name: "job-expiration".to_string(),
            default_expiration: Duration::from_secs(30),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_prometheus: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl BalancingConfig {
    /// Parameters of the active profile, empty when the profile is not defined
    pub fn active_profile(&self) -> TypedProperties {
        self.profiles.get(&self.profile).cloned().unwrap_or_default()
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Try to load from config file first
        if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() {
            config = Self::from_file(DEFAULT_CONFIG_FILE)?;
        }

        // Override with environment variables
        config.apply_env_overrides()?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Ok(toml::from_str(&contents).map_err(SerializationError::from)?)
    }

    /// Apply `TASKGRID_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, using the environment variable names
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Balancing overrides
        if let Some(algorithm) = lookup("TASKGRID_ALGORITHM") {
            self.balancing.algorithm = algorithm;
        }

        if let Some(profile) = lookup("TASKGRID_PROFILE") {
            self.balancing.profile = profile;
        }

        if let Some(max) = lookup("TASKGRID_MAX_BUNDLE_SIZE") {
            self.balancing.max_bundle_size = max
                .parse()
                .map_err(|e| Error::config(format!("Invalid max bundle size: {}", e)))?;
        }

        if let Some(dir) = lookup("TASKGRID_PERSISTENCE_DIR") {
            self.balancing.persistence_dir = (!dir.trim().is_empty()).then(|| PathBuf::from(dir));
        }

        // Channel overrides
        if let Some(size) = lookup("TASKGRID_MAX_MESSAGE_SIZE") {
            self.channel.max_message_size = size
                .parse()
                .map_err(|e| Error::config(format!("Invalid max message size: {}", e)))?;
        }

        if let Some(expiration) = lookup("TASKGRID_DEFAULT_EXPIRATION") {
            self.schedule.default_expiration = parse_duration(&expiration)
                .map_err(|e| Error::config(format!("Invalid default expiration: {}", e)))?;
        }

        // Logging overrides
        if let Some(level) = lookup("TASKGRID_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("TASKGRID_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.balancing.algorithm.trim().is_empty() {
            return Err(Error::config("Load-balancing algorithm must not be empty"));
        }

        if self.balancing.max_bundle_size == 0 {
            return Err(Error::config("Max bundle size must be at least 1"));
        }

        if self.channel.max_message_size < 1024 {
            return Err(Error::config("Max message size too small (minimum 1KB)"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            _ => return Err(Error::config("Invalid log format (expected pretty or compact)")),
        }

        Ok(())
    }
}

/// Generic key/value parameters of a load-balancing profile.
///
/// Values may be written as TOML integers, floats or strings; getters convert
/// them and report a descriptive profile error when they cannot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedProperties(toml::Table);

impl TypedProperties {
    /// Empty property set
    pub fn new() -> Self {
        Self(toml::Table::new())
    }

    /// Builder-style integer setter
    pub fn set_int(mut self, key: &str, value: i64) -> Self {
        self.0.insert(key.to_string(), toml::Value::Integer(value));
        self
    }

    /// Builder-style float setter
    pub fn set_float(mut self, key: &str, value: f64) -> Self {
        self.0.insert(key.to_string(), toml::Value::Float(value));
        self
    }

    /// Builder-style string setter
    pub fn set_str(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), toml::Value::String(value.to_string()));
        self
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Read a non-negative integer, falling back to `default` when absent
    pub fn get_usize(&self, key: &str, default: usize) -> std::result::Result<usize, BalancerError> {
        match self.0.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(i)) if *i >= 0 => Ok(*i as usize),
            Some(toml::Value::Integer(i)) => Err(BalancerError::invalid_profile(
                key,
                format!("expected a non-negative integer, got {}", i),
            )),
            Some(toml::Value::String(s)) => s.trim().parse().map_err(|_| {
                BalancerError::invalid_profile(key, format!("'{}' is not a non-negative integer", s))
            }),
            Some(other) => Err(BalancerError::invalid_profile(
                key,
                format!("expected an integer, got {}", other.type_str()),
            )),
        }
    }

    /// Read a floating-point value, falling back to `default` when absent
    pub fn get_f64(&self, key: &str, default: f64) -> std::result::Result<f64, BalancerError> {
        match self.0.get(key) {
            None => Ok(default),
            Some(toml::Value::Float(f)) => Ok(*f),
            Some(toml::Value::Integer(i)) => Ok(*i as f64),
            Some(toml::Value::String(s)) => s.trim().parse().map_err(|_| {
                BalancerError::invalid_profile(key, format!("'{}' is not a number", s))
            }),
            Some(other) => Err(BalancerError::invalid_profile(
                key,
                format!("expected a number, got {}", other.type_str()),
            )),
        }
    }
}

use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

// Custom deserializer for Duration from string
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '30s' or '5m'")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

/// Simple duration parser for common formats (`250ms`, `30s`, `5m`, `2h`, bare seconds)
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        let secs = mins.checked_mul(60).ok_or("Duration overflow")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        let secs = hours.checked_mul(3600).ok_or("Duration overflow")?;
        Ok(Duration::from_secs(secs))
    } else {
        // Try parsing as raw seconds
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}
