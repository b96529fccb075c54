//! Error types and handling for the task grid core
//!
//! This module defines all error types used throughout the system. Statistical
//! anomalies in the load balancer are absorbed locally and never show up here;
//! what remains are configuration mistakes, transport failures and scheduling
//! problems.

use thiserror::Error;

use crate::core::types::ChannelId;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the task grid
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Load-balancing errors
    #[error("Load balancing error: {0}")]
    Balancer(#[from] BalancerError),

    /// Class-loading channel errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Deferred action scheduling errors
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Network communication errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Load-balancing errors
#[derive(Error, Debug)]
pub enum BalancerError {
    /// No bundler provider is registered under this algorithm name
    #[error("Unknown load-balancing algorithm: {0}")]
    UnknownAlgorithm(String),

    /// A profile parameter failed validation
    #[error("Invalid value for profile parameter '{param}': {reason}")]
    InvalidProfile {
        /// Name of the offending parameter
        param: String,
        /// Why the value was rejected
        reason: String,
    },

    /// No bundler is attached to this channel
    #[error("No bundler attached to channel {0}")]
    UnknownChannel(ChannelId),

    /// A bundler is already attached to this channel
    #[error("A bundler is already attached to channel {0}")]
    ChannelAlreadyAttached(ChannelId),
}

/// Class-loading channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// A response arrived that matches no pending request
    #[error("Unexpected response for resource '{name}' (id {id})")]
    UnexpectedResponse {
        /// Resource name carried by the response
        name: String,
        /// Request identifier carried by the response
        id: String,
    },

    /// No provider connection is registered for this uuid
    #[error("No provider connection for uuid {0}")]
    NoProvider(String),
}

/// Deferred action scheduling errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The handler's executor has been shut down
    #[error("Schedule handler '{0}' has been shut down")]
    Shutdown(String),

    /// A date string did not match its format
    #[error("Unparseable date '{date}' with format '{format}': {source}")]
    InvalidDate {
        /// The date string
        date: String,
        /// The chrono format string
        format: String,
        /// Underlying parse failure
        #[source]
        source: chrono::ParseError,
    },

    /// The executor could not be created
    #[error("Failed to start executor: {0}")]
    Executor(String),
}

/// Network communication errors
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge {
        /// Actual message size in bytes
        size: usize,
        /// Maximum allowed message size in bytes
        max_size: usize,
    },
}

/// Serialization/deserialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bincode serialization error
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    /// TOML decode error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this is a retryable error. A missing provider may connect
    /// later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::NoProvider(_)) | Error::Io(_))
    }

    /// Check if this error stems from bad configuration, which is never
    /// recoverable at runtime
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Balancer(BalancerError::UnknownAlgorithm(_))
                | Error::Balancer(BalancerError::InvalidProfile { .. })
                | Error::Schedule(ScheduleError::InvalidDate { .. })
                | Error::Serialization(SerializationError::Toml(_))
        )
    }
}

impl BalancerError {
    /// Create an invalid profile parameter error
    pub fn invalid_profile(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            param: param.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err: Error = BalancerError::invalid_profile("size", "must be positive").into();
        assert!(err.is_configuration_error());
        assert!(!err.is_retryable());

        let err: Error = ChannelError::NoProvider("p".to_string()).into();
        assert!(err.is_retryable());
        assert!(!err.is_configuration_error());

        let err: Error = NetworkError::Protocol("bad frame".to_string()).into();
        assert!(!err.is_retryable());

        let err: Error = SerializationError::from(
            toml::from_str::<toml::Table>("balancing = [").unwrap_err(),
        )
        .into();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_error_messages() {
        let err = BalancerError::invalid_profile("proportionalityFactor", "must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid value for profile parameter 'proportionalityFactor': must be > 0"
        );

        let err = NetworkError::MessageTooLarge { size: 10, max_size: 4 };
        assert_eq!(err.to_string(), "Message too large: 10 bytes (max: 4)");
    }
}
