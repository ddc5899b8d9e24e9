//! # Error Types
//!
//! Unified error taxonomy for the engine. HTTP status mapping lives with the
//! control API; backends and loops only deal in these variants.

use thiserror::Error;

/// Engine-wide result type
pub type XjobResult<T> = Result<T, XjobError>;

/// Error taxonomy shared by the backend, the orchestrator and the control API
#[derive(Debug, Error)]
pub enum XjobError {
    /// A module rejected its configuration
    #[error("Bad options: {0}")]
    BadOptions(String),

    /// No module registered for the requested job type
    #[error("Unknown job type: {0}")]
    UnknownType(String),

    /// No such job id
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Illegal job state transition
    #[error("Bad state: {0}")]
    BadState(String),

    /// Job id collision on create
    #[error("Job already exists: {0}")]
    Conflict(String),

    /// No worker tube discoverable or the bus is unreachable
    #[error("Message bus unavailable: {0}")]
    BusUnavailable(String),

    /// Unrecoverable error while iterating a module's task stream
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    /// Persistent backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration loading or validation failure
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl XjobError {
    /// Create a `BadOptions` error
    pub fn bad_options(message: impl Into<String>) -> Self {
        Self::BadOptions(message.into())
    }

    /// Create a `BadState` error from an observed status
    pub fn bad_state(message: impl Into<String>) -> Self {
        Self::BadState(message.into())
    }

    /// Create a `Backend` error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a `BusUnavailable` error
    pub fn bus_unavailable(message: impl Into<String>) -> Self {
        Self::BusUnavailable(message.into())
    }

    /// Create a `DispatchFailed` error
    pub fn dispatch_failed(message: impl Into<String>) -> Self {
        Self::DispatchFailed(message.into())
    }
}

impl From<redis::RedisError> for XjobError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<config::ConfigError> for XjobError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_bad_options() {
        let err = XjobError::bad_options("error_percentage over 100");
        assert_eq!(format!("{err}"), "Bad options: error_percentage over 100");
    }

    #[test]
    fn test_display_not_found() {
        let err = XjobError::NotFound("20190701120000000000-0000000000A".to_string());
        assert!(format!("{err}").starts_with("Job not found: 2019"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        let err: XjobError = json_err.into();
        assert!(matches!(err, XjobError::Serialization(_)));
    }

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(
            XjobError::bus_unavailable("no tube"),
            XjobError::BusUnavailable(_)
        ));
        assert!(matches!(
            XjobError::dispatch_failed("stream broke"),
            XjobError::DispatchFailed(_)
        ));
        assert!(matches!(
            XjobError::backend("redis down"),
            XjobError::Backend(_)
        ));
    }
}
