//! Error types for robustsession
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for robustsession operations
///
/// This enum encompasses all possible errors that can occur while
/// discovering the server set, creating a session, and exchanging
/// messages with a RobustIRC network.
#[derive(Error, Debug)]
pub enum RobustSessionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// DNS SRV resolution errors
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// A target was requested for a network address that was never resolved
    #[error("Network {0} has not been resolved")]
    NotResolved(String),

    /// Session-level protocol errors (bad CreateSession response, invalid
    /// session auth token, ...)
    #[error("Session error: {0}")]
    Session(String),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for robustsession operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = RobustSessionError::Config("empty address".to_string());
        assert_eq!(error.to_string(), "Configuration error: empty address");
    }

    #[test]
    fn test_resolve_error_display() {
        let error = RobustSessionError::Resolve("SRV lookup timed out".to_string());
        assert_eq!(error.to_string(), "Resolve error: SRV lookup timed out");
    }

    #[test]
    fn test_not_resolved_error_display() {
        let error = RobustSessionError::NotResolved("robustirc.net".to_string());
        assert_eq!(
            error.to_string(),
            "Network robustirc.net has not been resolved"
        );
    }

    #[test]
    fn test_session_error_display() {
        let error = RobustSessionError::Session("Sessionid not found".to_string());
        assert_eq!(error.to_string(), "Session error: Sessionid not found");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_str = "{invalid json}";
        let json_error = serde_json::from_str::<serde_json::Value>(json_str).unwrap_err();
        let error: RobustSessionError = json_error.into();
        assert!(matches!(error, RobustSessionError::Serialization(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "no resolv.conf");
        let error: RobustSessionError = io_error.into();
        assert!(matches!(error, RobustSessionError::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RobustSessionError>();
    }

    #[test]
    fn test_error_propagation() {
        fn failing_function() -> crate::error::Result<()> {
            Err(anyhow::anyhow!(RobustSessionError::NotResolved(
                "example.net".to_string()
            )))
        }

        let result = failing_function();
        assert!(result.is_err());
    }
}
