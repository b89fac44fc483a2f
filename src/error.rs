//! Error types and handling for evtelemetry
//!
//! Decode failures never show up here: a response that cannot be decoded is
//! represented as a NaN sample. These errors cover transport, provider,
//! configuration and persistence operations.

use thiserror::Error;

/// Result type alias for evtelemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Main error type for evtelemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Adapter transport errors (link down, write failed, closed)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Data source lifecycle errors
    #[error("Data source error: {message}")]
    Source { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Vehicle-info API errors
    #[error("API error: {message}")]
    Api { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },
}

impl TelemetryError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        TelemetryError::Config {
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        TelemetryError::Transport {
            message: message.into(),
        }
    }

    /// Create a new data source error
    pub fn source<S: Into<String>>(message: S) -> Self {
        TelemetryError::Source {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        TelemetryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        TelemetryError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        TelemetryError::Network {
            message: message.into(),
        }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        TelemetryError::Api {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        TelemetryError::Timeout {
            message: message.into(),
        }
    }

    /// Whether the error means the link to the data source is gone
    pub fn is_connection_error(&self) -> bool {
        match self {
            TelemetryError::Transport { message } => {
                let msg = message.to_lowercase();
                msg.contains("closed") || msg.contains("disconnected") || msg.contains("not open")
            }
            TelemetryError::Timeout { .. } | TelemetryError::Network { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for TelemetryError {
    fn from(err: std::io::Error) -> Self {
        TelemetryError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for TelemetryError {
    fn from(err: serde_yaml::Error) -> Self {
        TelemetryError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        TelemetryError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "cloud")]
impl From<reqwest::Error> for TelemetryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TelemetryError::timeout(err.to_string())
        } else {
            TelemetryError::network(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for TelemetryError {
    fn from(err: chrono::ParseError) -> Self {
        TelemetryError::validation("datetime", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TelemetryError::config("test config error");
        assert!(matches!(err, TelemetryError::Config { .. }));

        let err = TelemetryError::transport("test transport error");
        assert!(matches!(err, TelemetryError::Transport { .. }));

        let err = TelemetryError::validation("field", "test validation error");
        assert!(matches!(err, TelemetryError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = TelemetryError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = TelemetryError::validation("test_field", "invalid value");
        assert_eq!(
            format!("{}", err),
            "Validation error: test_field - invalid value"
        );
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(TelemetryError::timeout("read").is_connection_error());
        assert!(TelemetryError::transport("link closed").is_connection_error());
        assert!(!TelemetryError::transport("bad echo").is_connection_error());
        assert!(!TelemetryError::config("x").is_connection_error());
    }
}
