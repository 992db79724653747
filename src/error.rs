//! Error types and handling for the gateway daemon
//!
//! This module defines the error kinds used throughout the application so
//! that callers can distinguish transient Modbus failures (retried locally)
//! from configuration and validation failures (reported up to the caller).

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway daemon
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration-related errors: missing field, invalid IP, bad HH:MM
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Modbus communication errors: connection, protocol exception frame
    #[error("modbus error: {message}")]
    Modbus { message: String },

    /// Modbus/transport timeouts, distinguished from other connection failures
    /// so the retry wrapper can apply the same backoff without reclassifying.
    #[error("timeout error: {message}")]
    Timeout { message: String },

    /// Object-path publisher errors: unknown path, type mismatch
    #[error("publisher error: {message}")]
    Publisher { message: String },

    /// Validation errors from callback-originated writes
    #[error("validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Persistence errors: disk full, unreadable state file
    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// Serialization/deserialization errors
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic errors with context
    #[error("error: {message}")]
    Generic { message: String },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        GatewayError::Config {
            message: message.into(),
        }
    }

    pub fn modbus<S: Into<String>>(message: S) -> Self {
        GatewayError::Modbus {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        GatewayError::Timeout {
            message: message.into(),
        }
    }

    pub fn publisher<S: Into<String>>(message: S) -> Self {
        GatewayError::Publisher {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        GatewayError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        GatewayError::Persistence {
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        GatewayError::Io {
            message: message.into(),
        }
    }

    pub fn generic<S: Into<String>>(message: S) -> Self {
        GatewayError::Generic {
            message: message.into(),
        }
    }

    /// Whether this failure implies the Modbus connection should be torn
    /// down and reconnected by the control loop (§4.2).
    pub fn is_connection_error(&self) -> bool {
        match self {
            GatewayError::Modbus { message } => {
                let m = message.to_ascii_lowercase();
                m.contains("connection")
                    || m.contains("disconnected")
                    || m.contains("not connected")
            }
            GatewayError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether the retry wrapper (§4.2) should spend one of its attempts
    /// on this failure. Covers the whole `MODBUS` taxonomy (`CONN`,
    /// `PROTOCOL`, `TIMEOUT`) — the wrapper "never swallows non-Modbus
    /// errors (e.g., validation)", so everything else propagates on the
    /// first attempt instead of consuming a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Modbus { .. } | GatewayError::Timeout { .. })
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for GatewayError {
    fn from(err: chrono::ParseError) -> Self {
        GatewayError::validation("datetime", &err.to_string())
    }
}
