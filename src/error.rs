//! Error types and handling for Sinapsi
//!
//! Transport failures are always recoverable: they flip the connection state
//! and drive the reconnect path. Decode failures fail a single read cycle.
//! Configuration failures disable the affected component.

use thiserror::Error;

/// Result type alias for Sinapsi operations
pub type Result<T> = std::result::Result<T, SinapsiError>;

/// Main error type for Sinapsi
///
/// Cloneable so that a single failed shared read can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum SinapsiError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Modbus transport or protocol errors
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Connect or operation timed out
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Operation could not obtain a live connection
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// Connection manager is shutting down
    #[error("Shutdown: {message}")]
    Shutdown { message: String },

    /// Register decoding errors
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl SinapsiError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        SinapsiError::Config {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        SinapsiError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        SinapsiError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new not-connected error
    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        SinapsiError::NotConnected {
            message: message.into(),
        }
    }

    /// Create a new shutdown error
    pub fn shutdown<S: Into<String>>(message: S) -> Self {
        SinapsiError::Shutdown {
            message: message.into(),
        }
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        SinapsiError::Decode {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        SinapsiError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        SinapsiError::Io {
            message: message.into(),
        }
    }

    /// Whether this error belongs to the transport class and forces a reconnect
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SinapsiError::Modbus { .. }
                | SinapsiError::Timeout { .. }
                | SinapsiError::NotConnected { .. }
                | SinapsiError::Shutdown { .. }
        )
    }

    /// Whether the error text reports a timeout, used for the short status text
    pub fn is_timeout(&self) -> bool {
        matches!(self, SinapsiError::Timeout { .. })
            || self.to_string().to_lowercase().contains("timed out")
    }
}

impl From<std::io::Error> for SinapsiError {
    fn from(err: std::io::Error) -> Self {
        SinapsiError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for SinapsiError {
    fn from(err: serde_yaml::Error) -> Self {
        SinapsiError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SinapsiError {
    fn from(err: serde_json::Error) -> Self {
        SinapsiError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tokio_modbus::Error> for SinapsiError {
    fn from(err: tokio_modbus::Error) -> Self {
        SinapsiError::modbus(err.to_string())
    }
}

impl From<tokio_modbus::ExceptionCode> for SinapsiError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        SinapsiError::modbus(format!("device exception: {:?}", code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SinapsiError::config("test config error");
        assert!(matches!(err, SinapsiError::Config { .. }));

        let err = SinapsiError::modbus("test modbus error");
        assert!(matches!(err, SinapsiError::Modbus { .. }));

        let err = SinapsiError::validation("field", "test validation error");
        assert!(matches!(err, SinapsiError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = SinapsiError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = SinapsiError::validation("device.host", "cannot be empty");
        assert_eq!(
            format!("{}", err),
            "Validation error: device.host - cannot be empty"
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(SinapsiError::modbus("broken pipe").is_transport());
        assert!(SinapsiError::timeout("Connect timed out").is_transport());
        assert!(SinapsiError::not_connected("no link").is_transport());
        assert!(!SinapsiError::decode("short").is_transport());
        assert!(!SinapsiError::config("bad").is_transport());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(SinapsiError::timeout("Connect timed out").is_timeout());
        assert!(SinapsiError::modbus("read Timed Out after 1s").is_timeout());
        assert!(!SinapsiError::modbus("connection refused").is_timeout());
    }
}
