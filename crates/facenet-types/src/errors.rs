//! Error types for the Inception-ResNet V1 workspace

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for model construction, weight loading and the CLI
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum FacenetError {
    /// Configuration errors (invalid selectors, shapes, block tags)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Tensor-level failures reported by the numerical backend
    #[error("Model error: {message}")]
    Model { message: String },

    /// Device selection errors
    #[error("Device error: {message}")]
    Device { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    IO { message: String },

    /// Network errors while fetching artifacts
    #[error("Network error: {message}")]
    Network { message: String },

    /// Downloaded or cached artifact does not match its published hash
    #[error("Hash mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Unsupported operation errors
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    /// Invalid format errors (weight containers, image files)
    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    /// Invalid parameters or configuration values
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FacenetError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a model error
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    /// Create a device error
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a hash mismatch error
    pub fn hash_mismatch(
        file: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::HashMismatch {
            file: file.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an invalid format error
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Alias for config()
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::config(message)
    }

    /// Check if this error was caused by the caller's configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::InvalidParameter { .. } | Self::Unsupported { .. }
        )
    }

    /// Check if retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::HashMismatch { .. })
    }
}

/// Conversion from std::io::Error
impl From<std::io::Error> for FacenetError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for FacenetError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}

impl From<toml::de::Error> for FacenetError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("Failed to parse config: {}", err))
    }
}

impl From<toml::ser::Error> for FacenetError {
    fn from(err: toml::ser::Error) -> Self {
        Self::serialization(format!("Failed to serialize config: {}", err))
    }
}
