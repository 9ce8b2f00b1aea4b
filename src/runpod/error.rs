//! Error types for the serverless REST backend.

use crate::backend::BackendError;
use crate::config::ConfigError;
use thiserror::Error;

/// Errors raised by the serverless REST backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunpodError {
    /// Raised when the credential or other configuration is missing.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when a volume request is below the provider minimum.
    #[error("network volume size {requested} GB is below the {minimum} GB minimum")]
    VolumeTooSmall {
        /// Size requested by the caller.
        requested: u32,
        /// Provider minimum.
        minimum: u32,
    },
    /// Raised when the HTTP request cannot be sent or its body read.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Target URL.
        url: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the provider answers with an unexpected status.
    #[error("provider returned status {status} for {action}: {body}")]
    Api {
        /// Operation being attempted.
        action: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },
    /// Raised when a successful response cannot be parsed.
    #[error("failed to parse {action} response: {message}")]
    Decode {
        /// Operation being attempted.
        action: &'static str,
        /// Parser error message.
        message: String,
    },
}

impl From<BackendError> for RunpodError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
            BackendError::VolumeTooSmall { requested, minimum } => {
                Self::VolumeTooSmall { requested, minimum }
            }
        }
    }
}

impl From<ConfigError> for RunpodError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
