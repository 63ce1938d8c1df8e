//! Error types for transport operations.

use thiserror::Error;

/// Error type for every fallible transport operation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Receipt handle invalid or expired: {receipt}")]
    ReceiptInvalid { receipt: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Publish failed after {attempts} attempts: {source}")]
    PublishExhausted {
        attempts: u32,
        #[source]
        source: Box<TransportError>,
    },

    #[error("Background task failed: {message}")]
    TaskFailed { message: String },

    #[error("Response could not be decoded: {message}")]
    Decode { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl TransportError {
    /// Check if error is transient and worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::TopicNotFound { .. } => false,
            Self::ReceiptInvalid { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true,
            Self::PublishExhausted { .. } => false,
            Self::TaskFailed { .. } => false,
            Self::Decode { .. } => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }
}

impl From<tokio::task::JoinError> for TransportError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::TaskFailed {
            message: e.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(e: config::ConfigError) -> Self {
        Self::Parsing {
            message: e.to_string(),
        }
    }
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
