//! Error types for docpacer.

use thiserror::Error;

/// Main error type for docpacer operations.
#[derive(Error, Debug)]
pub enum DocpacerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No Tokio runtime was available to host the dispatcher worker
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// A transmission could not be completed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// HTTP client construction errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A payload could not be turned into a request body.
///
/// This is terminal for the item: it is dropped and never retried.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SerializationError(pub String);

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError(err.to_string())
    }
}

/// Reasons a transmission failed before a status code was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("transport panicked")]
    Panicked,
}

/// Result type alias for docpacer operations.
pub type Result<T> = std::result::Result<T, DocpacerError>;
