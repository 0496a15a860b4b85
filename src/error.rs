use std::time::Duration;
use thiserror::Error;

/// Failures of the message bus transport.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Subscription on {0} failed while draining: {1}")]
    Receive(String, String),

    #[error("Message bus is closed")]
    Closed,

    #[error("Envelope encoding error: {0}")]
    Encoding(String),
}

/// Failures of the metadata and blob stores.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Not found")]
    NotFound,

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Failures of a single capture-and-save run.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Browser instance unavailable")]
    BrowserUnavailable,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Rendered bytes are not a valid {expected} image: {reason}")]
    InvalidImage { expected: String, reason: String },

    #[error("Failed to store blob {blob_id}: {source}")]
    Blob { blob_id: String, source: StoreError },

    #[error("Failed to save screenshot metadata for {url}: {source}")]
    Metadata { url: String, source: StoreError },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

/// Configuration validation failures.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Encoding(err.to_string())
    }
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Connection(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}
