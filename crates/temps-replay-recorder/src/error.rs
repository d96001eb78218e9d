//! Replay recorder error types

use thiserror::Error;

pub type ReplayResult<T> = Result<T, ReplayError>;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failures reported by a [`ReplayTransport`](crate::transport::ReplayTransport).
///
/// The controller never retries on these; it logs them and leaves the
/// segment in the buffer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Collector rejected segment with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to encode segment: {0}")]
    Encoding(String),

    #[error("Failed to serialize request: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Http(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Encoding(err.to_string())
    }
}
