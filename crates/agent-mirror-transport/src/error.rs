//! Transport error types.

use thiserror::Error;

/// Failures reported through the transport's error event.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

impl TransportError {
    /// Diagnostic text recorded by the store.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}
