//! Error taxonomy for the monitor core.
//!
//! Every fallible library operation returns [`MonitorError`]. Batch
//! operations catch these per document and report them in their status map;
//! single-document operations hand them straight back to the caller.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The remote page could not be fetched, timed out, or the configured
    /// selector did not match anything.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A document, snapshot, or diff does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A snapshot already exists at that timestamp, or the timestamp would
    /// break the strictly increasing history.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The summarizer failed or returned nothing usable.
    #[error("summarization failed: {0}")]
    Summarization(String),

    /// Malformed configuration or document list.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The blob store could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// A caller-supplied selector, scope, or identifier is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl MonitorError {
    /// Stable machine-readable code, used in HTTP error bodies and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            MonitorError::Fetch(_) => "fetch_error",
            MonitorError::NotFound(_) => "not_found",
            MonitorError::Conflict(_) => "conflict",
            MonitorError::Summarization(_) => "summarization_error",
            MonitorError::Config(_) => "config_error",
            MonitorError::Storage(_) => "storage_error",
            MonitorError::InvalidInput(_) => "bad_request",
        }
    }

    pub(crate) fn storage(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        MonitorError::Storage(format!("{}: {}", context, err))
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::Storage(format!("malformed JSON record: {}", err))
    }
}
