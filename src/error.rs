//! Unified error type for the sync engine
//!
//! The variants mirror how failures are handled, not where they occur:
//! `Auth` is fatal for the account, `Connection` is retried, `Fetch` and
//! `Parse` skip a single message, `Index` and `Classify` never block the
//! ingestion loop.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("indexing error: {0}")]
    Index(String),

    #[error("classification error: {0}")]
    Classify(String),

    #[error("shutting down")]
    Shutdown,
}

impl SyncError {
    /// Credential failures must never be retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Connection(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
