//! Error types for the file processor.
//!
//! Failures that belong to a single definition file (exceptions while
//! loading, timeouts, crashed workers) are not Rust errors: they travel as
//! [`ImportError`](crate::protocol::ImportError) values inside a
//! [`ParseResult`](crate::protocol::ParseResult) so they can never abort the
//! manager loop.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for processor operations.
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Errors raised by the processor itself.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Configuration rejected before startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Required internal state could not be initialized. Fatal.
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Discovery failure.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed message on the worker channel.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<weft_config::ConfigError> for ProcessorError {
    fn from(err: weft_config::ConfigError) -> Self {
        ProcessorError::InvalidConfig(err.to_string())
    }
}

/// Discovery errors. Scan failures are transient: the previous file set is kept.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Listing a source location failed.
    #[error("Scan of '{path}' failed: {reason}")]
    ScanFailed { path: PathBuf, reason: String },

    /// An include/exclude/ignore pattern does not compile.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Definition could not be encoded for storage.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database location unusable.
    #[error("Cannot open store at '{path}': {reason}")]
    Open { path: PathBuf, reason: String },
}
