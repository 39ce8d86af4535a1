//! Common error types for the streaming audio engine

use thiserror::Error;

/// Common result type for shared protocol and configuration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the engine and its consumers
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration key or value rejected during validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed transport message (wraps serde_json::Error)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
