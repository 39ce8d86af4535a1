//! Error types for sae-engine
//!
//! Defines engine error types using thiserror for clear error propagation.
//! Superseded operations are not errors: they complete with
//! [`Outcome::Cancelled`](crate::cancel::Outcome) instead.

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration key or value, or configuration not yet set
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audio decoding errors surfaced by the decoder collaborator
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Scratch or output memory could not be reserved
    #[error("Native allocation error: {0}")]
    NativeAllocation(String),

    /// Resampler construction or processing errors
    #[error("Resample error: {0}")]
    Resample(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid request parameter
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that make the owning source handle unusable
    pub fn is_fatal_to_source(&self) -> bool {
        matches!(self, Error::NativeAllocation(_))
    }
}

impl From<sae_common::Error> for Error {
    fn from(err: sae_common::Error) -> Self {
        match err {
            sae_common::Error::Config(msg) => Error::Config(msg),
            sae_common::Error::InvalidInput(msg) => Error::BadRequest(msg),
            sae_common::Error::Json(e) => Error::BadRequest(e.to_string()),
            sae_common::Error::Io(e) => Error::Io(e),
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(err: std::collections::TryReserveError) -> Self {
        Error::NativeAllocation(err.to_string())
    }
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
