//! Errors of note operations

use thiserror::Error;

use crate::mirror::StoreError;
use crate::remote::RemoteError;

/// Note operation errors
#[derive(Debug, Error)]
pub enum Error {
    /// The remote store could not be reached, always recoverable
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// The note is in neither the remote store nor the local mirror
    #[error("Note not found")]
    NotFound,

    /// Malformed input, rejected before any I/O
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The local mirror could not be written
    #[error("Local storage failed: {0}")]
    Storage(String),

    /// Notes could not be encoded for the local mirror
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound => Error::NotFound,
            err => Error::RemoteUnavailable(err.to_string()),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(err) => Error::Storage(err.to_string()),
            StoreError::Serialization(err) => Error::Serialization(err.to_string()),
        }
    }
}

/// Result type for all note operations
pub type Result<T> = core::result::Result<T, Error>;
