use thiserror::Error;
use tokio::task::JoinError;

use crate::ObjectDigest;

/// Errors related to the local object store and its quota index.
#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found")]
    NotFound,

    #[error("integrity error: expected {expected}, got {actual}")]
    Integrity {
        expected: ObjectDigest,
        actual: ObjectDigest,
    },

    #[error("no space left in the cache directory")]
    NoSpace,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            std::io::ErrorKind::StorageFull => Error::NoSpace,
            std::io::ErrorKind::InvalidInput => Error::InvalidRequest(value.to_string()),
            _ => Error::StorageError(value.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound => Self::new(std::io::ErrorKind::NotFound, "object not found"),
            Error::Integrity { .. } => Self::new(std::io::ErrorKind::InvalidData, value.to_string()),
            Error::NoSpace => Self::new(std::io::ErrorKind::StorageFull, value.to_string()),
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::StorageError(msg) => Self::new(std::io::ErrorKind::Other, msg),
        }
    }
}
