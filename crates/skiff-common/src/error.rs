//! Error types shared across the skiff node platform.

use crate::types::VmId;
use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared across the skiff crates.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration; fatal at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A VM with the given ID is not known to the node.
    #[error("process not found: {0}")]
    NotFound(VmId),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition.
    ///
    /// Not-found is surfaced to callers but not logged as an error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
