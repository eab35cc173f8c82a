//! Error types for skiff-vmm.

use thiserror::Error;

/// Result type alias for VMM driver operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur during VM lifecycle operations.
#[derive(Debug, Error)]
pub enum VmError {
    /// Failed to create the VM
    #[error("failed to create VM: {0}")]
    Create(String),

    /// Failed to start the VM
    #[error("failed to start VM: {0}")]
    Start(String),

    /// Failed to stop the VM
    #[error("failed to stop VM: {0}")]
    Stop(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to install boot metadata
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Firecracker/firepilot error
    #[error("firepilot error: {0}")]
    Firepilot(String),

    /// The driver has no free guest addresses left
    #[error("address pool exhausted in {0}")]
    AddressExhausted(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
