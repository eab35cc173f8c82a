//! Error types for the node core.

use skiff_bus::BusError;
use skiff_common::VmId;
use skiff_vmm::VmError;
use thiserror::Error;

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors surfaced by the pool manager and agent clients.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration; fatal at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The warm channel is closed; no VM can be allocated.
    #[error("could not prepare workload, no available VM")]
    NoVmAvailable,

    /// The VM is not registered with the pool.
    #[error("process not found: {0}")]
    NotFound(VmId),

    /// The agent did not acknowledge a dispatch within its deadline.
    #[error("timed out waiting for acknowledgement of workload deployment")]
    DispatchTimeout,

    /// The agent refused the workload.
    #[error("workload rejected by agent: {0}")]
    DispatchRejected(String),

    /// The deploy request names a type this node does not accept.
    #[error("workload type not permitted: {0}")]
    WorkloadTypeNotAllowed(String),

    /// A state change that would move a VM backward.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// State the VM is in
        from: String,
        /// State that was requested
        to: String,
    },

    /// A reply that did not decode as the expected message.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Transport-level failure on the internal bus.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Failure reported by the VMM driver.
    #[error("VMM error: {0}")]
    Vmm(#[from] VmError),
}

impl NodeError {
    /// Not-found conditions are surfaced but not logged as errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NodeError::NotFound(_))
    }
}
