//! Upward callback surface the pool invokes on lifecycle transitions.

use skiff_common::VmId;
use std::fmt;

/// Why a VM process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Explicit `stop_process` call.
    Stopped,
    /// The agent refused the workload; the VM was returned to Stopping.
    DeployRejected,
    /// The guest never handshaked within the deadline.
    HandshakeTimeout,
    /// Pool-wide teardown.
    PoolShutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Stopped => write!(f, "stopped"),
            ExitReason::DeployRejected => write!(f, "deploy rejected"),
            ExitReason::HandshakeTimeout => write!(f, "handshake timeout"),
            ExitReason::PoolShutdown => write!(f, "pool shutdown"),
        }
    }
}

/// Callbacks the pool manager fires on lifecycle transitions.
///
/// Implementers bridge to metrics, control APIs, and the agent-client
/// registry. Callbacks must not block; the pool dispatches them onto
/// their own tasks.
pub trait ProcessDelegate: Send + Sync + 'static {
    /// A VM booted and was registered with the pool.
    fn on_process_started(&self, vm_id: VmId);

    /// A VM was stopped and fully released.
    fn on_process_exited(&self, vm_id: VmId, reason: ExitReason);
}
