//! VM handle: the node's record of one live micro-VM.

use crate::error::{NodeError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use skiff_bus::VmCredentials;
use skiff_common::VmId;
use skiff_proto::DeployRequest;
use skiff_vmm::{LaunchedVm, VmmDriver};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle state of a VM.
///
/// Transitions are monotonic: `Warm → Assigned → Running → Stopping →
/// Gone`, with forward jumps permitted (a warm VM can go straight to
/// `Stopping` during pool teardown). No backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Booted and parked in the warm channel.
    Warm,
    /// Pulled from the channel and stamped with a deploy request.
    Assigned,
    /// Deploy acknowledged; the workload is executing.
    Running,
    /// Teardown has begun.
    Stopping,
    /// Fully released: maps, counters, and subscriptions are gone.
    Gone,
}

impl VmState {
    fn rank(self) -> u8 {
        match self {
            VmState::Warm => 0,
            VmState::Assigned => 1,
            VmState::Running => 2,
            VmState::Stopping => 3,
            VmState::Gone => 4,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Warm => write!(f, "warm"),
            VmState::Assigned => write!(f, "assigned"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Gone => write!(f, "gone"),
        }
    }
}

/// One live micro-VM: identity, guest address, credentials, deploy
/// state, and resource snapshot.
///
/// Owned exclusively by the pool manager from creation through `Gone`.
pub struct VmHandle {
    vm_id: VmId,
    ip: IpAddr,
    credentials: VmCredentials,
    vcpus: u32,
    mem_size_mib: u32,
    driver: Arc<dyn VmmDriver>,
    state: Mutex<VmState>,
    deploy_request: Mutex<Option<DeployRequest>>,
    namespace: Mutex<Option<String>>,
    workload_started_at: Mutex<Option<DateTime<Utc>>>,
    handshake_received: AtomicBool,
    shutdown_started: AtomicBool,
}

impl VmHandle {
    pub(crate) fn new(
        vm_id: VmId,
        launched: &LaunchedVm,
        credentials: VmCredentials,
        driver: Arc<dyn VmmDriver>,
    ) -> Self {
        Self {
            vm_id,
            ip: launched.ip,
            credentials,
            vcpus: launched.vcpus,
            mem_size_mib: launched.mem_size_mib,
            driver,
            state: Mutex::new(VmState::Warm),
            deploy_request: Mutex::new(None),
            namespace: Mutex::new(None),
            workload_started_at: Mutex::new(None),
            handshake_received: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Address the guest uses to reach the internal bus.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Credentials minted for this VM.
    pub fn credentials(&self) -> &VmCredentials {
        &self.credentials
    }

    pub fn vcpus(&self) -> u32 {
        self.vcpus
    }

    pub fn mem_size_mib(&self) -> u32 {
        self.mem_size_mib
    }

    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    /// Advance the state machine. Backward moves are rejected.
    pub(crate) fn advance(&self, next: VmState) -> Result<()> {
        let mut state = self.state.lock();
        if next.rank() <= state.rank() {
            return Err(NodeError::InvalidTransition {
                from: state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::trace!(vm_id = %self.vm_id, from = %state, to = %next, "VM state transition");
        *state = next;
        Ok(())
    }

    /// Stamp the handle with a deploy request, moving Warm→Assigned.
    pub(crate) fn assign(&self, request: &DeployRequest) -> Result<()> {
        self.advance(VmState::Assigned)?;
        *self.deploy_request.lock() = Some(request.clone());
        *self.namespace.lock() = Some(request.namespace.clone());
        *self.workload_started_at.lock() = Some(Utc::now());
        Ok(())
    }

    pub fn deploy_request(&self) -> Option<DeployRequest> {
        self.deploy_request.lock().clone()
    }

    pub fn namespace(&self) -> Option<String> {
        self.namespace.lock().clone()
    }

    pub fn workload_started_at(&self) -> Option<DateTime<Utc>> {
        *self.workload_started_at.lock()
    }

    pub fn handshake_received(&self) -> bool {
        self.handshake_received.load(Ordering::SeqCst)
    }

    /// Set the handshake flag. Returns true the first time only.
    pub(crate) fn mark_handshake_received(&self) -> bool {
        self.handshake_received
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Lame duck: the workload is no longer essential.
    pub(crate) fn clear_essential(&self) {
        if let Some(request) = self.deploy_request.lock().as_mut() {
            request.essential = Some(false);
        }
    }

    /// Terminate the VM through the driver.
    ///
    /// The terminate call runs exactly once; re-entry is a no-op. The
    /// driver bounds slow terminations.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.advance(VmState::Stopping) {
            tracing::trace!(vm_id = %self.vm_id, error = %e, "Shutdown with state already past stopping");
        }
        if let Err(e) = self.driver.terminate(&self.vm_id).await {
            tracing::warn!(vm_id = %self.vm_id, error = %e, "VM termination failed");
        }
    }

    /// Final transition, once every resource referring to this VM has
    /// been released.
    pub(crate) fn mark_gone(&self) {
        if let Err(e) = self.advance(VmState::Gone) {
            tracing::warn!(vm_id = %self.vm_id, error = %e, "Gone transition rejected");
        }
    }
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHandle")
            .field("vm_id", &self.vm_id)
            .field("ip", &self.ip)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_common::WorkloadType;
    use skiff_vmm::NoSandboxDriver;
    use std::collections::HashMap;

    fn handle_with_driver(driver: Arc<NoSandboxDriver>) -> VmHandle {
        let launched = LaunchedVm {
            ip: IpAddr::from([127, 0, 0, 1]),
            vcpus: 1,
            mem_size_mib: 256,
        };
        let credentials = VmCredentials {
            user_jwt: "jwt".to_string(),
            user_seed: "SUAS1".to_string(),
        };
        VmHandle::new(VmId::new(), &launched, credentials, driver)
    }

    fn handle() -> VmHandle {
        handle_with_driver(Arc::new(NoSandboxDriver::new()))
    }

    fn request() -> DeployRequest {
        DeployRequest {
            workload_name: "echo".to_string(),
            namespace: "default".to_string(),
            workload_type: WorkloadType::Elf,
            hash: None,
            total_bytes: 64,
            environment: HashMap::new(),
            essential: Some(true),
        }
    }

    #[test]
    fn test_forward_transitions() {
        let vm = handle();
        assert_eq!(vm.state(), VmState::Warm);
        vm.advance(VmState::Assigned).unwrap();
        vm.advance(VmState::Running).unwrap();
        vm.advance(VmState::Stopping).unwrap();
        vm.advance(VmState::Gone).unwrap();
    }

    #[test]
    fn test_warm_to_stopping_permitted() {
        let vm = handle();
        vm.advance(VmState::Stopping).unwrap();
    }

    #[test]
    fn test_backward_transition_rejected() {
        let vm = handle();
        vm.advance(VmState::Running).unwrap();
        let err = vm.advance(VmState::Assigned).unwrap_err();
        assert!(matches!(err, NodeError::InvalidTransition { .. }));
        // Same-state moves are also rejected.
        assert!(vm.advance(VmState::Running).is_err());
    }

    #[test]
    fn test_assign_stamps_handle() {
        let vm = handle();
        vm.assign(&request()).unwrap();
        assert_eq!(vm.state(), VmState::Assigned);
        assert_eq!(vm.namespace().as_deref(), Some("default"));
        assert!(vm.workload_started_at().is_some());
        assert_eq!(vm.deploy_request().unwrap().workload_name, "echo");
    }

    #[test]
    fn test_clear_essential() {
        let vm = handle();
        vm.assign(&request()).unwrap();
        vm.clear_essential();
        assert_eq!(vm.deploy_request().unwrap().essential, Some(false));
    }

    #[test]
    fn test_handshake_flag_set_once() {
        let vm = handle();
        assert!(!vm.handshake_received());
        assert!(vm.mark_handshake_received());
        assert!(!vm.mark_handshake_received());
        assert!(vm.handshake_received());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_exactly_once() {
        let driver = Arc::new(NoSandboxDriver::new());
        let vm = handle_with_driver(Arc::clone(&driver));
        let vm_id = vm.vm_id();

        vm.shutdown().await;
        vm.shutdown().await;
        assert_eq!(driver.terminate_count(&vm_id), 1);
        assert_eq!(vm.state(), VmState::Stopping);
    }
}
