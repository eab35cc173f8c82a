//! The driver trait and the no-sandbox implementation.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use skiff_common::VmId;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

/// Resource and image shape for one micro-VM.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    /// Path to the kernel image.
    pub kernel_path: PathBuf,
    /// Path to the root filesystem image.
    pub rootfs_path: PathBuf,
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Memory size in MiB.
    pub mem_size_mib: u32,
    /// Optional network attachment.
    pub network: Option<NetworkSpec>,
}

/// Network attachment for one micro-VM.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    /// Interface ID inside the guest.
    pub iface_id: String,
    /// Host-side tap device name.
    pub host_dev_name: String,
    /// Optional fixed guest MAC.
    pub guest_mac: Option<String>,
}

/// A booted micro-VM as reported by the driver.
#[derive(Debug, Clone)]
pub struct LaunchedVm {
    /// Guest address on the private interface.
    pub ip: IpAddr,
    /// vCPUs actually allocated.
    pub vcpus: u32,
    /// Memory actually allocated, in MiB.
    pub mem_size_mib: u32,
}

/// The external VMM collaborator, specified at its interface.
///
/// Implementations own process spawn, network attach, and jailing;
/// the core only launches, terminates, and addresses VMs by `vm_id`.
#[async_trait]
pub trait VmmDriver: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &str;

    /// Create and boot a VM with the given boot-time metadata embedded.
    async fn launch(
        &self,
        vm_id: VmId,
        spec: &MachineSpec,
        metadata: &serde_json::Value,
    ) -> Result<LaunchedVm>;

    /// Terminate a VM. Idempotent: terminating an unknown or
    /// already-terminated VM succeeds. Slow termination is bounded by
    /// the driver.
    async fn terminate(&self, vm_id: &VmId) -> Result<()>;

    /// Reset host-side networking state left over from prior runs.
    /// Drivers without network state treat this as a no-op.
    async fn reset_networks(&self) -> Result<()> {
        Ok(())
    }
}

/// Driver used when `no_sandbox` is set: nothing is spawned, the guest
/// is expected to run in-process (tests) or out-of-band.
#[derive(Debug, Default)]
pub struct NoSandboxDriver {
    launched: Mutex<HashMap<VmId, serde_json::Value>>,
    terminations: Mutex<HashMap<VmId, u32>>,
}

impl NoSandboxDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boot metadata recorded for a launched VM.
    ///
    /// In-process guests read their connection seed from here, the way
    /// a real guest reads MMDS.
    pub fn metadata_for(&self, vm_id: &VmId) -> Option<serde_json::Value> {
        self.launched.lock().get(vm_id).cloned()
    }

    /// IDs of every VM launched through this driver.
    pub fn launched_ids(&self) -> Vec<VmId> {
        self.launched.lock().keys().copied().collect()
    }

    /// How many times `terminate` ran for a VM.
    pub fn terminate_count(&self, vm_id: &VmId) -> u32 {
        self.terminations.lock().get(vm_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl VmmDriver for NoSandboxDriver {
    fn name(&self) -> &str {
        "no-sandbox"
    }

    async fn launch(
        &self,
        vm_id: VmId,
        spec: &MachineSpec,
        metadata: &serde_json::Value,
    ) -> Result<LaunchedVm> {
        self.launched.lock().insert(vm_id, metadata.clone());
        tracing::debug!(vm_id = %vm_id, "Launched sandboxless VM");
        Ok(LaunchedVm {
            ip: IpAddr::from([127, 0, 0, 1]),
            vcpus: spec.vcpu_count,
            mem_size_mib: spec.mem_size_mib,
        })
    }

    async fn terminate(&self, vm_id: &VmId) -> Result<()> {
        *self.terminations.lock().entry(*vm_id).or_insert(0) += 1;
        self.launched.lock().remove(vm_id);
        tracing::debug!(vm_id = %vm_id, "Terminated sandboxless VM");
        Ok(())
    }
}
