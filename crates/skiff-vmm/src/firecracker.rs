//! Firecracker driver built on firepilot.
//!
//! Boot metadata is installed via a direct `PUT /mmds` on the
//! Firecracker API socket, since firepilot's high-level API doesn't
//! expose the metadata service.

use crate::driver::{LaunchedVm, MachineSpec, VmmDriver};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use firepilot::builder::drive::DriveBuilder;
use firepilot::builder::executor::FirecrackerExecutorBuilder;
use firepilot::builder::kernel::KernelBuilder;
use firepilot::builder::network_interface::NetworkInterfaceBuilder;
use firepilot::builder::{Builder, Configuration};
use firepilot::machine::Machine;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use parking_lot::Mutex;
use skiff_common::VmId;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on a single termination call.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Host-side settings for the Firecracker driver.
#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,
    /// Working directory for per-VM sockets and state.
    pub chroot_path: PathBuf,
    /// Kernel boot arguments.
    pub boot_args: String,
    /// Subnet guests are addressed from, e.g. `192.168.127.0/24`.
    pub cni_subnet: String,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/bin/firecracker"),
            chroot_path: PathBuf::from("/tmp/skiff"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            cni_subnet: "192.168.127.0/24".to_string(),
        }
    }
}

/// Boots Firecracker micro-VMs and addresses them on the private subnet.
pub struct FirecrackerDriver {
    config: FirecrackerConfig,
    machines: Mutex<HashMap<VmId, Machine>>,
    subnet_base: u32,
    subnet_hosts: u32,
    next_host: Mutex<u32>,
}

impl FirecrackerDriver {
    /// Create a driver. Fails when the configured subnet does not parse.
    pub fn new(config: FirecrackerConfig) -> Result<Self> {
        let (subnet_base, prefix_len) = parse_subnet(&config.cni_subnet)?;
        let subnet_hosts = (1u32 << (32 - prefix_len)) - 2;
        Ok(Self {
            config,
            machines: Mutex::new(HashMap::new()),
            subnet_base,
            subnet_hosts,
            // .1 is the node's own address on the private interface.
            next_host: Mutex::new(2),
        })
    }

    fn allocate_ip(&self) -> Result<Ipv4Addr> {
        let mut next = self.next_host.lock();
        if *next > self.subnet_hosts {
            return Err(VmError::AddressExhausted(self.config.cni_subnet.clone()));
        }
        let ip = Ipv4Addr::from(self.subnet_base + *next);
        *next += 1;
        Ok(ip)
    }

    fn socket_path(&self, vm_id: &VmId) -> PathBuf {
        self.config
            .chroot_path
            .join(vm_id.to_string())
            .join("firecracker.socket")
    }
}

#[async_trait]
impl VmmDriver for FirecrackerDriver {
    fn name(&self) -> &str {
        "firecracker"
    }

    async fn launch(
        &self,
        vm_id: VmId,
        spec: &MachineSpec,
        metadata: &serde_json::Value,
    ) -> Result<LaunchedVm> {
        let start = std::time::Instant::now();
        tracing::info!(
            vm_id = %vm_id,
            vcpus = spec.vcpu_count,
            memory_mib = spec.mem_size_mib,
            "Creating micro-VM"
        );

        let kernel = KernelBuilder::new()
            .with_kernel_image_path(spec.kernel_path.to_string_lossy().to_string())
            .with_boot_args(self.config.boot_args.clone())
            .try_build()
            .map_err(|e| VmError::Config(format!("kernel config: {e:?}")))?;

        let drive = DriveBuilder::new()
            .with_drive_id("rootfs".to_string())
            .with_path_on_host(spec.rootfs_path.clone())
            .as_root_device()
            .try_build()
            .map_err(|e| VmError::Config(format!("drive config: {e:?}")))?;

        let executor = FirecrackerExecutorBuilder::new()
            .with_chroot(self.config.chroot_path.to_string_lossy().to_string())
            .with_exec_binary(self.config.firecracker_path.clone())
            .try_build()
            .map_err(|e| VmError::Config(format!("executor config: {e:?}")))?;

        let mut fp_config = Configuration::new(vm_id.to_string())
            .with_kernel(kernel)
            .with_executor(executor)
            .with_drive(drive);

        if let Some(net) = &spec.network {
            let mut net_builder = NetworkInterfaceBuilder::new()
                .with_iface_id(net.iface_id.clone())
                .with_host_dev_name(net.host_dev_name.clone());
            if let Some(mac) = &net.guest_mac {
                net_builder = net_builder.with_guest_mac(mac.clone());
            }
            let iface = net_builder
                .try_build()
                .map_err(|e| VmError::Config(format!("network config: {e:?}")))?;
            fp_config = fp_config.with_interface(iface);
        }

        let mut machine = Machine::new();
        machine
            .create(fp_config)
            .await
            .map_err(|e| VmError::Create(format!("{e:?}")))?;

        // Metadata must be installed before the guest boots and reads it.
        let socket_path = self.socket_path(&vm_id);
        put_mmds(&socket_path, metadata).await?;

        machine
            .start()
            .await
            .map_err(|e| VmError::Start(format!("{e:?}")))?;

        let ip = self.allocate_ip()?;
        self.machines.lock().insert(vm_id, machine);

        tracing::info!(
            vm_id = %vm_id,
            ip = %ip,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Micro-VM started"
        );
        Ok(LaunchedVm {
            ip: ip.into(),
            vcpus: spec.vcpu_count,
            mem_size_mib: spec.mem_size_mib,
        })
    }

    async fn terminate(&self, vm_id: &VmId) -> Result<()> {
        let machine = self.machines.lock().remove(vm_id);
        let Some(mut machine) = machine else {
            tracing::debug!(vm_id = %vm_id, "Terminate on unknown VM, ignoring");
            return Ok(());
        };

        tracing::info!(vm_id = %vm_id, "Terminating micro-VM");
        match tokio::time::timeout(TERMINATE_TIMEOUT, machine.kill()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(VmError::Stop(format!("kill failed: {e:?}"))),
            Err(_) => Err(VmError::Stop(format!(
                "termination exceeded {TERMINATE_TIMEOUT:?}"
            ))),
        }
    }

    async fn reset_networks(&self) -> Result<()> {
        tracing::debug!("Resetting CNI network state");
        let cni_dir = Path::new("/var/lib/cni");
        if let Err(e) = tokio::fs::remove_dir_all(cni_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        tokio::fs::create_dir_all(cni_dir).await?;
        Ok(())
    }
}

/// Install boot metadata on a Firecracker instance via `PUT /mmds`.
async fn put_mmds(socket_path: &Path, metadata: &serde_json::Value) -> Result<()> {
    let body = serde_json::to_string(metadata)
        .map_err(|e| VmError::Metadata(format!("failed to serialize metadata: {e}")))?;

    let uri: hyper::Uri = Uri::new(socket_path, "/mmds").into();
    let request = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .map_err(|e| VmError::Metadata(format!("failed to build mmds request: {e}")))?;

    let client = Client::unix();
    let response = client
        .request(request)
        .await
        .map_err(|e| VmError::Firepilot(format!("mmds request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        let body_str = String::from_utf8_lossy(&body_bytes);
        return Err(VmError::Metadata(format!(
            "mmds install failed with status {status}: {body_str}"
        )));
    }

    tracing::debug!(socket = %socket_path.display(), "Boot metadata installed");
    Ok(())
}

fn parse_subnet(subnet: &str) -> Result<(u32, u32)> {
    let (addr, len) = subnet
        .split_once('/')
        .ok_or_else(|| VmError::Config(format!("invalid subnet: {subnet}")))?;
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| VmError::Config(format!("invalid subnet address: {subnet}")))?;
    let len: u32 = len
        .parse()
        .map_err(|_| VmError::Config(format!("invalid subnet length: {subnet}")))?;
    if !(8..=30).contains(&len) {
        return Err(VmError::Config(format!("invalid subnet length: {subnet}")));
    }
    Ok((u32::from(ip), len))
}
