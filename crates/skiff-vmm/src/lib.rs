//! # skiff-vmm
//!
//! The external VMM collaborator, specified at its interface: a
//! [`VmmDriver`] launches and terminates micro-VMs addressed by `VmId`.
//!
//! Two drivers are provided:
//! - [`FirecrackerDriver`] boots real Firecracker micro-VMs through
//!   firepilot and installs per-VM boot metadata via MMDS.
//! - [`NoSandboxDriver`] backs the `no_sandbox` configuration: no VMM is
//!   spawned and the core keeps addressing "VMs" by `vm_id`.

mod driver;
mod error;
mod firecracker;

pub use driver::{LaunchedVm, MachineSpec, NetworkSpec, NoSandboxDriver, VmmDriver};
pub use error::{Result, VmError};
pub use firecracker::{FirecrackerConfig, FirecrackerDriver};
