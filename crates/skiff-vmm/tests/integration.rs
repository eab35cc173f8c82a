//! Integration tests for the Firecracker driver.
//!
//! These tests require:
//! - Linux with /dev/kvm access
//! - Firecracker binary installed
//! - Kernel and rootfs images
//!
//! Run with: `cargo test -p skiff-vmm -- --ignored`

use skiff_common::VmId;
use skiff_vmm::{FirecrackerConfig, FirecrackerDriver, MachineSpec, VmmDriver};
use std::path::Path;

fn spec_from_env() -> Option<MachineSpec> {
    let kernel_path = std::env::var("SKIFF_KERNEL_PATH")
        .unwrap_or_else(|_| "/var/lib/skiff/vmlinux".to_string());
    let rootfs_path = std::env::var("SKIFF_ROOTFS_PATH")
        .unwrap_or_else(|_| "/var/lib/skiff/rootfs.ext4".to_string());

    if !Path::new(&kernel_path).exists() || !Path::new(&rootfs_path).exists() {
        eprintln!("Skipping test: kernel or rootfs not found");
        eprintln!("Set SKIFF_KERNEL_PATH and SKIFF_ROOTFS_PATH environment variables");
        return None;
    }

    Some(MachineSpec {
        kernel_path: kernel_path.into(),
        rootfs_path: rootfs_path.into(),
        vcpu_count: 1,
        mem_size_mib: 128,
        network: None,
    })
}

/// Full VM lifecycle: launch with metadata, then terminate.
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_vm_lifecycle() {
    let Some(spec) = spec_from_env() else {
        return;
    };

    let driver = FirecrackerDriver::new(FirecrackerConfig::default()).expect("driver");
    let vm_id = VmId::new();
    let metadata = serde_json::json!({
        "vm_id": vm_id.to_string(),
        "node_nats_host": "192.168.127.1",
        "node_nats_port": 9222,
        "node_nats_nkey_seed": "SUASINTEGRATION",
    });

    let vm = driver
        .launch(vm_id, &spec, &metadata)
        .await
        .expect("Failed to launch VM");
    assert_eq!(vm.vcpus, 1);

    driver.terminate(&vm_id).await.expect("Failed to terminate VM");

    // Termination is idempotent.
    driver.terminate(&vm_id).await.expect("repeat terminate");
}
