//! Resource counters for the pool.
//!
//! All counters are atomic and can be read without locking. Increments
//! and decrements pair exactly across the Warm→Assigned and
//! Assigned→Gone transitions so a drained node reads zero everywhere.

use std::sync::atomic::{AtomicI64, Ordering};

/// Atomic counter block injected into the pool manager.
#[derive(Debug, Default)]
pub struct Telemetry {
    vm_count: AtomicI64,
    workload_count: AtomicI64,
    allocated_vcpus: AtomicI64,
    allocated_mem_mib: AtomicI64,
    deployed_bytes: AtomicI64,
}

impl Telemetry {
    /// Number of live VMs, warm or assigned.
    pub fn vm_count(&self) -> i64 {
        self.vm_count.load(Ordering::Relaxed)
    }

    /// Number of VMs carrying a workload.
    pub fn workload_count(&self) -> i64 {
        self.workload_count.load(Ordering::Relaxed)
    }

    /// vCPUs allocated to workloads.
    pub fn allocated_vcpus(&self) -> i64 {
        self.allocated_vcpus.load(Ordering::Relaxed)
    }

    /// Memory allocated to workloads, in MiB.
    pub fn allocated_mem_mib(&self) -> i64 {
        self.allocated_mem_mib.load(Ordering::Relaxed)
    }

    /// Total bytes of deployed workload artifacts.
    pub fn deployed_bytes(&self) -> i64 {
        self.deployed_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn vm_registered(&self) {
        self.vm_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn vm_gone(&self) {
        self.vm_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn workload_assigned(&self, vcpus: u32, mem_size_mib: u32, bytes: i64) {
        self.workload_count.fetch_add(1, Ordering::Relaxed);
        self.allocated_vcpus.fetch_add(i64::from(vcpus), Ordering::Relaxed);
        self.allocated_mem_mib
            .fetch_add(i64::from(mem_size_mib), Ordering::Relaxed);
        self.deployed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn workload_released(&self, vcpus: u32, mem_size_mib: u32, bytes: i64) {
        self.workload_count.fetch_sub(1, Ordering::Relaxed);
        self.allocated_vcpus.fetch_sub(i64::from(vcpus), Ordering::Relaxed);
        self.allocated_mem_mib
            .fetch_sub(i64::from(mem_size_mib), Ordering::Relaxed);
        self.deployed_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_yields_zero_drift() {
        let t = Telemetry::default();
        t.vm_registered();
        t.workload_assigned(2, 512, 1024);
        assert_eq!(t.vm_count(), 1);
        assert_eq!(t.workload_count(), 1);
        assert_eq!(t.allocated_vcpus(), 2);
        assert_eq!(t.allocated_mem_mib(), 512);
        assert_eq!(t.deployed_bytes(), 1024);

        t.workload_released(2, 512, 1024);
        t.vm_gone();
        assert_eq!(t.vm_count(), 0);
        assert_eq!(t.workload_count(), 0);
        assert_eq!(t.allocated_vcpus(), 0);
        assert_eq!(t.allocated_mem_mib(), 0);
        assert_eq!(t.deployed_bytes(), 0);
    }
}
