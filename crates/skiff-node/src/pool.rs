//! Warm VM pool manager.
//!
//! Keeps a bounded channel of pre-booted VMs full, allocates them to
//! deploy requests, reclaims them on stop, and tears the pool down
//! exactly once.

use crate::delegate::{ExitReason, ProcessDelegate};
use crate::error::{NodeError, Result};
use crate::handle::{VmHandle, VmState};
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use skiff_bus::BusHandle;
use skiff_common::{NodeConfig, VmId, WorkloadType};
use skiff_proto::{DeployRequest, GuestMetadata};
use skiff_vmm::{MachineSpec, VmmDriver};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sleep between fill attempts while the pool is full.
const RUNLOOP_SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A workload-carrying VM, as reported by `list_processes`.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub vm_id: VmId,
    pub name: String,
    pub namespace: String,
    pub workload_type: WorkloadType,
    pub workload_started_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PoolState {
    all_vms: HashMap<VmId, Arc<VmHandle>>,
    stop_locks: HashMap<VmId, Arc<Mutex<()>>>,
    deploy_requests: HashMap<VmId, DeployRequest>,
}

/// Manages the warm pool: fill loop, allocation, reclamation, teardown.
pub struct PoolManager {
    config: NodeConfig,
    bus: BusHandle,
    driver: Arc<dyn VmmDriver>,
    telemetry: Arc<Telemetry>,
    delegate: OnceLock<Arc<dyn ProcessDelegate>>,
    state: Mutex<PoolState>,
    warm_tx: mpsc::Sender<Arc<VmHandle>>,
    warm_rx: Mutex<mpsc::Receiver<Arc<VmHandle>>>,
    closing: AtomicU32,
    lame_duck: AtomicBool,
    cancel: CancellationToken,
    fill_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(
        config: NodeConfig,
        bus: BusHandle,
        driver: Arc<dyn VmmDriver>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let (warm_tx, warm_rx) = mpsc::channel(config.machine_pool_size.max(1));
        Self {
            config,
            bus,
            driver,
            telemetry,
            delegate: OnceLock::new(),
            state: Mutex::new(PoolState::default()),
            warm_tx,
            warm_rx: Mutex::new(warm_rx),
            closing: AtomicU32::new(0),
            lame_duck: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            fill_task: Mutex::new(None),
        }
    }

    /// Begin the fill loop. Creation errors inside the loop are logged
    /// and retried; panics are caught and the loop restarts.
    pub async fn start(self: &Arc<Self>, delegate: Arc<dyn ProcessDelegate>) -> Result<()> {
        self.delegate
            .set(delegate)
            .map_err(|_| NodeError::Config("pool manager already started".to_string()))?;
        tracing::debug!("VM pool manager starting");

        if !self.config.preserve_network {
            if let Err(e) = self.driver.reset_networks().await {
                tracing::warn!(error = %e, "Failed to reset network");
            }
        }

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager.fill_loop().await;
        });
        *self.fill_task.lock().await = Some(task);
        Ok(())
    }

    /// Pull a warm VM from the channel and stamp it with the deploy
    /// request, moving it Warm→Assigned and updating the counters.
    ///
    /// Blocks until a VM is available; returns
    /// [`NodeError::NoVmAvailable`] once the pool is closed.
    pub async fn prepare_workload(&self, request: DeployRequest) -> Result<VmId> {
        let vm = loop {
            let received = {
                let mut rx = self.warm_rx.lock().await;
                tokio::select! {
                    vm = rx.recv() => vm,
                    _ = self.cancel.cancelled() => None,
                }
            };
            match received {
                None => return Err(NodeError::NoVmAvailable),
                Some(vm) if vm.state() == VmState::Warm => break vm,
                Some(stale) => {
                    // Stopped while parked in the channel; skip it.
                    tracing::debug!(vm_id = %stale.vm_id(), state = %stale.state(), "Discarding stale VM from warm channel");
                }
            }
        };

        {
            let mut state = self.state.lock().await;
            vm.assign(&request)?;
            state.deploy_requests.insert(vm.vm_id(), request.clone());
        }

        self.telemetry
            .workload_assigned(vm.vcpus(), vm.mem_size_mib(), request.total_bytes);
        tracing::debug!(
            vm_id = %vm.vm_id(),
            workload = %request.workload_name,
            namespace = %request.namespace,
            "Workload prepared"
        );
        Ok(vm.vm_id())
    }

    /// Stop a single VM: transition to Stopping, terminate, remove from
    /// every map, pair down the counters, revoke its credentials.
    pub async fn stop_process(&self, vm_id: &VmId) -> Result<()> {
        self.stop_process_with_reason(vm_id, ExitReason::Stopped)
            .await
    }

    pub(crate) async fn stop_process_with_reason(
        &self,
        vm_id: &VmId,
        reason: ExitReason,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let vm = state
            .all_vms
            .get(vm_id)
            .cloned()
            .ok_or(NodeError::NotFound(*vm_id))?;
        let stop_lock = state
            .stop_locks
            .get(vm_id)
            .cloned()
            .ok_or(NodeError::NotFound(*vm_id))?;
        let _guard = stop_lock.lock().await;

        tracing::debug!(vm_id = %vm_id, reason = %reason, "Attempting to stop virtual machine");
        vm.shutdown().await;

        state.all_vms.remove(vm_id);
        state.stop_locks.remove(vm_id);
        let deploy_request = state.deploy_requests.remove(vm_id);
        drop(state);

        if let Some(request) = deploy_request {
            self.telemetry
                .workload_released(vm.vcpus(), vm.mem_size_mib(), request.total_bytes);
        }
        self.telemetry.vm_gone();
        self.bus.revoke_credentials(vm_id).await;
        vm.mark_gone();

        if let Some(delegate) = self.delegate.get() {
            let delegate = Arc::clone(delegate);
            let vm_id = *vm_id;
            tokio::spawn(async move {
                delegate.on_process_exited(vm_id, reason);
            });
        }
        Ok(())
    }

    /// Snapshot of workload-carrying VMs. Warm VMs are excluded because
    /// they carry no workload.
    pub async fn list_processes(&self) -> Vec<ProcessInfo> {
        let state = self.state.lock().await;
        state
            .all_vms
            .values()
            .filter_map(|vm| {
                vm.deploy_request().map(|request| ProcessInfo {
                    vm_id: vm.vm_id(),
                    name: request.workload_name.clone(),
                    namespace: request.namespace.clone(),
                    workload_type: request.workload_type.clone(),
                    workload_started_at: vm.workload_started_at(),
                })
            })
            .collect()
    }

    /// Look up a live VM by ID.
    pub async fn lookup_process(&self, vm_id: &VmId) -> Option<Arc<VmHandle>> {
        self.state.lock().await.all_vms.get(vm_id).cloned()
    }

    /// Mark the VM's handshake flag. Fired from the handshake-success
    /// callback path.
    pub async fn mark_handshake_received(&self, vm_id: &VmId) {
        if let Some(vm) = self.lookup_process(vm_id).await {
            vm.mark_handshake_received();
        }
    }

    /// Mark every deploy request non-essential and stop refilling, so
    /// higher layers can drain gracefully. Existing workloads remain
    /// addressable until explicitly stopped.
    pub async fn enter_lame_duck(&self) {
        tracing::info!("Entering lame duck mode");
        self.lame_duck.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        for request in state.deploy_requests.values_mut() {
            request.essential = Some(false);
        }
        for vm in state.all_vms.values() {
            vm.clear_essential();
        }
    }

    /// Tear the pool down. The first caller runs the teardown body;
    /// subsequent calls are no-ops with the same result.
    pub async fn stop(&self) -> Result<()> {
        if self
            .closing
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Pool manager already stopping");
            return Ok(());
        }
        tracing::debug!("VM pool manager stopping");
        self.cancel.cancel();

        // Closing the channel ends blocked prepare calls and refuses
        // further enqueues.
        {
            self.warm_rx.lock().await.close();
        }

        let vm_ids: Vec<VmId> = {
            let state = self.state.lock().await;
            state.all_vms.keys().copied().collect()
        };
        for vm_id in vm_ids {
            if let Err(e) = self
                .stop_process_with_reason(&vm_id, ExitReason::PoolShutdown)
                .await
            {
                if !e.is_not_found() {
                    tracing::warn!(vm_id = %vm_id, error = %e, "Failed to stop VM during pool teardown");
                }
            }
        }

        // Drain whatever is still parked in the channel; every entry was
        // already shut down through the map above.
        {
            let mut rx = self.warm_rx.lock().await;
            while let Ok(vm) = rx.try_recv() {
                vm.shutdown().await;
            }
        }

        if let Some(task) = self.fill_task.lock().await.take() {
            let _ = task.await;
        }
        tracing::info!("VM pool manager stopped");
        Ok(())
    }

    /// Number of VMs currently parked in the warm channel.
    pub fn warm_len(&self) -> usize {
        self.config
            .machine_pool_size
            .saturating_sub(self.warm_tx.capacity())
    }

    /// The pool's counter block.
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    fn stopping(&self) -> bool {
        self.closing.load(Ordering::SeqCst) > 0
    }

    async fn fill_loop(self: Arc<Self>) {
        tracing::debug!("Pool fill loop started");
        loop {
            if self.cancel.is_cancelled() || self.stopping() {
                break;
            }
            if self.lame_duck.load(Ordering::SeqCst) {
                tokio::time::sleep(RUNLOOP_SLEEP_INTERVAL).await;
                continue;
            }

            let manager = Arc::clone(&self);
            match tokio::spawn(async move { manager.fill_one().await }).await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    tracing::error!("Fill iteration panicked, restarting loop");
                }
                Err(_) => break,
            }
        }
        tracing::debug!("Pool fill loop exited");
    }

    /// One fill tick: mint credentials, boot a VM, register it, enqueue
    /// it warm. Every failure is logged and the tick abandoned; the
    /// loop continues.
    async fn fill_one(&self) {
        if self.warm_tx.capacity() == 0 {
            tokio::time::sleep(RUNLOOP_SLEEP_INTERVAL).await;
            return;
        }

        let vm_id = VmId::new();

        let credentials = match self.bus.mint_credentials(vm_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create workload user");
                return;
            }
        };

        let metadata = GuestMetadata {
            node_nats_host: self.config.internal_node_host,
            node_nats_port: self.config.internal_node_port,
            node_nats_nkey_seed: credentials.user_seed.clone(),
            vm_id,
            message: Some("Host-supplied metadata".to_string()),
            plugin_path: None,
        };
        let metadata_json = match serde_json::to_value(&metadata) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize guest metadata");
                self.bus.revoke_credentials(&vm_id).await;
                return;
            }
        };

        let spec = MachineSpec {
            kernel_path: self.config.kernel_filepath.clone(),
            rootfs_path: self.config.rootfs_filepath.clone(),
            vcpu_count: self.config.machine_template.vcpu_count,
            mem_size_mib: self.config.machine_template.mem_size_mib,
            network: None,
        };
        let launched = match self.driver.launch(vm_id, &spec, &metadata_json).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create VM for warming pool");
                self.bus.revoke_credentials(&vm_id).await;
                return;
            }
        };

        let handle = Arc::new(VmHandle::new(
            vm_id,
            &launched,
            credentials,
            Arc::clone(&self.driver),
        ));

        {
            let mut state = self.state.lock().await;
            if self.stopping() {
                drop(state);
                handle.shutdown().await;
                self.bus.revoke_credentials(&vm_id).await;
                return;
            }
            state.all_vms.insert(vm_id, Arc::clone(&handle));
            state.stop_locks.insert(vm_id, Arc::new(Mutex::new(())));
        }
        self.telemetry.vm_registered();

        if let Some(delegate) = self.delegate.get() {
            let delegate = Arc::clone(delegate);
            tokio::spawn(async move {
                delegate.on_process_started(vm_id);
            });
        }

        tracing::debug!(ip = %handle.ip(), vm_id = %vm_id, "Adding new VM to warm pool");
        // A full pool blocks here until a slot opens; that is the
        // intended backpressure.
        tokio::select! {
            sent = self.warm_tx.send(Arc::clone(&handle)) => {
                if sent.is_err() {
                    tracing::debug!(vm_id = %vm_id, "Warm channel closed during enqueue");
                    handle.shutdown().await;
                }
            }
            _ = self.cancel.cancelled() => {
                // stop() tears down every registered VM, this one included.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_vmm::NoSandboxDriver;
    use std::collections::HashMap as StdHashMap;

    struct NullDelegate;
    impl ProcessDelegate for NullDelegate {
        fn on_process_started(&self, _vm_id: VmId) {}
        fn on_process_exited(&self, _vm_id: VmId, _reason: ExitReason) {}
    }

    fn test_config(pool_size: usize) -> NodeConfig {
        NodeConfig {
            machine_pool_size: pool_size,
            no_sandbox: true,
            ..Default::default()
        }
    }

    fn test_pool(pool_size: usize) -> (Arc<PoolManager>, Arc<NoSandboxDriver>) {
        let driver = Arc::new(NoSandboxDriver::new());
        let pool = Arc::new(PoolManager::new(
            test_config(pool_size),
            BusHandle::new(),
            Arc::clone(&driver) as Arc<dyn VmmDriver>,
            Arc::new(Telemetry::default()),
        ));
        (pool, driver)
    }

    fn request(bytes: i64) -> DeployRequest {
        DeployRequest {
            workload_name: "echo".to_string(),
            namespace: "default".to_string(),
            workload_type: WorkloadType::Elf,
            hash: None,
            total_bytes: bytes,
            environment: StdHashMap::new(),
            essential: Some(true),
        }
    }

    async fn wait_for_warm(pool: &Arc<PoolManager>, n: usize) {
        for _ in 0..100 {
            if pool.warm_len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pool never warmed to {n}");
    }

    #[tokio::test]
    async fn test_pool_fills_to_capacity() {
        let (pool, _driver) = test_pool(3);
        pool.start(Arc::new(NullDelegate)).await.unwrap();

        wait_for_warm(&pool, 3).await;
        assert_eq!(pool.warm_len(), 3);
        assert_eq!(pool.telemetry().vm_count(), 3);
        assert!(pool.list_processes().await.is_empty());

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_assigns_and_counts() {
        let (pool, _driver) = test_pool(1);
        pool.start(Arc::new(NullDelegate)).await.unwrap();
        wait_for_warm(&pool, 1).await;

        let vm_id = pool.prepare_workload(request(1024)).await.unwrap();
        let vm = pool.lookup_process(&vm_id).await.expect("registered");
        assert_eq!(vm.state(), VmState::Assigned);
        assert_eq!(pool.telemetry().workload_count(), 1);
        assert_eq!(pool.telemetry().deployed_bytes(), 1024);
        assert_eq!(pool.telemetry().allocated_vcpus(), 1);

        let processes = pool.list_processes().await;
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].name, "echo");
        assert_eq!(processes[0].namespace, "default");

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_counters_zero_drift() {
        let (pool, _driver) = test_pool(1);
        pool.start(Arc::new(NullDelegate)).await.unwrap();
        wait_for_warm(&pool, 1).await;

        let vm_id = pool.prepare_workload(request(4096)).await.unwrap();
        pool.stop_process(&vm_id).await.unwrap();

        let t = pool.telemetry();
        assert_eq!(t.workload_count(), 0);
        assert_eq!(t.allocated_vcpus(), 0);
        assert_eq!(t.allocated_mem_mib(), 0);
        assert_eq!(t.deployed_bytes(), 0);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_process_unknown_is_not_found() {
        let (pool, _driver) = test_pool(1);
        pool.start(Arc::new(NullDelegate)).await.unwrap();

        let err = pool.stop_process(&VmId::new()).await.unwrap_err();
        assert!(err.is_not_found());

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_after_stop_is_no_vm_available() {
        let (pool, _driver) = test_pool(1);
        pool.start(Arc::new(NullDelegate)).await.unwrap();
        wait_for_warm(&pool, 1).await;
        pool.stop().await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            pool.prepare_workload(request(10)),
        )
        .await
        .expect("bounded");
        assert!(matches!(outcome, Err(NodeError::NoVmAvailable)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (pool, driver) = test_pool(2);
        pool.start(Arc::new(NullDelegate)).await.unwrap();
        wait_for_warm(&pool, 2).await;

        let launched = driver.launched_ids();
        pool.stop().await.unwrap();
        pool.stop().await.unwrap();

        // Every VM ever registered was terminated exactly once.
        for vm_id in launched {
            assert_eq!(driver.terminate_count(&vm_id), 1);
        }
        assert_eq!(pool.telemetry().vm_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_stop_decrements_once() {
        let (pool, driver) = test_pool(1);
        pool.start(Arc::new(NullDelegate)).await.unwrap();
        wait_for_warm(&pool, 1).await;

        let vm_id = pool.prepare_workload(request(512)).await.unwrap();
        let first = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.stop_process(&vm_id).await })
        };
        let second = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.stop_process(&vm_id).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert!(results.iter().any(|r| r.is_ok()));
        assert_eq!(driver.terminate_count(&vm_id), 1);
        assert_eq!(pool.telemetry().workload_count(), 0);
        assert_eq!(pool.telemetry().deployed_bytes(), 0);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lame_duck_stops_refill_and_clears_essential() {
        let (pool, _driver) = test_pool(1);
        pool.start(Arc::new(NullDelegate)).await.unwrap();
        wait_for_warm(&pool, 1).await;

        let vm_id = pool.prepare_workload(request(100)).await.unwrap();
        wait_for_warm(&pool, 1).await;

        pool.enter_lame_duck().await;
        let vm = pool.lookup_process(&vm_id).await.unwrap();
        assert_eq!(vm.deploy_request().unwrap().essential, Some(false));

        // Drain the remaining warm VM; with lame duck set, no refill.
        let _second = pool.prepare_workload(request(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pool.warm_len(), 0);

        // Existing workloads remain addressable.
        assert!(pool.lookup_process(&vm_id).await.is_some());

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_warm_len_bounded_by_pool_size() {
        let (pool, _driver) = test_pool(2);
        pool.start(Arc::new(NullDelegate)).await.unwrap();

        for _ in 0..50 {
            assert!(pool.warm_len() <= 2);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.stop().await.unwrap();
    }
}
