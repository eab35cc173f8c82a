//! Node wiring: bus, pool, delegate, and agent-client registry.
//!
//! The delegate owns the per-VM agent clients and bridges their
//! callbacks back into the pool; the pool never holds an agent client
//! and an agent client never holds a VM handle.

use crate::agent::{AgentClient, AgentEvents};
use crate::delegate::{ExitReason, ProcessDelegate};
use crate::error::{NodeError, Result};
use crate::handle::VmState;
use crate::pool::{PoolManager, ProcessInfo};
use crate::telemetry::Telemetry;
use skiff_bus::{BucketConfig, Bus, BusConfig, BusHandle};
use skiff_common::{NodeConfig, VmId};
use skiff_proto::{DeployRequest, Event, LogEntry, WORKLOAD_CACHE_BUCKET};
use skiff_vmm::{FirecrackerConfig, FirecrackerDriver, NoSandboxDriver, VmmDriver};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// A running node: internal bus, warm pool, and per-VM agent clients.
pub struct Node {
    config: NodeConfig,
    bus: Bus,
    handle: BusHandle,
    pool: Arc<PoolManager>,
    delegate: Arc<NodeDelegate>,
    telemetry: Arc<Telemetry>,
    unstable: Arc<Notify>,
}

impl Node {
    /// Validate the configuration, bring up the bus, and start the pool.
    ///
    /// The VMM driver is chosen from the configuration: Firecracker, or
    /// the sandboxless driver when `no_sandbox` is set.
    pub async fn start(config: NodeConfig) -> Result<Node> {
        config
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))?;

        let driver: Arc<dyn VmmDriver> = if config.no_sandbox {
            Arc::new(NoSandboxDriver::new())
        } else {
            Arc::new(FirecrackerDriver::new(FirecrackerConfig {
                cni_subnet: config.cni.subnet.clone(),
                ..Default::default()
            })?)
        };
        Self::start_with_driver(config, driver).await
    }

    /// [`start`](Self::start) with an injected VMM driver.
    pub async fn start_with_driver(
        mut config: NodeConfig,
        driver: Arc<dyn VmmDriver>,
    ) -> Result<Node> {
        config
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))?;

        // Sandboxless guests run in-process and use loopback; real
        // guests reach the bus over the private interface.
        let bind_host = if config.no_sandbox {
            std::net::IpAddr::from(std::net::Ipv4Addr::LOCALHOST)
        } else {
            std::net::IpAddr::from(std::net::Ipv4Addr::UNSPECIFIED)
        };
        let (bus, handle) = Bus::start(BusConfig {
            host: bind_host,
            port: 0,
        })
        .await?;
        // The advertised endpoint must match where the bus actually
        // listens.
        config.internal_node_port = bus.port();
        if config.no_sandbox {
            config.internal_node_host = std::net::IpAddr::from(std::net::Ipv4Addr::LOCALHOST);
        }

        handle.object_store().create(
            WORKLOAD_CACHE_BUCKET,
            BucketConfig {
                description: Some("Object store cache for skiff-node workloads".to_string()),
            },
        );

        let telemetry = Arc::new(Telemetry::default());
        let pool = Arc::new(PoolManager::new(
            config.clone(),
            handle.clone(),
            driver,
            Arc::clone(&telemetry),
        ));

        let unstable = Arc::new(Notify::new());
        let delegate = Arc::new(NodeDelegate::new(
            handle.clone(),
            config.handshake_timeout(),
            Arc::downgrade(&pool),
            Arc::clone(&unstable),
        ));
        pool.start(Arc::clone(&delegate) as Arc<dyn ProcessDelegate>)
            .await?;

        tracing::info!(
            client_url = %bus.client_url(),
            pool_size = config.machine_pool_size,
            "Node started"
        );
        Ok(Node {
            config,
            bus,
            handle,
            pool,
            delegate,
            telemetry,
            unstable,
        })
    }

    /// The privileged bus connection.
    pub fn bus_handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Bus URL as reachable from guests.
    pub fn client_url(&self) -> &str {
        self.bus.client_url()
    }

    /// The pool manager.
    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// The node's counter block.
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Deploy a workload end to end: allocate a warm VM, dispatch the
    /// deploy request to its agent, and mark it running.
    ///
    /// A rejected or failed dispatch returns the VM to Stopping and
    /// surfaces the error.
    pub async fn deploy_workload(&self, request: DeployRequest) -> Result<VmId> {
        let tag = request.workload_type.as_str().to_string();
        if !self.config.workload_types.iter().any(|t| *t == tag) {
            return Err(NodeError::WorkloadTypeNotAllowed(tag));
        }

        let vm_id = self.pool.prepare_workload(request.clone()).await?;
        let agent = self.delegate.ensure_agent(vm_id).await?;

        match agent.deploy_workload(&request).await {
            Ok(_response) => {
                if let Some(vm) = self.pool.lookup_process(&vm_id).await {
                    if let Err(e) = vm.advance(VmState::Running) {
                        tracing::warn!(vm_id = %vm_id, error = %e, "Running transition rejected");
                    }
                }
                Ok(vm_id)
            }
            Err(e) => {
                tracing::warn!(vm_id = %vm_id, error = %e, "Workload dispatch failed");
                if let Err(stop_err) = self
                    .pool
                    .stop_process_with_reason(&vm_id, ExitReason::DeployRejected)
                    .await
                {
                    tracing::warn!(vm_id = %vm_id, error = %stop_err, "Failed to reclaim VM after dispatch failure");
                }
                Err(e)
            }
        }
    }

    /// Snapshot of workload-carrying VMs.
    pub async fn list_processes(&self) -> Vec<ProcessInfo> {
        self.pool.list_processes().await
    }

    /// Agent client for a VM, creating it on demand.
    pub async fn agent(&self, vm_id: VmId) -> Result<Arc<AgentClient>> {
        self.delegate.ensure_agent(vm_id).await
    }

    /// Resolves when a handshake deadline expires and the node declares
    /// itself unstable. The binary exits non-zero on this signal.
    pub async fn wait_unstable(&self) {
        self.unstable.notified().await;
    }

    /// Graceful teardown: pool first, then the bus.
    pub async fn stop(&self) -> Result<()> {
        self.pool.stop().await?;
        self.bus.shutdown();
        Ok(())
    }
}

/// Delegate implementation owning the agent-client registry.
pub struct NodeDelegate {
    inner: Arc<DelegateInner>,
}

struct DelegateInner {
    bus: BusHandle,
    handshake_timeout: Duration,
    pool: Weak<PoolManager>,
    unstable: Arc<Notify>,
    agents: Mutex<HashMap<VmId, Arc<AgentClient>>>,
}

impl NodeDelegate {
    fn new(
        bus: BusHandle,
        handshake_timeout: Duration,
        pool: Weak<PoolManager>,
        unstable: Arc<Notify>,
    ) -> Self {
        Self {
            inner: Arc::new(DelegateInner {
                bus,
                handshake_timeout,
                pool,
                unstable,
                agents: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn ensure_agent(&self, vm_id: VmId) -> Result<Arc<AgentClient>> {
        self.inner.ensure_agent(vm_id).await
    }
}

impl DelegateInner {
    async fn ensure_agent(self: &Arc<Self>, vm_id: VmId) -> Result<Arc<AgentClient>> {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get(&vm_id) {
            return Ok(Arc::clone(agent));
        }

        let events: Arc<dyn AgentEvents> = Arc::new(DelegateEvents {
            pool: self.pool.clone(),
            unstable: Arc::clone(&self.unstable),
        });
        let agent = Arc::new(AgentClient::new(
            self.bus.clone(),
            vm_id,
            self.handshake_timeout,
            events,
        ));
        agent.start().await?;
        agents.insert(vm_id, Arc::clone(&agent));
        Ok(agent)
    }

    async fn release_agent(&self, vm_id: VmId) {
        let agent = self.agents.lock().await.remove(&vm_id);
        if let Some(agent) = agent {
            if let Err(e) = agent.drain().await {
                tracing::warn!(vm_id = %vm_id, error = %e, "Failed to drain agent client");
            }
        }
    }
}

impl ProcessDelegate for NodeDelegate {
    fn on_process_started(&self, vm_id: VmId) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.ensure_agent(vm_id).await {
                tracing::error!(vm_id = %vm_id, error = %e, "Failed to start agent client");
            }
        });
    }

    fn on_process_exited(&self, vm_id: VmId, reason: ExitReason) {
        tracing::info!(vm_id = %vm_id, reason = %reason, "Process exited");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.release_agent(vm_id).await;
        });
    }
}

/// Agent-client callbacks bridged into the pool.
struct DelegateEvents {
    pool: Weak<PoolManager>,
    unstable: Arc<Notify>,
}

impl AgentEvents for DelegateEvents {
    fn on_handshake_success(&self, vm_id: VmId) {
        if let Some(pool) = self.pool.upgrade() {
            tokio::spawn(async move {
                pool.mark_handshake_received(&vm_id).await;
            });
        }
    }

    fn on_handshake_timeout(&self, vm_id: VmId) {
        tracing::error!(
            vm_id = %vm_id,
            "Did not receive handshake from agent within timeout; exiting unstable node"
        );
        let pool = self.pool.upgrade();
        let unstable = Arc::clone(&self.unstable);
        tokio::spawn(async move {
            if let Some(pool) = pool {
                if let Err(e) = pool.stop().await {
                    tracing::warn!(error = %e, "Pool teardown after handshake timeout failed");
                }
            }
            unstable.notify_one();
        });
    }

    fn on_event(&self, vm_id: VmId, event: Event) {
        tracing::info!(vm_id = %vm_id, event_type = %event.event_type, "Agent event");
    }

    fn on_log(&self, vm_id: VmId, entry: LogEntry) {
        tracing::debug!(vm_id = %vm_id, source = %entry.source, log = %entry.text, "Agent log");
    }
}
