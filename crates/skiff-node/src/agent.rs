//! Node-side client for one VM's in-guest agent.
//!
//! Owns that VM's subscriptions on the internal bus, the handshake
//! watchdog, and the deploy/undeploy/trigger operations.

use crate::error::{NodeError, Result};
use chrono::{DateTime, Utc};
use skiff_bus::{BusError, BusHandle, Message, Subscription};
use skiff_common::VmId;
use skiff_proto::{
    subjects, DeployRequest, DeployResponse, Event, HandshakeRequest, HandshakeResponse, LogEntry,
    CORRELATION_ID_HEADER, TRIGGER_SUBJECT_HEADER,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Deadline for the deploy acknowledgement.
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for the undeploy acknowledgement.
const UNDEPLOY_TIMEOUT: Duration = Duration::from_millis(500);

/// Default deadline for a trigger invocation.
pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Upward callbacks fired by an [`AgentClient`].
///
/// Implementations must not block; they may dispatch onto their own
/// tasks.
pub trait AgentEvents: Send + Sync + 'static {
    /// The guest published a valid handshake. Fired at most once.
    fn on_handshake_success(&self, vm_id: VmId);
    /// The handshake deadline expired with no handshake seen.
    fn on_handshake_timeout(&self, vm_id: VmId);
    /// The guest published an event.
    fn on_event(&self, vm_id: VmId, event: Event);
    /// The guest published a log line.
    fn on_log(&self, vm_id: VmId, entry: LogEntry);
}

/// Stateful wrapper around the internal bus for exactly one `vm_id`.
///
/// Holds only the ID and a bus handle; it does not extend the VM's
/// lifetime.
pub struct AgentClient {
    bus: BusHandle,
    vm_id: VmId,
    handshake_timeout: Duration,
    handshake_received: Arc<AtomicBool>,
    events: Arc<dyn AgentEvents>,
    exec_total_nanos: AtomicU64,
    workload_started_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    subscriptions: tokio::sync::Mutex<Vec<Subscription>>,
    watchdog: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AgentClient {
    pub fn new(
        bus: BusHandle,
        vm_id: VmId,
        handshake_timeout: Duration,
        events: Arc<dyn AgentEvents>,
    ) -> Self {
        Self {
            bus,
            vm_id,
            handshake_timeout,
            handshake_received: Arc::new(AtomicBool::new(false)),
            events,
            exec_total_nanos: AtomicU64::new(0),
            workload_started_at: parking_lot::Mutex::new(None),
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
            watchdog: parking_lot::Mutex::new(None),
        }
    }

    /// The VM this client fronts.
    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Subscribe to the VM's handshake, event, and log subjects and arm
    /// the handshake watchdog.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(vm_id = %self.vm_id, "Agent client starting");

        let handshake_sub = {
            let bus = self.bus.clone();
            let events = Arc::clone(&self.events);
            let flag = Arc::clone(&self.handshake_received);
            let vm_id = self.vm_id;
            self.bus
                .subscribe(&subjects::handshake(&self.vm_id), move |msg: Message| {
                    let bus = bus.clone();
                    let events = Arc::clone(&events);
                    let flag = Arc::clone(&flag);
                    Box::pin(async move {
                        handle_handshake(bus, events, flag, vm_id, msg).await;
                    }) as skiff_bus::HandlerFuture
                })
                .await?
        };

        let event_sub = {
            let events = Arc::clone(&self.events);
            let vm_id = self.vm_id;
            self.bus
                .subscribe(&subjects::events_wildcard(&self.vm_id), move |msg: Message| {
                    let events = Arc::clone(&events);
                    Box::pin(async move {
                        match serde_json::from_slice::<Event>(&msg.payload) {
                            Ok(event) => {
                                tracing::debug!(vm_id = %vm_id, event_type = %event.event_type, "Received agent event");
                                events.on_event(vm_id, event);
                            }
                            Err(e) => {
                                tracing::error!(vm_id = %vm_id, error = %e, "Failed to deserialize event from agent");
                            }
                        }
                    }) as skiff_bus::HandlerFuture
                })
                .await?
        };

        let log_sub = {
            let events = Arc::clone(&self.events);
            let vm_id = self.vm_id;
            self.bus
                .subscribe(&subjects::logs(&self.vm_id), move |msg: Message| {
                    let events = Arc::clone(&events);
                    Box::pin(async move {
                        match serde_json::from_slice::<LogEntry>(&msg.payload) {
                            Ok(entry) => {
                                tracing::debug!(vm_id = %vm_id, log = %entry.text, "Received agent log");
                                events.on_log(vm_id, entry);
                            }
                            Err(e) => {
                                tracing::error!(vm_id = %vm_id, error = %e, "Failed to unmarshal log entry from agent");
                            }
                        }
                    }) as skiff_bus::HandlerFuture
                })
                .await?
        };

        {
            let mut subs = self.subscriptions.lock().await;
            subs.push(handshake_sub);
            subs.push(event_sub);
            subs.push(log_sub);
        }

        // One-shot watchdog; it can never fire after a successful
        // handshake because the flag is set before the success callback.
        let flag = Arc::clone(&self.handshake_received);
        let events = Arc::clone(&self.events);
        let vm_id = self.vm_id;
        let timeout = self.handshake_timeout;
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !flag.load(Ordering::SeqCst) {
                events.on_handshake_timeout(vm_id);
            }
        });
        *self.watchdog.lock() = Some(watchdog);

        Ok(())
    }

    /// Whether the guest has handshaked.
    pub fn handshake_received(&self) -> bool {
        self.handshake_received.load(Ordering::SeqCst)
    }

    /// Dispatch a deploy request and await the agent's acknowledgement.
    ///
    /// A rejection (`accepted=false`) surfaces as
    /// [`NodeError::DispatchRejected`] carrying the agent's message.
    pub async fn deploy_workload(&self, request: &DeployRequest) -> Result<DeployResponse> {
        let payload = serde_json::to_vec(request)?;
        let subject = subjects::deploy(&self.vm_id);

        let reply = self
            .bus
            .request(&subject, payload, DEPLOY_TIMEOUT)
            .await
            .map_err(|e| match e {
                BusError::TimedOut { .. } => NodeError::DispatchTimeout,
                other => NodeError::Bus(other),
            })?;

        let response: DeployResponse = serde_json::from_slice(&reply.payload)?;
        if !response.accepted {
            return Err(NodeError::DispatchRejected(
                response.message.unwrap_or_default(),
            ));
        }

        *self.workload_started_at.lock() = Some(Utc::now());
        tracing::info!(
            vm_id = %self.vm_id,
            workload = %request.workload_name,
            "Workload deployment acknowledged"
        );
        Ok(response)
    }

    /// Ask the agent to undeploy. Failures are logged and surfaced but
    /// never retried.
    pub async fn undeploy(&self) -> Result<()> {
        let subject = subjects::undeploy(&self.vm_id);
        match self.bus.request(&subject, Vec::new(), UNDEPLOY_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    vm_id = %self.vm_id,
                    error = %e,
                    "Request to undeploy workload failed"
                );
                Err(NodeError::Bus(e))
            }
        }
    }

    /// Route one externally triggered invocation into the workload and
    /// return its raw reply bytes.
    pub async fn run_trigger(
        &self,
        trigger_subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut headers = HashMap::new();
        headers.insert(
            TRIGGER_SUBJECT_HEADER.to_string(),
            trigger_subject.to_string(),
        );
        headers.insert(
            CORRELATION_ID_HEADER.to_string(),
            Uuid::new_v4().to_string(),
        );

        let reply = self
            .bus
            .request_with_headers(&subjects::trigger(&self.vm_id), headers, payload, timeout)
            .await?;
        Ok(reply.payload)
    }

    /// Accumulate workload CPU time. Any writer, any reader.
    pub fn record_exec_time(&self, elapsed_nanos: u64) {
        self.exec_total_nanos
            .fetch_add(elapsed_nanos, Ordering::Relaxed);
    }

    /// Total accumulated workload CPU time in nanoseconds.
    pub fn exec_time_nanos(&self) -> u64 {
        self.exec_total_nanos.load(Ordering::Relaxed)
    }

    /// Wall-clock milliseconds since the workload deploy was acknowledged.
    pub fn uptime_millis(&self) -> u64 {
        let started = *self.workload_started_at.lock();
        match started {
            Some(at) => Utc::now()
                .signed_duration_since(at)
                .num_milliseconds()
                .max(0) as u64,
            None => 0,
        }
    }

    /// Drain all subscriptions, flushing in-flight handlers, and disarm
    /// the watchdog.
    pub async fn drain(&self) -> Result<()> {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        let subs: Vec<Subscription> = {
            let mut guard = self.subscriptions.lock().await;
            guard.drain(..).collect()
        };
        for sub in subs {
            let pattern = sub.pattern().to_string();
            if let Err(e) = sub.drain().await {
                tracing::warn!(
                    vm_id = %self.vm_id,
                    subject = %pattern,
                    error = %e,
                    "Failed to drain subscription associated with agent client"
                );
            }
        }
        Ok(())
    }
}

async fn handle_handshake(
    bus: BusHandle,
    events: Arc<dyn AgentEvents>,
    flag: Arc<AtomicBool>,
    vm_id: VmId,
    msg: Message,
) {
    let request: HandshakeRequest = match serde_json::from_slice(&msg.payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(vm_id = %vm_id, error = %e, "Failed to handle agent handshake");
            return;
        }
    };
    tracing::info!(
        vm_id = %vm_id,
        message = request.message.as_deref().unwrap_or(""),
        "Received agent handshake"
    );

    // The ack goes out before node-side state advances, so the guest
    // observes completion first.
    if let Some(reply) = &msg.reply {
        let ack = serde_json::to_vec(&HandshakeResponse::default()).unwrap_or_else(|_| b"{}".to_vec());
        if let Err(e) = bus.publish(reply, ack).await {
            tracing::error!(vm_id = %vm_id, error = %e, "Failed to reply to agent handshake");
            return;
        }
    }

    if flag
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        events.on_handshake_success(request.id);
    }
}
