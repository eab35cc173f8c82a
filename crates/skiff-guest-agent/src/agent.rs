//! The agent proper: handshake, dispatch handling, log and event
//! emission.

use crate::provider::{provider_for, ExecutionProvider, ProviderError};
use chrono::Utc;
use skiff_bus::{BusError, GuestClient, Message};
use skiff_common::VmId;
use skiff_proto::{
    event_types, subjects, DeployRequest, DeployResponse, Event, GuestMetadata, HandshakeRequest,
    LogEntry, LogLevel, TRIGGER_SUBJECT_HEADER, WORKLOAD_CACHE_BUCKET,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Deadline for the handshake acknowledgement from the node.
const HANDSHAKE_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to keep retrying the handshake while the node-side client
/// subscribes.
const HANDSHAKE_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Errors from the agent run loop.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("handshake was never acknowledged")]
    HandshakeUnacknowledged,

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Facilitates communication between the guest and the node over the
/// internal bus: handshake, workload dispatch, logs, and events.
pub struct Agent {
    client: GuestClient,
    metadata: GuestMetadata,
    vm_id: VmId,
    logs_tx: mpsc::UnboundedSender<LogEntry>,
    logs_rx: Mutex<Option<mpsc::UnboundedReceiver<LogEntry>>>,
    exits_tx: mpsc::UnboundedSender<(String, i32)>,
    exits_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, i32)>>>,
    provider: Mutex<Option<Box<dyn ExecutionProvider>>>,
}

impl Agent {
    /// Connect back to the node with the credentials from the boot
    /// metadata.
    pub async fn init(metadata: GuestMetadata) -> Result<Arc<Agent>, AgentError> {
        let url = format!(
            "tcp://{}:{}",
            metadata.node_nats_host, metadata.node_nats_port
        );
        let client =
            GuestClient::connect(&url, metadata.vm_id, &metadata.node_nats_nkey_seed).await?;

        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Agent {
            vm_id: metadata.vm_id,
            client,
            metadata,
            logs_tx,
            logs_rx: Mutex::new(Some(logs_rx)),
            exits_tx,
            exits_rx: Mutex::new(Some(exits_rx)),
            provider: Mutex::new(None),
        }))
    }

    /// Handshake with the node, then serve dispatch subjects and pump
    /// logs/events until the process exits.
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        self.handshake().await?;

        self.spawn_log_dispatch().await;
        self.spawn_exit_dispatch().await;
        self.spawn_dispatch_handlers().await?;

        self.publish_event(event_types::AGENT_STARTED, serde_json::json!({}))
            .await;
        self.log(LogLevel::Info, "Agent is up".to_string());
        Ok(())
    }

    /// Prove to the node that this agent is reachable. The node's
    /// client may still be subscribing right after boot, so retry
    /// within a bounded window.
    async fn handshake(&self) -> Result<(), AgentError> {
        let request = HandshakeRequest {
            id: self.vm_id,
            message: self.metadata.message.clone(),
        };
        let payload = serde_json::to_vec(&request)?;
        let subject = subjects::handshake(&self.vm_id);

        let start = std::time::Instant::now();
        while start.elapsed() < HANDSHAKE_RETRY_WINDOW {
            match self
                .client
                .request(&subject, &payload, HANDSHAKE_ACK_TIMEOUT)
                .await
            {
                Ok(_ack) => {
                    tracing::info!(vm_id = %self.vm_id, "Handshake acknowledged");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Handshake attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        Err(AgentError::HandshakeUnacknowledged)
    }

    async fn spawn_log_dispatch(self: &Arc<Self>) {
        let Some(mut logs_rx) = self.logs_rx.lock().await.take() else {
            return;
        };
        let client = self.client.clone();
        let subject = subjects::logs(&self.vm_id);
        tokio::spawn(async move {
            while let Some(entry) = logs_rx.recv().await {
                match serde_json::to_vec(&entry) {
                    Ok(payload) => {
                        if let Err(e) = client.publish(&subject, &payload).await {
                            tracing::warn!(error = %e, "Failed to publish log entry");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode log entry"),
                }
            }
        });
    }

    async fn spawn_exit_dispatch(self: &Arc<Self>) {
        let Some(mut exits_rx) = self.exits_rx.lock().await.take() else {
            return;
        };
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((name, code)) = exits_rx.recv().await {
                agent
                    .publish_event(
                        event_types::WORKLOAD_EXITED,
                        serde_json::json!({"name": name, "code": code}),
                    )
                    .await;
            }
        });
    }

    async fn spawn_dispatch_handlers(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut deploy_sub = self.client.subscribe(&subjects::deploy(&self.vm_id)).await?;
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = deploy_sub.next().await {
                agent.handle_deploy(msg).await;
            }
        });

        let mut undeploy_sub = self
            .client
            .subscribe(&subjects::undeploy(&self.vm_id))
            .await?;
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = undeploy_sub.next().await {
                agent.handle_undeploy(msg).await;
            }
        });

        let mut trigger_sub = self
            .client
            .subscribe(&subjects::trigger(&self.vm_id))
            .await?;
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = trigger_sub.next().await {
                agent.handle_trigger(msg).await;
            }
        });

        Ok(())
    }

    /// Pull the work request off the wire, fetch the artifact from the
    /// shared bucket, stage it, pick the execution provider, and ack.
    async fn handle_deploy(self: &Arc<Self>, msg: Message) {
        let request: DeployRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                let text = format!("Failed to unmarshal work request: {e}");
                self.log(LogLevel::Error, text.clone());
                self.ack(&msg, false, text).await;
                return;
            }
        };

        let artifact = match self
            .client
            .fetch_object(WORKLOAD_CACHE_BUCKET, &request.workload_name)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                let text = format!("Failed to fetch workload artifact: {e}");
                self.log(LogLevel::Error, text.clone());
                self.ack(&msg, false, text).await;
                return;
            }
        };

        let artifact_path = match stage_artifact(&artifact).await {
            Ok(path) => path,
            Err(e) => {
                let text = format!("Failed to stage workload artifact: {e}");
                self.log(LogLevel::Error, text.clone());
                self.ack(&msg, false, text).await;
                return;
            }
        };

        let provider = match provider_for(
            &request.workload_type,
            request.workload_name.clone(),
            artifact_path,
            request.environment.clone(),
            self.logs_tx.clone(),
            self.exits_tx.clone(),
        ) {
            Ok(provider) => provider,
            Err(e) => {
                let text = format!("Failed to initialize workload execution provider: {e}");
                self.log(LogLevel::Error, text.clone());
                self.ack(&msg, false, text).await;
                return;
            }
        };

        if let Err(e) = provider.validate().await {
            self.log(LogLevel::Error, format!("Failed to validate workload: {e}"));
        }

        self.ack(&msg, true, "Workload accepted".to_string()).await;

        if let Err(e) = provider.deploy().await {
            self.log(LogLevel::Error, format!("Failed to execute workload: {e}"));
            return;
        }
        *self.provider.lock().await = Some(provider);

        self.publish_event(
            event_types::WORKLOAD_DEPLOYED,
            serde_json::json!({"name": request.workload_name}),
        )
        .await;
    }

    async fn handle_undeploy(self: &Arc<Self>, msg: Message) {
        let provider = self.provider.lock().await.take();
        if let Some(provider) = provider {
            if let Err(e) = provider.undeploy().await {
                self.log(LogLevel::Error, format!("Failed to undeploy workload: {e}"));
            }
            self.publish_event(event_types::WORKLOAD_UNDEPLOYED, serde_json::json!({}))
                .await;
        }
        if let Err(e) = self.client.respond(&msg, b"{}").await {
            tracing::warn!(error = %e, "Failed to acknowledge undeploy");
        }
    }

    async fn handle_trigger(self: &Arc<Self>, msg: Message) {
        let trigger_subject = msg
            .header(TRIGGER_SUBJECT_HEADER)
            .unwrap_or_default()
            .to_string();
        tracing::debug!(subject = %trigger_subject, "Trigger received");

        let outcome: Result<Vec<u8>, ProviderError> = {
            let provider = self.provider.lock().await;
            match provider.as_ref() {
                Some(provider) => provider.execute(msg.payload.clone()).await,
                None => Err(ProviderError::Execution(
                    "no workload deployed".to_string(),
                )),
            }
        };

        match outcome {
            Ok(output) => {
                if let Err(e) = self.client.respond(&msg, &output).await {
                    tracing::warn!(error = %e, "Failed to reply to trigger");
                }
            }
            Err(e) => {
                self.log(
                    LogLevel::Error,
                    format!("Trigger execution failed on {trigger_subject}: {e}"),
                );
                if let Err(e) = self.client.respond(&msg, &[]).await {
                    tracing::warn!(error = %e, "Failed to reply to trigger");
                }
            }
        }
    }

    /// Ack a work dispatch with its accepted status.
    async fn ack(&self, msg: &Message, accepted: bool, text: String) {
        let response = DeployResponse {
            accepted,
            message: Some(text),
        };
        match serde_json::to_vec(&response) {
            Ok(payload) => {
                if let Err(e) = self.client.respond(msg, &payload).await {
                    self.log(
                        LogLevel::Error,
                        format!("Failed to acknowledge work dispatch: {e}"),
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode work acknowledgement"),
        }
    }

    fn log(&self, level: LogLevel, text: String) {
        let _ = self.logs_tx.send(LogEntry {
            text,
            level,
            timestamp: Utc::now(),
            source: "skiff-guest-agent".to_string(),
        });
    }

    async fn publish_event(&self, event_type: &str, data: serde_json::Value) {
        let event = Event::new(self.vm_id.to_string(), event_type, data);
        let subject = subjects::event(&self.vm_id, event_type);
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = self.client.publish(&subject, &payload).await {
                    tracing::warn!(error = %e, event_type = %event_type, "Failed to publish event");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
        }
    }
}

/// Write the artifact to a temp file and make it executable.
async fn stage_artifact(bytes: &[u8]) -> Result<PathBuf, std::io::Error> {
    let path = std::env::temp_dir().join(format!("workload-{}", Uuid::new_v4()));
    tokio::fs::write(&path, bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_artifact_is_executable() {
        let path = stage_artifact(b"#!/bin/sh\nexit 0\n").await.unwrap();
        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert!(meta.is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_ne!(meta.permissions().mode() & 0o111, 0);
        }
        let _ = tokio::fs::remove_file(&path).await;
    }
}
