//! Message types carried on the internal bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_common::{VmId, WorkloadType};
use std::collections::HashMap;
use std::net::IpAddr;

/// First message from a booted guest, proving the in-guest agent is
/// reachable. The node acknowledges with an empty [`HandshakeResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// VM identity the guest was booted with.
    pub id: VmId,
    /// Free-form greeting, echoed from the boot metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Empty acknowledgement of a handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {}

/// Workload descriptor binding a warm VM to a specific workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Workload name; also the artifact key in the cache bucket.
    pub workload_name: String,
    /// Namespace the workload is deployed into.
    pub namespace: String,
    /// Execution provider tag.
    pub workload_type: WorkloadType,
    /// Digest of the workload artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Artifact size in bytes.
    #[serde(default)]
    pub total_bytes: i64,
    /// Environment handed to the execution provider.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Essential workloads are restarted by higher layers; lame duck
    /// mode clears this flag so the node can drain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essential: Option<bool>,
}

/// Agent's acknowledgement of a deploy request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    /// Whether the agent accepted the workload.
    pub accepted: bool,
    /// Detail accompanying the decision, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Severity of a guest log line.
///
/// Mirrors the node's level set, with the extended panic/fatal/trace
/// levels the agent may emit around workload crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

/// One log line published by the guest on its log subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The log line itself.
    pub text: String,
    /// Severity.
    pub level: LogLevel,
    /// When the line was produced (guest clock, UTC).
    pub timestamp: DateTime<Utc>,
    /// Producer: the agent itself, or a workload's stdout/stderr.
    pub source: String,
}

/// A structured lifecycle/observability record, CloudEvent-shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: String,
    /// Spec version; always "1.0".
    #[serde(default = "default_specversion")]
    pub specversion: String,
    /// Producer identity, typically the VM ID.
    pub source: String,
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event occurred.
    pub time: DateTime<Utc>,
    /// Structured payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_specversion() -> String {
    "1.0".to_string()
}

impl Event {
    /// Build a new event from the given source and type with a fresh ID
    /// and the current time.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            specversion: default_specversion(),
            source: source.into(),
            event_type: event_type.into(),
            time: Utc::now(),
            data,
        }
    }
}

/// Per-VM boot metadata, installed by the node into the VMM's metadata
/// service and read by the in-guest agent at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestMetadata {
    /// Address of the internal bus reachable from the guest.
    pub node_nats_host: IpAddr,
    /// Port of the internal bus reachable from the guest.
    pub node_nats_port: u16,
    /// Credential seed minted for this VM.
    pub node_nats_nkey_seed: String,
    /// This VM's identity.
    pub vm_id: VmId,
    /// Optional welcome text, echoed in the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional path for the guest's execution-provider loader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_path: Option<String>,
}
