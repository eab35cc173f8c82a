//! # skiff-proto
//!
//! The wire-level contract between the skiff node and the in-guest
//! agent: bus subject grammar, handshake, deploy, log and event message
//! types, and the per-VM boot metadata.
//!
//! All payloads are JSON. Unknown fields are ignored by both sides so
//! either end can move forward independently.

pub mod subjects;
mod wire;

pub use wire::{
    DeployRequest, DeployResponse, Event, GuestMetadata, HandshakeRequest, HandshakeResponse,
    LogEntry, LogLevel,
};

/// Header naming the external subject that triggered a workload call.
pub const TRIGGER_SUBJECT_HEADER: &str = "x-nex-trigger-subject";

/// Header carrying the correlation ID propagated with trigger requests.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Object store bucket holding workload artifacts, keyed by workload name.
pub const WORKLOAD_CACHE_BUCKET: &str = "NEXCACHE";

/// Event types emitted by the in-guest agent.
pub mod event_types {
    pub const AGENT_STARTED: &str = "agent_started";
    pub const WORKLOAD_DEPLOYED: &str = "workload_deployed";
    pub const WORKLOAD_UNDEPLOYED: &str = "workload_undeployed";
    pub const WORKLOAD_EXITED: &str = "workload_exited";
}
