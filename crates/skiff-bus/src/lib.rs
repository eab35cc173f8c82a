//! # skiff-bus
//!
//! The node's internal control-plane transport: a subject-addressed
//! message bus embedded in the node process, reachable from the host
//! through an in-process handle and from guests through a TCP frontend
//! on a private interface.
//!
//! The bus provides request/response with single-reply timeouts,
//! pub/sub with wildcard subjects, per-VM credentials whose scope is
//! enforced at the connection boundary, and a memory-resident object
//! store for workload artifacts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     node process                        │
//! │                                                         │
//! │  BusHandle (admin) ──┐                                  │
//! │                      ▼                                  │
//! │               subject router ◀── TCP frontend ◀─────────┼── guests
//! │                      │               (credentialed)     │
//! │                      ▼                                  │
//! │               subscriptions / reply inboxes             │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod broker;
mod client;
mod error;
mod message;
mod object_store;
mod server;
mod subject;
mod wire;

pub use broker::{BusHandle, HandlerFuture, Subscription, VmCredentials};
pub use client::{GuestClient, GuestSubscription};
pub use error::{BusError, Result};
pub use message::Message;
pub use object_store::{BucketConfig, ObjectStore};
pub use server::{Bus, BusConfig};
pub use subject::subject_matches;

/// Broadcast subject a guest may use before it holds a VM-scoped
/// identity. Credential scopes always include it.
pub const HANDSHAKE_SUBJECT: &str = "agentint.handshake";

/// Prefix of reply-inbox subjects generated for request/response.
pub const INBOX_PREFIX: &str = "_INBOX.";
