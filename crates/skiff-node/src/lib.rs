//! # skiff-node
//!
//! Node-level workload orchestration core: a warm pool of pre-booted
//! micro-VMs, per-VM agent clients over the internal bus, and the
//! delegate surface bridging lifecycle transitions upward.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        skiff node                          │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  ┌──────────────┐   warm channel    ┌───────────────────┐  │
//! │  │ PoolManager  │──────────────────▶│ prepare_workload  │  │
//! │  │  fill loop   │                   └───────────────────┘  │
//! │  └──────┬───────┘                             │            │
//! │         │ launches via VmmDriver              ▼            │
//! │         │                          ┌───────────────────┐   │
//! │  ┌──────▼───────┐    callbacks     │   AgentClient     │   │
//! │  │   VmHandle   │◀─────────────────│ deploy / trigger  │   │
//! │  └──────────────┘                  └─────────┬─────────┘   │
//! │                                              │ bus         │
//! └──────────────────────────────────────────────┼─────────────┘
//!                                                ▼
//!                                     in-guest agent (per VM)
//! ```

mod agent;
mod delegate;
mod error;
mod handle;
mod node;
mod pool;
mod telemetry;

pub use agent::{AgentClient, AgentEvents, DEFAULT_TRIGGER_TIMEOUT};
pub use delegate::{ExitReason, ProcessDelegate};
pub use error::{NodeError, Result};
pub use handle::{VmHandle, VmState};
pub use node::{Node, NodeDelegate};
pub use pool::{PoolManager, ProcessInfo};
pub use telemetry::Telemetry;
