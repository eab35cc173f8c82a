//! skiff-guest-agent: in-guest agent for skiff micro-VMs.
//!
//! Reads its boot metadata, connects back to the node's internal bus,
//! handshakes, and then serves deploy/undeploy/trigger requests while
//! streaming logs and lifecycle events.

mod agent;
mod metadata;
mod provider;

use agent::Agent;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("skiff_guest_agent=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("skiff-guest-agent starting");

    let metadata = metadata::load().await?;
    tracing::info!(vm_id = %metadata.vm_id, "Guest metadata loaded");

    let agent = Agent::init(metadata).await?;
    agent.start().await?;
    tracing::info!("Agent is up");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Agent shutting down");
    Ok(())
}
