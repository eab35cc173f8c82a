//! skiff node entry point.
//!
//! Boots the internal bus and the warm VM pool, then serves until a
//! shutdown signal arrives or a handshake deadline declares the node
//! unstable (non-zero exit).

use skiff_common::NodeConfig;
use skiff_node::Node;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("skiff_node=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!(path = %path, "Loading node configuration");
            NodeConfig::from_file(&path)?
        }
        None => NodeConfig::default(),
    };

    tracing::info!("skiff node starting");
    let node = Node::start(config).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping node");
            node.stop().await?;
        }
        _ = node.wait_unstable() => {
            tracing::error!("Handshake deadline expired; exiting unstable node");
            let _ = node.stop().await;
            std::process::exit(1);
        }
    }

    tracing::info!("Node shutdown complete");
    Ok(())
}
