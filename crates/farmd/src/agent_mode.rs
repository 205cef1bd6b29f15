//! Node mode — runs on render machines.
//!
//! In this mode, the daemon:
//! 1. Connects the node loop to the coordinator named in `node.toml`
//! 2. Polls for work until Ctrl-C (or, for single-use nodes, until its
//!    batch is rendered and reported)
//! 3. Kills any running renders on the way out

use std::time::Duration;

use farm_core::NodeConfig;
use farmgrid_agent::{HttpTransport, NodeAgent};
use tokio::sync::watch;
use tracing::info;

/// Upper bound on a single exchange with the coordinator.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the render node.
pub async fn run_node(config: NodeConfig) -> anyhow::Result<()> {
    let transport = HttpTransport::new(&config.server, REQUEST_TIMEOUT)?;
    info!(server = %config.server, "FarmGrid node starting");

    let agent = NodeAgent::new(config, transport);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut node = tokio::spawn(agent.run(shutdown_rx));

    tokio::select! {
        joined = &mut node => return joined?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    node.await??;

    info!("node stopped");
    Ok(())
}
