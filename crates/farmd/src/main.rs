//! farmd — the FarmGrid daemon.
//!
//! One binary for both sides of the farm:
//! - `serve`: the coordinator (job store, scheduler, HTTP API, reaper)
//! - `node`: a render node polling a coordinator
//!
//! # Usage
//!
//! ```text
//! farmd serve --config /etc/farmgrid/farm.toml
//! farmd node --config /etc/farmgrid/node.toml
//! ```

mod agent_mode;
mod serve_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use farm_core::{FarmConfig, NodeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "farmd", about = "FarmGrid render farm daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator.
    Serve {
        /// Coordinator config file; built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the listen address, e.g. `0.0.0.0:8080`.
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run a render node.
    Node {
        /// Node config file.
        #[arg(long, default_value = "node.toml")]
        config: PathBuf,
    },

    /// Print the default coordinator config as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,farmd=debug,farmgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, listen } => {
            let mut config = match config {
                Some(path) => FarmConfig::from_file(&path)?,
                None => FarmConfig::default(),
            };
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            serve_mode::run_serve(config).await
        }
        Command::Node { config } => agent_mode::run_node(NodeConfig::from_file(&config)?).await,
        Command::DefaultConfig => {
            print!("{}", FarmConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}
