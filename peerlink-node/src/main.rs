//! Peerlink node binary.
//!
//! Keeps a set of peer connections open on a Bitcoin-style network until
//! interrupted.

use tracing_subscriber::EnvFilter;

use peerlink_node::cli::Cli;
use peerlink_node::config::NodeConfig;
use peerlink_node::node::Node;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("Peerlink Node v{}", env!("CARGO_PKG_VERSION"));

    // Build configuration
    let config = NodeConfig::from_cli(&cli)?;

    // The engine owns its runtime and pumps on this thread
    Node::new(config).run()
}
