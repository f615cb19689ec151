//! Command-line argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use peerlink_net::NetworkConfig;

/// Wire network to frame messages for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Header layout and magic of this network.
    pub fn config(self) -> NetworkConfig {
        match self {
            Network::Mainnet => NetworkConfig::bitcoin_mainnet(),
            Network::Testnet => NetworkConfig::bitcoin_testnet(),
            Network::Regtest => NetworkConfig::bitcoin_regtest(),
        }
    }

    /// Default P2P port of this network.
    pub fn default_port(self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }
}

/// Peer connection node.
#[derive(Parser, Debug, Clone)]
#[command(name = "peerlink-node")]
#[command(about = "Keeps a set of P2P peer connections open")]
#[command(version)]
pub struct Cli {
    /// Network to join.
    #[arg(long, value_enum, default_value = "mainnet")]
    pub network: Network,

    /// P2P listen address.
    #[arg(long, default_value = "0.0.0.0:8333")]
    pub listen: SocketAddr,

    /// Do not accept inbound connections.
    #[arg(long)]
    pub no_listen: bool,

    /// Comma-separated list of peers (host:port).
    #[arg(long, value_delimiter = ',')]
    pub peers: Option<Vec<String>>,

    /// JSON file of known peers. Updated on shutdown.
    #[arg(long)]
    pub peers_file: Option<PathBuf>,

    /// Number of outbound connections to keep.
    #[arg(long, default_value_t = 8)]
    pub target_outbound: usize,

    /// Maximum inbound connections.
    #[arg(long, default_value_t = 125)]
    pub max_inbound: usize,

    /// SOCKS5 proxy for outbound connections.
    #[arg(long)]
    pub proxy: Option<SocketAddr>,

    /// Resolve peer hostnames locally instead of through the proxy.
    #[arg(long)]
    pub resolve: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
