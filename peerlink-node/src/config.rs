//! Node configuration.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use peerlink_net::{
    Address, ConnectionDescriptor, ConnectionOptions, HandlerConfig, ListenerDescriptor, ProxyDescriptor, ResolveMode,
};

use crate::cli::{Cli, Network};

/// Retry budget of a configured peer.
const PEER_RETRIES: i32 = 2;

/// One known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// `host:port` or `ip:port`.
    pub address: String,
    /// Reconnect whenever the connection drops.
    #[serde(default)]
    pub persistent: bool,
}

impl PeerEntry {
    /// Create an entry.
    pub fn new(address: impl Into<String>, persistent: bool) -> Self {
        Self {
            address: address.into(),
            persistent,
        }
    }
}

/// On-disk list of known peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersFile {
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl PeersFile {
    /// Load the file, or an empty list if it does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write the file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))
    }

    /// Add a peer unless its address is already listed.
    pub fn insert(&mut self, entry: PeerEntry) -> bool {
        if self.peers.iter().any(|p| p.address == entry.address) {
            return false;
        }
        self.peers.push(entry);
        true
    }
}

/// Parse `host:port`, `ip:port` or a bare host/ip using `default_port`.
pub fn parse_peer(s: &str, default_port: u16) -> anyhow::Result<Address> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty peer address");
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr.into());
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port).into());
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in peer address {}", s))?;
            Ok(Address::host(host, port))
        }
        Some(_) => bail!("invalid peer address {}", s),
        None => Ok(Address::host(s, default_port)),
    }
}

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Network to join.
    pub network: Network,

    /// P2P listen address, if accepting inbound connections.
    pub listen: Option<SocketAddr>,

    /// Peers to connect to.
    pub peers: Vec<PeerEntry>,

    /// Where known peers are kept between runs.
    pub peers_file: Option<PathBuf>,

    /// Number of outbound connections to keep.
    pub target_outbound: usize,

    /// Maximum inbound connections.
    pub max_inbound: usize,

    /// SOCKS5 proxy for outbound connections.
    pub proxy: Option<SocketAddr>,

    /// Resolve hostnames locally even with a proxy.
    pub resolve: bool,

    /// Log level.
    pub log_level: String,
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments and the peers file.
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let mut peers = PeersFile::default();
        for peer in cli.peers.iter().flatten() {
            // Peers named on the command line are kept connected
            peers.insert(PeerEntry::new(peer.clone(), true));
        }
        if let Some(path) = &cli.peers_file {
            for entry in PeersFile::load(path)?.peers {
                peers.insert(entry);
            }
        }

        Ok(Self {
            network: cli.network,
            listen: (!cli.no_listen).then_some(cli.listen),
            peers: peers.peers,
            peers_file: cli.peers_file.clone(),
            target_outbound: cli.target_outbound,
            max_inbound: cli.max_inbound,
            proxy: cli.proxy,
            resolve: cli.resolve,
            log_level: cli.log_level.clone(),
        })
    }

    /// Engine configuration.
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig::default()
    }

    /// Options shared by every outbound connection.
    pub fn connection_options(&self, persistent: bool) -> ConnectionOptions {
        let resolve = if self.proxy.is_some() && !self.resolve {
            ResolveMode::NoResolve
        } else {
            ResolveMode::Resolve
        };
        ConnectionOptions::default()
            .with_retries(PEER_RETRIES)
            .with_persistent(persistent)
            .with_resolve(resolve)
    }

    /// Outbound descriptor for a peer entry.
    pub fn descriptor(&self, entry: &PeerEntry) -> anyhow::Result<ConnectionDescriptor> {
        let address = parse_peer(&entry.address, self.network.default_port())?;
        let mut descriptor = ConnectionDescriptor::new(
            address,
            self.connection_options(entry.persistent),
            self.network.config(),
        );
        if let Some(proxy) = self.proxy {
            descriptor = descriptor.with_proxy(ProxyDescriptor::new(proxy));
        }
        Ok(descriptor)
    }

    /// Listener descriptor, if listening.
    pub fn listener(&self) -> Option<ListenerDescriptor> {
        self.listen.map(|addr| {
            ListenerDescriptor::new(addr, ConnectionOptions::default(), self.network.config())
                .with_max_incoming(self.max_inbound)
        })
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            listen: Some(SocketAddr::from(([0, 0, 0, 0], 8333))),
            peers: Vec::new(),
            peers_file: None,
            target_outbound: 8,
            max_inbound: 125,
            proxy: None,
            resolve: false,
            log_level: "info".to_string(),
        }
    }
}
