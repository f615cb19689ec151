//! Node orchestrator.
//!
//! Feeds configured peers to the connection engine, remembers which ones
//! answered, and pumps the engine until a signal asks it to stop.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;

use peerlink_net::protocol::command_name;
use peerlink_net::{
    Address, ConnId, ConnectionDescriptor, ConnectionFailure, ConnectionHandler, ListenerDescriptor, NetError,
    NetHandle, NetworkConfig, NetworkEvents,
};

use crate::config::{NodeConfig, PeerEntry, PeersFile};
use crate::shutdown::spawn_signal_watcher;

/// Candidate peers and their connection status.
pub struct PeerBook {
    /// Node configuration.
    config: NodeConfig,
    /// Wire network, for logging commands.
    network: NetworkConfig,
    /// Peers not currently being dialed.
    candidates: VecDeque<PeerEntry>,
    /// Peers handed to the engine, by requested address.
    in_flight: HashMap<Address, PeerEntry>,
    /// Connected outbound peers.
    connected: HashMap<ConnId, PeerEntry>,
    /// Listener still to be requested.
    listener: Option<ListenerDescriptor>,
    /// Peers that completed a connection.
    known: PeersFile,
    /// Live inbound connections.
    inbound: usize,
    /// Bound listen address.
    local_addr: Option<SocketAddr>,
}

impl PeerBook {
    /// Create a book holding the configured peers.
    pub fn new(config: NodeConfig) -> Self {
        let known = PeersFile {
            peers: config.peers.clone(),
        };
        Self {
            network: config.network.config(),
            candidates: config.peers.iter().cloned().collect(),
            in_flight: HashMap::new(),
            connected: HashMap::new(),
            listener: config.listener(),
            known,
            inbound: 0,
            local_addr: None,
            config,
        }
    }

    /// Peers worth remembering.
    pub fn known_peers(&self) -> &PeersFile {
        &self.known
    }

    /// Number of peers waiting to be dialed.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Number of connected outbound peers.
    pub fn outbound_count(&self) -> usize {
        self.connected.len()
    }

    /// Number of live inbound connections.
    pub fn inbound_count(&self) -> usize {
        self.inbound
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// An attempt for `entry` is over; keep persistent peers in rotation.
    fn release(&mut self, entry: PeerEntry) {
        if entry.persistent {
            self.candidates.push_back(entry);
        } else {
            tracing::debug!(peer = %entry.address, "Dropping peer from rotation");
        }
    }
}

impl NetworkEvents for PeerBook {
    fn on_startup(&mut self, _net: &NetHandle) {
        tracing::info!(peers = self.candidates.len(), "Engine started");
    }

    fn on_shutdown(&mut self, _net: &NetHandle) {
        tracing::info!(known = self.known.peers.len(), "Engine stopped");
    }

    fn need_outgoing_connections(&mut self, _net: &NetHandle, count: usize) -> Vec<ConnectionDescriptor> {
        let mut descriptors = Vec::with_capacity(count);
        while descriptors.len() < count {
            let Some(entry) = self.candidates.pop_front() else {
                break;
            };
            match self.config.descriptor(&entry) {
                Ok(descriptor) => {
                    tracing::debug!(peer = %entry.address, "Dialing peer");
                    self.in_flight.insert(descriptor.address.clone(), entry);
                    descriptors.push(descriptor);
                }
                Err(e) => {
                    tracing::warn!(peer = %entry.address, error = %e, "Skipping unusable peer address");
                }
            }
        }
        descriptors
    }

    fn need_incoming_listener(&mut self, _net: &NetHandle) -> Option<ListenerDescriptor> {
        self.listener.take()
    }

    fn on_bind(&mut self, _net: &NetHandle, id: ConnId, _descriptor: &ListenerDescriptor, local_addr: SocketAddr) {
        tracing::info!(listener = %id, addr = %local_addr, "Accepting inbound peers");
        self.local_addr = Some(local_addr);
    }

    fn on_bind_failure(
        &mut self,
        _net: &NetHandle,
        id: ConnId,
        descriptor: &ListenerDescriptor,
        error: &NetError,
        retry: Option<ConnId>,
    ) {
        tracing::warn!(
            listener = %id,
            addr = %descriptor.bind_addr,
            error = %error,
            retry = ?retry,
            "Failed to listen"
        );
    }

    fn on_connection_failure(&mut self, _net: &NetHandle, failure: &ConnectionFailure) {
        tracing::debug!(
            conn = %failure.id,
            peer = %failure.failed.address,
            kind = %failure.kind,
            error = %failure.error,
            "Peer connection failed"
        );
        if !failure.will_retry() {
            if let Some(entry) = self.in_flight.remove(&failure.requested.address) {
                self.release(entry);
            }
        }
    }

    fn on_proxy_failure(&mut self, net: &NetHandle, failure: &ConnectionFailure) {
        self.on_connection_failure(net, failure);
    }

    fn on_outgoing_connection(
        &mut self,
        _net: &NetHandle,
        id: ConnId,
        requested: &ConnectionDescriptor,
        resolved: &ConnectionDescriptor,
    ) -> bool {
        let Some(entry) = self.in_flight.remove(&requested.address) else {
            tracing::warn!(conn = %id, peer = %requested.address, "Connected to a peer we did not ask for");
            return false;
        };
        tracing::info!(conn = %id, peer = %entry.address, addr = %resolved.address, "Connected to peer");
        self.known.insert(entry.clone());
        self.connected.insert(id, entry);
        true
    }

    fn on_incoming_connection(
        &mut self,
        _net: &NetHandle,
        id: ConnId,
        _listener: &ListenerDescriptor,
        peer: SocketAddr,
        _listener_count: usize,
        total_incoming: usize,
    ) -> bool {
        tracing::info!(conn = %id, addr = %peer, total_incoming, "Inbound peer connected");
        self.inbound += 1;
        true
    }

    fn on_disconnected(&mut self, _net: &NetHandle, id: ConnId, will_reconnect: bool) -> bool {
        match self.connected.remove(&id) {
            Some(entry) if will_reconnect => {
                tracing::info!(conn = %id, peer = %entry.address, "Peer disconnected, reconnecting");
                if let Ok(descriptor) = self.config.descriptor(&entry) {
                    self.in_flight.insert(descriptor.address, entry);
                }
            }
            Some(entry) => {
                tracing::info!(conn = %id, peer = %entry.address, "Peer disconnected");
                self.release(entry);
            }
            None => {
                tracing::info!(conn = %id, "Inbound peer disconnected");
                self.inbound = self.inbound.saturating_sub(1);
            }
        }
        true
    }

    fn on_receive_messages(&mut self, _net: &NetHandle, id: ConnId, messages: Vec<Bytes>, total_bytes: usize) -> bool {
        for message in &messages {
            let command = command_name(&self.network, message).unwrap_or("?");
            tracing::debug!(conn = %id, command, size = message.len(), "Received message");
        }
        tracing::trace!(conn = %id, count = messages.len(), total_bytes, "Received batch");
        true
    }

    fn on_malformed_message(&mut self, _net: &NetHandle, id: ConnId, error: &NetError) {
        tracing::warn!(conn = %id, error = %error, "Peer sent a malformed message");
    }

    fn on_write_buffer_full(&mut self, net: &NetHandle, id: ConnId, size: usize) {
        tracing::debug!(conn = %id, size, "Peer is not reading, pausing receive");
        let _ = net.pause_recv(id);
    }

    fn on_write_buffer_ready(&mut self, net: &NetHandle, id: ConnId, size: usize) {
        tracing::debug!(conn = %id, size, "Peer caught up, resuming receive");
        let _ = net.unpause_recv(id);
    }
}

/// The node: configuration plus the engine loop.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,
}

impl Node {
    /// Create a new node with the given configuration.
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run until a shutdown signal arrives.
    pub fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting peerlink node...");
        tracing::info!("  Network: {:?}", self.config.network);
        match self.config.listen {
            Some(addr) => tracing::info!("  Listen address: {}", addr),
            None => tracing::info!("  Listening disabled"),
        }
        tracing::info!("  Outbound target: {}", self.config.target_outbound);
        tracing::info!("  Configured peers: {}", self.config.peers.len());
        if let Some(proxy) = self.config.proxy {
            tracing::info!("  SOCKS5 proxy: {}", proxy);
        }

        let book = PeerBook::new(self.config.clone());
        let mut handler = ConnectionHandler::new(self.config.handler_config(), book)?;
        let _signals = spawn_signal_watcher(handler.handle())?;

        handler.start(self.config.target_outbound)?;
        handler.run();

        if let Some(path) = &self.config.peers_file {
            handler.events().known_peers().save(path)?;
            tracing::info!("Saved known peers to {}", path.display());
        }

        tracing::info!("Node shutdown complete");
        Ok(())
    }
}
