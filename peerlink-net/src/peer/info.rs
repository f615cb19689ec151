//! Connection identifiers and descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::config::{ConnectionOptions, NetworkConfig, ResolveMode};

/// Identifier of one connection attempt, connection or listener.
///
/// Retries and reconnects always get a fresh id, so completions that belong
/// to an abandoned attempt can be recognized and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Create a connection ID from a counter value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// Peer connected to us.
    Inbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outbound => write!(f, "outbound"),
            ConnectionDirection::Inbound => write!(f, "inbound"),
        }
    }
}

/// Where to connect: a socket address or a hostname with a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Numeric address.
    Socket(SocketAddr),
    /// Hostname and port.
    Host { host: String, port: u16 },
}

impl Address {
    /// Build a hostname address. Numeric hosts become [`Address::Socket`].
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Host { host, port },
        }
    }

    /// Port component.
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Host { port, .. } => *port,
        }
    }

    /// Numeric address, if this is one.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Host { .. } => None,
        }
    }

    /// Whether this names a host that needs resolution.
    pub fn is_dns(&self) -> bool {
        matches!(self, Address::Host { .. })
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Host { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Username/password credentials for a SOCKS5 proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    /// Username, at most 255 bytes.
    pub username: String,
    /// Password, at most 255 bytes.
    pub password: String,
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A SOCKS5 proxy to route a connection through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Proxy address. Hostnames are resolved before connecting.
    pub address: Address,
    /// Optional credentials.
    pub auth: Option<ProxyAuth>,
}

impl ProxyDescriptor {
    /// A proxy without authentication.
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            auth: None,
        }
    }

    /// Attach username/password credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// Everything needed to establish one outgoing connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Target address.
    pub address: Address,
    /// Connection behavior.
    pub options: ConnectionOptions,
    /// Framing parameters for messages on this connection.
    pub network: NetworkConfig,
    /// Optional SOCKS5 proxy.
    pub proxy: Option<ProxyDescriptor>,
}

impl ConnectionDescriptor {
    /// Create a descriptor without a proxy.
    pub fn new(address: impl Into<Address>, options: ConnectionOptions, network: NetworkConfig) -> Self {
        Self {
            address: address.into(),
            options,
            network,
            proxy: None,
        }
    }

    /// Route through a proxy.
    pub fn with_proxy(mut self, proxy: ProxyDescriptor) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Copy of this descriptor pointing at a resolved address.
    pub fn resolved(&self, addr: SocketAddr) -> Self {
        let mut options = self.options.clone();
        options.resolve = ResolveMode::NoResolve;
        Self {
            address: Address::Socket(addr),
            options,
            network: self.network.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proxy {
            Some(proxy) => write!(f, "{} via {}", self.address, proxy.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// A local address to accept connections on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDescriptor {
    /// Address to bind.
    pub bind_addr: SocketAddr,
    /// Options applied to accepted connections and to bind retries.
    pub options: ConnectionOptions,
    /// Framing parameters for accepted connections.
    pub network: NetworkConfig,
    /// Stop accepting at this many live connections. Zero means no limit.
    pub max_incoming: usize,
}

impl ListenerDescriptor {
    /// Create a listener descriptor.
    pub fn new(bind_addr: SocketAddr, options: ConnectionOptions, network: NetworkConfig) -> Self {
        Self {
            bind_addr,
            options,
            network,
            max_incoming: 0,
        }
    }

    /// Limit live incoming connections on this listener.
    pub fn with_max_incoming(mut self, max: usize) -> Self {
        self.max_incoming = max;
        self
    }
}

/// Snapshot of a connected peer.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnId,
    /// Remote socket address (the proxy target is not visible here).
    pub remote: SocketAddr,
    /// Direction of the connection.
    pub direction: ConnectionDirection,
    /// Listener that accepted it, for inbound connections.
    pub listener: Option<ConnId>,
    /// When the connection was established.
    pub connected_at: Instant,
    /// Total bytes received.
    pub bytes_read: u64,
    /// Total bytes sent.
    pub bytes_written: u64,
}

impl ConnectionInfo {
    /// Create info for a new connection.
    pub fn new(id: ConnId, remote: SocketAddr, direction: ConnectionDirection) -> Self {
        Self {
            id,
            remote,
            direction,
            listener: None,
            connected_at: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Check if this is an outbound connection.
    pub fn is_outbound(&self) -> bool {
        self.direction == ConnectionDirection::Outbound
    }

    /// Get the connection duration.
    pub fn connection_duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.remote, self.direction)
    }
}
