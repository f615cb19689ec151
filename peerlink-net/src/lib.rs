//! Connection management for header-framed P2P wire protocols.
//!
//! This crate keeps a set of TCP peer connections for protocols framed the
//! way Bitcoin frames its messages: a fixed-size header carrying a magic
//! prefix, a command string and a payload length. It provides:
//!
//! - Outgoing connections, direct, via DNS or through a SOCKS5 proxy, with
//!   retries and persistent reconnects
//! - Listeners with per-listener capacity
//! - Message framing, send-buffer watermarks and pausable receiving
//! - Per-connection and aggregate rate limits
//!
//! It does not interpret message payloads.
//!
//! # Architecture
//!
//! Every socket, lookup and timer runs as a task on a single-threaded tokio
//! runtime owned by the engine. Tasks report back over one channel, and all
//! state changes and callbacks happen on the thread that pumps the engine.
//!
//! ```text
//! ConnectionHandler::pump()
//! ├── Demand ticker        (asks for outgoing descriptors)
//! ├── Attempt tasks        (lookup, connect, SOCKS5)
//! ├── Listener tasks       (accept)
//! └── Connection tasks     (framed read/write loop)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use peerlink_net::{ConnectionHandler, HandlerConfig, NetHandle, NetworkEvents};
//!
//! struct Node;
//! impl NetworkEvents for Node {
//!     fn on_ready_for_first_send(&mut self, net: &NetHandle, id: ConnId) {
//!         let _ = net.send(id, &version_message());
//!     }
//! }
//!
//! let mut handler = ConnectionHandler::new(HandlerConfig::default(), Node)?;
//! handler.start(8)?;
//! handler.run();
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod events;
pub mod handle;
pub mod handler;
pub(crate) mod manager;
pub mod peer;
pub mod protocol;

// Re-export main types
pub use config::{AddressFamily, ConnectionOptions, HandlerConfig, NetworkConfig, ResolveMode};
pub use dns::{DnsResolver, HostResolver, LookupFuture};
pub use error::{NetError, NetResult};
pub use events::{ConnectionFailure, FailureKind, NetworkEvents};
pub use handler::{ConnectionHandler, NetHandle};
pub use manager::ratelimit::RateLimit;
pub use peer::{
    Address, ConnId, ConnState, ConnectionDescriptor, ConnectionDirection, ConnectionInfo, ListenerDescriptor,
    ProxyAuth, ProxyDescriptor,
};
pub use protocol::{FrameCodec, RawMessage};
