//! Connection identity and per-connection I/O.
//!
//! This module provides:
//! - Connection ids, descriptors and info snapshots
//! - The per-connection state enum
//! - The read/write task that owns an established socket

pub(crate) mod connection;
pub mod info;
pub mod state;

// Re-export main types
pub use info::{
    Address, ConnId, ConnectionDescriptor, ConnectionDirection, ConnectionInfo, ListenerDescriptor,
    ProxyAuth, ProxyDescriptor,
};
pub use state::ConnState;
