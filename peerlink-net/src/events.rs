//! Upward notifications from the engine.
//!
//! A [`NetworkEvents`] implementation is the engine's only collaborator: it
//! supplies outgoing and listening descriptors on demand and is told about
//! every state change. All methods run on the event thread, never
//! concurrently and never reentrantly. For a given id, the failure or
//! disconnect notification is always the last one.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::NetError;
use crate::handler::NetHandle;
use crate::peer::{ConnId, ConnectionDescriptor, ListenerDescriptor};

/// Stage at which an outgoing attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// TCP connect to the target.
    Connect,
    /// Hostname resolution.
    Resolve,
    /// Connect to, or handshake with, the SOCKS5 proxy.
    Proxy,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Connect => write!(f, "connect"),
            FailureKind::Resolve => write!(f, "resolve"),
            FailureKind::Proxy => write!(f, "proxy"),
        }
    }
}

/// Report of one failed outgoing attempt.
#[derive(Debug)]
pub struct ConnectionFailure {
    /// The attempt that failed. Released after this report.
    pub id: ConnId,
    /// Where it failed.
    pub kind: FailureKind,
    /// Descriptor as requested.
    pub requested: ConnectionDescriptor,
    /// Descriptor that actually failed; the resolved candidate for DNS.
    pub failed: ConnectionDescriptor,
    /// Underlying error.
    pub error: NetError,
    /// Id of the follow-up attempt, if a retry is armed.
    pub retry: Option<ConnId>,
}

impl ConnectionFailure {
    /// Whether another attempt will follow.
    pub fn will_retry(&self) -> bool {
        self.retry.is_some()
    }
}

/// Engine callbacks. Every method has a do-nothing default.
#[allow(unused_variables)]
pub trait NetworkEvents {
    /// The engine started.
    fn on_startup(&mut self, net: &NetHandle) {}

    /// The engine finished shutting down. Nothing follows.
    fn on_shutdown(&mut self, net: &NetHandle) {}

    /// Up to `count` outgoing connections are wanted.
    fn need_outgoing_connections(&mut self, net: &NetHandle, count: usize) -> Vec<ConnectionDescriptor> {
        Vec::new()
    }

    /// Polled at start until it returns `None`.
    fn need_incoming_listener(&mut self, net: &NetHandle) -> Option<ListenerDescriptor> {
        None
    }

    /// A listener is accepting.
    fn on_bind(&mut self, net: &NetHandle, id: ConnId, descriptor: &ListenerDescriptor, local_addr: SocketAddr) {}

    /// A requested listener failed to bind. `retry` is the id of the next try.
    fn on_bind_failure(
        &mut self,
        net: &NetHandle,
        id: ConnId,
        descriptor: &ListenerDescriptor,
        error: &NetError,
        retry: Option<ConnId>,
    ) {
    }

    /// A resolve-only request finished. Each result targets one address.
    fn on_dns_response(
        &mut self,
        net: &NetHandle,
        id: ConnId,
        descriptor: &ConnectionDescriptor,
        results: Vec<ConnectionDescriptor>,
    ) {
    }

    /// A resolve-only request failed.
    fn on_dns_failure(
        &mut self,
        net: &NetHandle,
        id: ConnId,
        descriptor: &ConnectionDescriptor,
        error: &NetError,
        retry: Option<ConnId>,
    ) {
    }

    /// A direct or DNS attempt failed.
    fn on_connection_failure(&mut self, net: &NetHandle, failure: &ConnectionFailure) {}

    /// A proxied attempt failed before the proxy accepted the request.
    fn on_proxy_failure(&mut self, net: &NetHandle, failure: &ConnectionFailure) {}

    /// An outgoing connection is established.
    ///
    /// `resolved` is the address actually dialed: the resolved candidate for
    /// a hostname, or the request itself for direct and proxied attempts.
    /// Returning false drops the socket and reports a connection failure
    /// for `id`, with a retry if the budget allows one.
    fn on_outgoing_connection(
        &mut self,
        net: &NetHandle,
        id: ConnId,
        requested: &ConnectionDescriptor,
        resolved: &ConnectionDescriptor,
    ) -> bool {
        true
    }

    /// A connection was accepted. Return false to drop it.
    ///
    /// `listener_count` and `total_incoming` include this connection.
    fn on_incoming_connection(
        &mut self,
        net: &NetHandle,
        id: ConnId,
        listener: &ListenerDescriptor,
        peer: SocketAddr,
        listener_count: usize,
        total_incoming: usize,
    ) -> bool {
        true
    }

    /// A connection is gone. When `will_reconnect` is set, returning false
    /// cancels the reconnect.
    fn on_disconnected(&mut self, net: &NetHandle, id: ConnId, will_reconnect: bool) -> bool {
        true
    }

    /// The connection accepts data.
    fn on_ready_for_first_send(&mut self, net: &NetHandle, id: ConnId) {}

    /// Complete messages arrived, headers included. Return false to close
    /// the connection once its send buffer drains.
    fn on_receive_messages(&mut self, net: &NetHandle, id: ConnId, messages: Vec<Bytes>, total_bytes: usize) -> bool {
        true
    }

    /// The peer broke framing. A disconnect follows.
    fn on_malformed_message(&mut self, net: &NetHandle, id: ConnId, error: &NetError) {}

    /// The send buffer reached its high watermark.
    fn on_write_buffer_full(&mut self, net: &NetHandle, id: ConnId, size: usize) {}

    /// The send buffer drained back to its high watermark or below.
    fn on_write_buffer_ready(&mut self, net: &NetHandle, id: ConnId, size: usize) {}

    /// Bytes were received.
    fn on_bytes_read(&mut self, net: &NetHandle, id: ConnId, delta: usize, total: u64) {}

    /// Bytes were sent.
    fn on_bytes_written(&mut self, net: &NetHandle, id: ConnId, delta: usize, total: u64) {}

    /// The ping deadline passed. Whether to disconnect is up to the caller.
    fn on_ping_timeout(&mut self, net: &NetHandle, id: ConnId) {}
}
