//! Engine internals.
//!
//! Tracks the four connection collections, runs establishment strategies and
//! listeners, and shapes traffic. Every task reports back through one channel
//! of [`EngineEvent`]s, consumed on the event thread by the handler.

pub mod inbound;
pub mod outbound;
pub mod ratelimit;
pub mod slots;

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::error::NetResult;
use crate::peer::connection::ConnEvent;
use crate::peer::ConnId;

pub use inbound::Listener;
pub use outbound::{Attempt, AttemptStage, Launcher, Strategy};
pub use ratelimit::{ConnLimiter, RateGroup, RateLimit};
pub use slots::{Connected, ConnectionSlots, ListenerEntry, Registry};

/// A completion posted to the event thread.
///
/// Every variant that names an id is dropped if that id is no longer tracked.
#[derive(Debug)]
pub enum EngineEvent {
    /// Periodic outgoing demand tick.
    RequestOutgoing,
    /// Shutdown requested, possibly from another thread.
    Shutdown,
    /// Retry timer of an outgoing attempt fired.
    RetryDue(ConnId),
    /// Retry timer of a listener bind fired.
    BindRetryDue(ConnId),
    /// A lookup finished.
    Resolved {
        id: ConnId,
        result: NetResult<Vec<SocketAddr>>,
    },
    /// A connect, including any proxy handshake, finished.
    Established {
        id: ConnId,
        result: NetResult<(TcpStream, SocketAddr)>,
    },
    /// A listener accepted a socket.
    Accepted {
        listener: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
    },
    /// Something happened on an established connection.
    Conn { id: ConnId, event: ConnEvent },
}
