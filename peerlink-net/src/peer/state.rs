//! Connection state.

use std::fmt;

/// Where a tracked id is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for DNS or a proxy RESOLVE answer.
    Resolving,
    /// Connecting, handshaking with a proxy, or waiting to retry.
    Connecting,
    /// Established and exchanging bytes.
    Connected,
    /// Reads disabled, flushing the send buffer before closing.
    DisconnectingDrain,
    /// Released. Nothing more will be reported for this id.
    Terminal,
}

impl ConnState {
    /// Check if the id still owns an establishment resource.
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnState::Resolving | ConnState::Connecting)
    }

    /// Check if the connection is established, draining or not.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnState::Connected | ConnState::DisconnectingDrain)
    }

    /// Check if the connection is on its way out.
    pub fn is_disconnecting(&self) -> bool {
        matches!(self, ConnState::DisconnectingDrain | ConnState::Terminal)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Resolving => write!(f, "resolving"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected => write!(f, "connected"),
            ConnState::DisconnectingDrain => write!(f, "draining"),
            ConnState::Terminal => write!(f, "terminal"),
        }
    }
}
