//! Engine error types.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::peer::ConnId;

/// Errors produced by the connection engine.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Message exceeds maximum allowed size.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The stream lost sync: magic prefix mismatch.
    #[error("Invalid network magic: expected {expected:02x?}, got {actual:02x?}")]
    InvalidMagic { expected: Vec<u8>, actual: Vec<u8> },

    /// TCP connect did not complete in time.
    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: SocketAddr },

    /// An established connection went quiet for too long.
    #[error("{0} timeout")]
    Timeout(&'static str),

    /// DNS resolution failed.
    #[error("DNS resolution failed for {host}: {error}")]
    DnsResolutionFailed { host: String, error: String },

    /// DNS resolution succeeded but produced no usable address.
    #[error("No usable addresses for {host}")]
    NoAddresses { host: String },

    /// The SOCKS5 proxy sent something we could not interpret.
    #[error("SOCKS5 protocol error: {0}")]
    ProxyProtocol(String),

    /// The SOCKS5 proxy refused the request.
    #[error("SOCKS5 request rejected with reply code {reply:#04x}")]
    ProxyRejected { reply: u8 },

    /// The SOCKS5 proxy accepted none of the offered methods.
    #[error("SOCKS5 proxy accepted no offered authentication method")]
    ProxyNoAcceptableMethod,

    /// Username/password authentication was refused.
    #[error("SOCKS5 authentication failed")]
    ProxyAuthFailed,

    /// A domain name cannot be encoded in a SOCKS5 request.
    #[error("Domain name too long for SOCKS5: {len} bytes")]
    DomainTooLong { len: usize },

    /// Invalid peer or listener address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration values.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No connected peer with this id.
    #[error("Not connected: {0}")]
    NotConnected(ConnId),

    /// The connection is already being torn down.
    #[error("Connection is disconnecting: {0}")]
    Disconnecting(ConnId),

    /// The collaborator declined a fresh outgoing connection.
    #[error("Connection declined: {0}")]
    Declined(ConnId),

    /// Unpause without a matching pause.
    #[error("Receiving is not paused: {0}")]
    NotPaused(ConnId),

    /// `start` was called twice.
    #[error("Engine already started")]
    AlreadyStarted,

    /// Engine is shutting down.
    #[error("Engine shutting down")]
    Shutdown,
}

impl NetError {
    /// Raw OS error code, if this error came from the operating system.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            NetError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether the error means the byte stream cannot be trusted anymore.
    pub fn is_malformed_stream(&self) -> bool {
        matches!(
            self,
            NetError::InvalidMagic { .. } | NetError::MessageTooLarge { .. }
        )
    }
}

/// Result type for engine operations.
pub type NetResult<T> = Result<T, NetError>;
