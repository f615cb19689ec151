//! Engine, connection and network framing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Bitcoin main network magic bytes.
pub const BITCOIN_MAINNET_MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// Bitcoin test network (testnet3) magic bytes.
pub const BITCOIN_TESTNET_MAGIC: [u8; 4] = [0x0b, 0x11, 0x09, 0x07];

/// Bitcoin regression test network magic bytes.
pub const BITCOIN_REGTEST_MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

/// Bitcoin header size: magic(4) + command(12) + length(4) + checksum(4).
pub const BITCOIN_HEADER_SIZE: usize = 24;

/// Largest Bitcoin payload accepted by the presets.
pub const BITCOIN_MAX_PAYLOAD: usize = 1_000_000;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout before the first byte moves on a new connection.
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default steady-state receive timeout.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(60 * 20);

/// Default steady-state send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60 * 20);

/// Default outbound buffer high watermark in bytes.
pub const DEFAULT_MAX_SEND_BUFFER: usize = 5_000_000;

/// Default delay before a retry attempt.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default period of the "need more outgoing connections" timer.
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_millis(500);

/// Default cap on attempts in flight at once.
pub const DEFAULT_MAX_SIMULTANEOUS_CONNECTING: usize = 8;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Upper bound on outgoing attempts in flight at the same time.
    pub max_simultaneous_connecting: usize,

    /// Period of the outgoing demand timer.
    pub request_interval: Duration,

    /// Allow the cross-thread entry points to be called off the event thread.
    pub enable_threading: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_connecting: DEFAULT_MAX_SIMULTANEOUS_CONNECTING,
            request_interval: DEFAULT_REQUEST_INTERVAL,
            enable_threading: false,
        }
    }
}

impl HandlerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of simultaneous outgoing attempts.
    pub fn with_max_simultaneous_connecting(mut self, count: usize) -> Self {
        self.max_simultaneous_connecting = count;
        self
    }

    /// Set the outgoing demand timer period.
    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.request_interval = interval;
        self
    }

    /// Enable or disable cross-thread calls.
    pub fn with_threading(mut self, enabled: bool) -> Self {
        self.enable_threading = enabled;
        self
    }
}

/// How a hostname in a descriptor is turned into addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolveMode {
    /// Never resolve locally. Hostnames are only usable through a proxy.
    #[default]
    NoResolve,
    /// Resolve and report the results; never connect.
    ResolveOnly,
    /// Resolve, then connect to the results in order.
    Resolve,
}

/// Address families accepted from resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressFamily {
    /// Any family.
    #[default]
    Unspecified,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

impl AddressFamily {
    /// Whether an address belongs to this family.
    pub fn matches(&self, ip: &std::net::IpAddr) -> bool {
        match self {
            AddressFamily::Unspecified => true,
            AddressFamily::Ipv4 => ip.is_ipv4(),
            AddressFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Per-connection behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Retry budget. Negative means unlimited.
    pub retries: i32,
    /// Reconnect after any disconnect (outgoing only).
    pub persistent: bool,
    /// Delay before each retry or reconnect.
    pub retry_interval: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Timeout until the first byte is read or written.
    pub initial_timeout: Duration,
    /// Steady-state receive timeout.
    pub recv_timeout: Duration,
    /// Steady-state send timeout.
    pub send_timeout: Duration,
    /// Outbound buffer high watermark. Zero disables backpressure signals.
    pub max_send_buffer: usize,
    /// Hostname resolution behavior.
    pub resolve: ResolveMode,
    /// Families accepted from resolution.
    pub family: AddressFamily,
    /// Cap on resolved candidates. Zero keeps all.
    pub max_lookup_results: usize,
    /// Opaque flag for the collaborator.
    pub whitelisted: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            persistent: false,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_send_buffer: DEFAULT_MAX_SEND_BUFFER,
            resolve: ResolveMode::NoResolve,
            family: AddressFamily::Unspecified,
            max_lookup_results: 0,
            whitelisted: false,
        }
    }
}

impl ConnectionOptions {
    /// Set the retry budget.
    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Mark the connection persistent.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the initial timeout.
    pub fn with_initial_timeout(mut self, timeout: Duration) -> Self {
        self.initial_timeout = timeout;
        self
    }

    /// Set both steady-state timeouts.
    pub fn with_io_timeouts(mut self, recv: Duration, send: Duration) -> Self {
        self.recv_timeout = recv;
        self.send_timeout = send;
        self
    }

    /// Set the outbound buffer high watermark.
    pub fn with_max_send_buffer(mut self, bytes: usize) -> Self {
        self.max_send_buffer = bytes;
        self
    }

    /// Set the resolve mode.
    pub fn with_resolve(mut self, mode: ResolveMode) -> Self {
        self.resolve = mode;
        self
    }

    /// Set the accepted address family.
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    /// Cap the number of resolved candidates.
    pub fn with_max_lookup_results(mut self, count: usize) -> Self {
        self.max_lookup_results = count;
        self
    }
}

/// Header layout of a framed wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Offset of the command string.
    pub header_msg_string_offset: usize,
    /// Width of the command string.
    pub header_msg_string_size: usize,
    /// Offset of the little-endian payload length.
    pub header_msg_size_offset: usize,
    /// Width of the payload length. Must be 4.
    pub header_msg_size_size: usize,
    /// Total header size.
    pub header_size: usize,
    /// Largest accepted message including its header. Zero disables the check.
    pub message_max_size: usize,
    /// Magic prefix expected at offset 0. Empty disables the check.
    pub message_start: Vec<u8>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::bitcoin_mainnet()
    }
}

impl NetworkConfig {
    /// Bitcoin layout with the given magic.
    pub fn bitcoin(magic: [u8; 4]) -> Self {
        Self {
            header_msg_string_offset: 4,
            header_msg_string_size: 12,
            header_msg_size_offset: 16,
            header_msg_size_size: 4,
            header_size: BITCOIN_HEADER_SIZE,
            message_max_size: BITCOIN_MAX_PAYLOAD + BITCOIN_HEADER_SIZE,
            message_start: magic.to_vec(),
        }
    }

    /// Bitcoin main network.
    pub fn bitcoin_mainnet() -> Self {
        Self::bitcoin(BITCOIN_MAINNET_MAGIC)
    }

    /// Bitcoin testnet3.
    pub fn bitcoin_testnet() -> Self {
        Self::bitcoin(BITCOIN_TESTNET_MAGIC)
    }

    /// Bitcoin regtest.
    pub fn bitcoin_regtest() -> Self {
        Self::bitcoin(BITCOIN_REGTEST_MAGIC)
    }

    /// Set the maximum message size.
    pub fn with_message_max_size(mut self, size: usize) -> Self {
        self.message_max_size = size;
        self
    }

    /// Bytes needed before the length field can be read.
    pub fn size_needed(&self) -> usize {
        self.header_msg_size_offset + self.header_msg_size_size
    }

    /// Check the layout is internally consistent.
    pub fn validate(&self) -> NetResult<()> {
        if self.header_msg_size_size != 4 {
            return Err(NetError::InvalidConfig(format!(
                "length field must be 4 bytes, got {}",
                self.header_msg_size_size
            )));
        }
        if self.size_needed() > self.header_size {
            return Err(NetError::InvalidConfig(
                "length field extends past the header".to_string(),
            ));
        }
        if self.header_msg_string_offset + self.header_msg_string_size > self.header_size {
            return Err(NetError::InvalidConfig(
                "command field extends past the header".to_string(),
            ));
        }
        if self.message_start.len() > self.size_needed() {
            return Err(NetError::InvalidConfig(
                "magic prefix is longer than the minimal header".to_string(),
            ));
        }
        if self.message_max_size != 0 && self.message_max_size < self.header_size {
            return Err(NetError::InvalidConfig(
                "maximum message size is smaller than the header".to_string(),
            ));
        }
        Ok(())
    }
}
