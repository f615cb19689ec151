//! SOCKS5 client handshake (RFC 1928, RFC 1929).
//!
//! [`Socks5Handshake`] is a byte-level state machine. It always knows exactly
//! how many bytes it needs next ([`Socks5Handshake::bytes_needed`]), consumes
//! precisely that many, and answers with the bytes to write. [`handshake`]
//! drives it over any async stream.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, NetResult};
use crate::peer::{Address, ProxyAuth};

pub const SOCKS_VER_5: u8 = 0x05;
pub const SOCKS_AUTH_VER: u8 = 0x01;

pub const SOCKS_AUTH_NONE: u8 = 0x00;
pub const SOCKS_AUTH_USRPWD: u8 = 0x02;
pub const SOCKS_AUTH_NO_ACCEPTABLE: u8 = 0xff;

pub const SOCKS_CMD_CONNECT: u8 = 0x01;
/// Tor extension: resolve a hostname without connecting.
pub const SOCKS_CMD_RESOLVE: u8 = 0xf0;

pub const SOCKS_ATYP_INET4: u8 = 0x01;
pub const SOCKS_ATYP_DOMAIN: u8 = 0x03;
pub const SOCKS_ATYP_INET6: u8 = 0x04;

pub const SOCKS_REPLY_OK: u8 = 0x00;

/// Size of the reply prefix read before the address type is known.
const REPLY_PREFIX_LEN: usize = 5;

/// What to ask the proxy for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Command {
    /// Open a stream to the target.
    Connect,
    /// Resolve the target hostname and report the address.
    Resolve,
}

impl Socks5Command {
    fn code(self) -> u8 {
        match self {
            Socks5Command::Connect => SOCKS_CMD_CONNECT,
            Socks5Command::Resolve => SOCKS_CMD_RESOLVE,
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    /// Waiting for the method selection reply.
    NegotiateMethods,
    /// Waiting for the username/password verdict.
    Authenticate,
    /// Request sent, waiting for the fixed reply prefix.
    AwaitReply,
    /// Waiting for the rest of the bound address.
    AwaitReplyAddress { atyp: u8, remaining: usize },
    /// Handshake finished.
    Done,
}

/// Outcome of feeding bytes to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Step {
    /// Write these bytes, then read `bytes_needed` more.
    Send(Vec<u8>),
    /// Read `bytes_needed` more.
    Read,
    /// The proxy reported success with this bound address.
    Done(Option<SocketAddr>),
}

/// SOCKS5 client state machine.
#[derive(Debug, Clone)]
pub struct Socks5Handshake {
    command: Socks5Command,
    target: Address,
    auth: Option<ProxyAuth>,
    state: Socks5State,
    /// First byte of the bound address, carried over from the reply prefix.
    addr_prefix: u8,
}

impl Socks5Handshake {
    /// Start a handshake for `target`.
    pub fn new(command: Socks5Command, target: Address, auth: Option<ProxyAuth>) -> NetResult<Self> {
        if let Address::Host { host, .. } = &target {
            if host.is_empty() {
                return Err(NetError::InvalidAddress("empty SOCKS5 target host".to_string()));
            }
            if host.len() > 255 {
                return Err(NetError::DomainTooLong { len: host.len() });
            }
        }
        if let Some(auth) = &auth {
            if auth.username.len() > 255 || auth.password.len() > 255 {
                return Err(NetError::InvalidConfig(
                    "SOCKS5 credentials longer than 255 bytes".to_string(),
                ));
            }
        }
        Ok(Self {
            command,
            target,
            auth,
            state: Socks5State::NegotiateMethods,
            addr_prefix: 0,
        })
    }

    /// Current state.
    pub fn state(&self) -> Socks5State {
        self.state
    }

    /// Method negotiation greeting.
    pub fn greeting(&self) -> Vec<u8> {
        match self.auth {
            Some(_) => vec![SOCKS_VER_5, 2, SOCKS_AUTH_USRPWD, SOCKS_AUTH_NONE],
            None => vec![SOCKS_VER_5, 1, SOCKS_AUTH_NONE],
        }
    }

    /// Exact number of bytes the next `advance` call expects.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            Socks5State::NegotiateMethods | Socks5State::Authenticate => 2,
            Socks5State::AwaitReply => REPLY_PREFIX_LEN,
            Socks5State::AwaitReplyAddress { remaining, .. } => remaining,
            Socks5State::Done => 0,
        }
    }

    /// Feed exactly `bytes_needed` bytes.
    pub fn advance(&mut self, input: &[u8]) -> NetResult<Socks5Step> {
        debug_assert_eq!(input.len(), self.bytes_needed());
        match self.state {
            Socks5State::NegotiateMethods => self.on_method(input),
            Socks5State::Authenticate => self.on_auth(input),
            Socks5State::AwaitReply => self.on_reply_prefix(input),
            Socks5State::AwaitReplyAddress { atyp, .. } => self.on_reply_address(atyp, input),
            Socks5State::Done => Err(NetError::ProxyProtocol(
                "data after completed handshake".to_string(),
            )),
        }
    }

    fn on_method(&mut self, input: &[u8]) -> NetResult<Socks5Step> {
        if input[0] != SOCKS_VER_5 {
            return Err(NetError::ProxyProtocol(format!(
                "unexpected version {:#04x} in method reply",
                input[0]
            )));
        }
        match (input[1], &self.auth) {
            (SOCKS_AUTH_NONE, _) => Ok(Socks5Step::Send(self.request()?)),
            (SOCKS_AUTH_USRPWD, Some(auth)) => {
                let mut out = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
                out.push(SOCKS_AUTH_VER);
                out.push(auth.username.len() as u8);
                out.extend_from_slice(auth.username.as_bytes());
                out.push(auth.password.len() as u8);
                out.extend_from_slice(auth.password.as_bytes());
                self.state = Socks5State::Authenticate;
                Ok(Socks5Step::Send(out))
            }
            _ => Err(NetError::ProxyNoAcceptableMethod),
        }
    }

    fn on_auth(&mut self, input: &[u8]) -> NetResult<Socks5Step> {
        if input[0] != SOCKS_AUTH_VER {
            return Err(NetError::ProxyProtocol(format!(
                "unexpected version {:#04x} in auth reply",
                input[0]
            )));
        }
        if input[1] != 0 {
            return Err(NetError::ProxyAuthFailed);
        }
        Ok(Socks5Step::Send(self.request()?))
    }

    fn request(&mut self) -> NetResult<Vec<u8>> {
        let mut out = vec![SOCKS_VER_5, self.command.code(), 0x00];
        match &self.target {
            Address::Socket(SocketAddr::V4(addr)) => {
                out.push(SOCKS_ATYP_INET4);
                out.extend_from_slice(&addr.ip().octets());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                out.push(SOCKS_ATYP_INET6);
                out.extend_from_slice(&addr.ip().octets());
            }
            Address::Host { host, .. } => {
                out.push(SOCKS_ATYP_DOMAIN);
                out.push(host.len() as u8);
                out.extend_from_slice(host.as_bytes());
            }
        }
        out.extend_from_slice(&self.target.port().to_be_bytes());
        self.state = Socks5State::AwaitReply;
        Ok(out)
    }

    fn on_reply_prefix(&mut self, input: &[u8]) -> NetResult<Socks5Step> {
        if input[0] != SOCKS_VER_5 {
            return Err(NetError::ProxyProtocol(format!(
                "unexpected version {:#04x} in reply",
                input[0]
            )));
        }
        if input[1] != SOCKS_REPLY_OK {
            return Err(NetError::ProxyRejected { reply: input[1] });
        }
        if input[2] != 0x00 {
            return Err(NetError::ProxyProtocol(format!(
                "reserved byte {:#04x} in reply",
                input[2]
            )));
        }
        let atyp = input[3];
        // The fifth byte already belongs to the address
        let remaining = match atyp {
            SOCKS_ATYP_INET4 => 4 - 1 + 2,
            SOCKS_ATYP_INET6 => 16 - 1 + 2,
            SOCKS_ATYP_DOMAIN => input[4] as usize + 2,
            other => {
                return Err(NetError::ProxyProtocol(format!(
                    "unknown address type {:#04x}",
                    other
                )))
            }
        };
        self.addr_prefix = input[4];
        self.state = Socks5State::AwaitReplyAddress { atyp, remaining };
        Ok(Socks5Step::Read)
    }

    fn on_reply_address(&mut self, atyp: u8, input: &[u8]) -> NetResult<Socks5Step> {
        let port_at = input.len() - 2;
        let port = u16::from_be_bytes([input[port_at], input[port_at + 1]]);
        let bound = match atyp {
            SOCKS_ATYP_INET4 => {
                let mut octets = [0u8; 4];
                octets[0] = self.addr_prefix;
                octets[1..].copy_from_slice(&input[..3]);
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            SOCKS_ATYP_INET6 => {
                let mut octets = [0u8; 16];
                octets[0] = self.addr_prefix;
                octets[1..].copy_from_slice(&input[..15]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        };
        self.state = Socks5State::Done;
        Ok(Socks5Step::Done(bound))
    }
}

/// Run a handshake over `stream`, returning the proxy's bound address.
///
/// For [`Socks5Command::Resolve`] the bound address is the resolution result.
pub async fn handshake<S>(stream: &mut S, mut hs: Socks5Handshake) -> NetResult<Option<SocketAddr>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&hs.greeting()).await?;
    let mut buf = Vec::new();
    loop {
        buf.resize(hs.bytes_needed(), 0);
        stream.read_exact(&mut buf).await?;
        match hs.advance(&buf)? {
            Socks5Step::Send(out) => stream.write_all(&out).await?,
            Socks5Step::Read => {}
            Socks5Step::Done(bound) => return Ok(bound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn target() -> Address {
        Address::Socket("10.1.2.3:8333".parse().unwrap())
    }

    #[test]
    fn test_greeting_without_auth() {
        let hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        assert_eq!(hs.greeting(), vec![0x05, 0x01, 0x00]);
        assert_eq!(hs.bytes_needed(), 2);
    }

    #[test]
    fn test_greeting_with_auth() {
        let auth = ProxyAuth {
            username: "u".to_string(),
            password: "pw".to_string(),
        };
        let hs = Socks5Handshake::new(Socks5Command::Connect, target(), Some(auth)).unwrap();
        assert_eq!(hs.greeting(), vec![0x05, 0x02, 0x02, 0x00]);
    }

    #[test]
    fn test_connect_ipv4_flow() {
        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();

        let step = hs.advance(&[0x05, 0x00]).unwrap();
        assert_eq!(
            step,
            Socks5Step::Send(vec![0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3, 0x20, 0x8d])
        );
        assert_eq!(hs.bytes_needed(), 5);

        assert_eq!(hs.advance(&[0x05, 0x00, 0x00, 0x01, 127]).unwrap(), Socks5Step::Read);
        assert_eq!(hs.bytes_needed(), 5);

        let step = hs.advance(&[0, 0, 1, 0x1f, 0x90]).unwrap();
        assert_eq!(step, Socks5Step::Done(Some("127.0.0.1:8080".parse().unwrap())));
        assert_eq!(hs.state(), Socks5State::Done);
    }

    #[test]
    fn test_resolve_domain_request() {
        let mut hs = Socks5Handshake::new(
            Socks5Command::Resolve,
            Address::host("seed.example", 8333),
            None,
        )
        .unwrap();

        let Socks5Step::Send(request) = hs.advance(&[0x05, 0x00]).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(&request[..5], &[0x05, 0xf0, 0x00, 0x03, 12]);
        assert_eq!(&request[5..17], b"seed.example");
        assert_eq!(&request[17..], &8333u16.to_be_bytes());
    }

    #[test]
    fn test_ipv6_reply_remainder() {
        let mut hs = Socks5Handshake::new(Socks5Command::Resolve, Address::host("x.test", 1), None).unwrap();
        hs.advance(&[0x05, 0x00]).unwrap();
        hs.advance(&[0x05, 0x00, 0x00, 0x04, 0x20]).unwrap();
        assert_eq!(hs.bytes_needed(), 17);

        let mut rest = vec![0u8; 15];
        rest[0] = 0x01;
        rest[14] = 0x01;
        rest.extend_from_slice(&[0, 0]);
        let step = hs.advance(&rest).unwrap();
        assert_eq!(step, Socks5Step::Done(Some("[2001::1]:0".parse().unwrap())));
    }

    #[test]
    fn test_domain_reply_length() {
        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        hs.advance(&[0x05, 0x00]).unwrap();
        hs.advance(&[0x05, 0x00, 0x00, 0x03, 7]).unwrap();
        assert_eq!(hs.bytes_needed(), 9);
        assert_eq!(hs.advance(b"proxied\x00\x50").unwrap(), Socks5Step::Done(None));
    }

    #[test]
    fn test_rejections() {
        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        assert!(matches!(
            hs.advance(&[0x05, 0xff]),
            Err(NetError::ProxyNoAcceptableMethod)
        ));

        // Username/password chosen although we offered none
        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        assert!(matches!(
            hs.advance(&[0x05, 0x02]),
            Err(NetError::ProxyNoAcceptableMethod)
        ));

        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        assert!(matches!(hs.advance(&[0x04, 0x00]), Err(NetError::ProxyProtocol(_))));

        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        hs.advance(&[0x05, 0x00]).unwrap();
        assert!(matches!(
            hs.advance(&[0x05, 0x05, 0x00, 0x01, 0]),
            Err(NetError::ProxyRejected { reply: 0x05 })
        ));
    }

    #[test]
    fn test_auth_failure() {
        let auth = ProxyAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), Some(auth)).unwrap();
        let Socks5Step::Send(out) = hs.advance(&[0x05, 0x02]).unwrap() else {
            panic!("expected credentials");
        };
        assert_eq!(out, b"\x01\x04user\x04pass".to_vec());
        assert!(matches!(hs.advance(&[0x01, 0x01]), Err(NetError::ProxyAuthFailed)));
    }

    #[test]
    fn test_malformed_replies() {
        let auth = ProxyAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), Some(auth)).unwrap();
        hs.advance(&[0x05, 0x02]).unwrap();
        // Sub-negotiation replies carry version 0x01, not 0x05
        assert!(matches!(hs.advance(&[0x05, 0x00]), Err(NetError::ProxyProtocol(_))));

        let mut hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        hs.advance(&[0x05, 0x00]).unwrap();
        assert!(matches!(
            hs.advance(&[0x05, 0x00, 0x01, 0x01, 127]),
            Err(NetError::ProxyProtocol(_))
        ));
    }

    #[test]
    fn test_empty_host_rejected() {
        let result = Socks5Handshake::new(Socks5Command::Resolve, Address::host("", 8333), None);
        assert!(matches!(result, Err(NetError::InvalidAddress(_))));
    }

    #[test]
    fn test_domain_too_long() {
        let host = "a".repeat(256);
        let result = Socks5Handshake::new(Socks5Command::Connect, Address::host(host, 80), None);
        assert!(matches!(result, Err(NetError::DomainTooLong { len: 256 })));
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (mut client, mut proxy) = duplex(256);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            proxy.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            proxy.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], SOCKS_CMD_CONNECT);
            proxy
                .write_all(&[0x05, 0x00, 0x00, 0x01, 192, 168, 0, 1, 0x04, 0xd2])
                .await
                .unwrap();
        });

        let hs = Socks5Handshake::new(Socks5Command::Connect, target(), None).unwrap();
        let bound = handshake(&mut client, hs).await.unwrap();
        assert_eq!(bound, Some("192.168.0.1:1234".parse().unwrap()));
        server.await.unwrap();
    }
}
