//! Outbound establishment strategies.
//!
//! An [`Attempt`] is one tracked outgoing request. Its [`Strategy`] is fixed
//! when the request arrives; its [`AttemptStage`] owns whatever is in flight
//! (retry timer, DNS lookup, or connect task), so removing the attempt from
//! its collection cancels that work.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::{AddressFamily, ConnectionOptions, ResolveMode};
use crate::dns::{resolve, HostResolver, ResolveQuery, ResolveRequest};
use crate::error::{NetError, NetResult};
use crate::handle::OwnedTask;
use crate::manager::EngineEvent;
use crate::peer::{Address, ConnId, ConnState, ConnectionDescriptor, ProxyDescriptor};
use crate::protocol::socks5::{handshake, Socks5Command, Socks5Handshake};

/// How an outgoing request is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Connect to a numeric address.
    Direct,
    /// Resolve a hostname, then try each result in order.
    Dns,
    /// Connect through a SOCKS5 proxy.
    Proxied,
    /// Resolve only, locally or through the proxy's RESOLVE command.
    ResolveOnly,
}

impl Strategy {
    /// Pick the strategy for a descriptor.
    ///
    /// A hostname without a proxy and without local resolution cannot be
    /// reached and is rejected.
    pub fn for_descriptor(descriptor: &ConnectionDescriptor) -> NetResult<Self> {
        if descriptor.options.resolve == ResolveMode::ResolveOnly {
            return Ok(Strategy::ResolveOnly);
        }
        if descriptor.proxy.is_some() {
            return Ok(Strategy::Proxied);
        }
        match (&descriptor.address, descriptor.options.resolve) {
            (Address::Socket(_), _) => Ok(Strategy::Direct),
            (Address::Host { .. }, ResolveMode::Resolve) => Ok(Strategy::Dns),
            (Address::Host { .. }, _) => Err(NetError::InvalidAddress(format!(
                "{} needs resolution or a proxy",
                descriptor.address
            ))),
        }
    }
}

/// What an attempt is currently waiting for.
#[derive(Debug, Default)]
pub enum AttemptStage {
    /// Nothing started yet.
    #[default]
    Idle,
    /// Retry timer armed.
    Waiting(OwnedTask),
    /// Local DNS lookup.
    Resolving(ResolveRequest),
    /// TCP connect and, for proxies, the SOCKS5 exchange.
    Connecting(OwnedTask),
}

/// One outgoing request in the connecting or resolving collection.
#[derive(Debug)]
pub struct Attempt {
    /// Descriptor as requested.
    pub descriptor: ConnectionDescriptor,
    /// Strategy fixed at request time.
    pub strategy: Strategy,
    /// Remaining retry budget. Negative means unlimited.
    pub retries: i32,
    /// Untried resolved addresses, front first.
    pub candidates: VecDeque<SocketAddr>,
    /// In-flight work.
    pub stage: AttemptStage,
}

impl Attempt {
    /// Create an attempt with the retry budget taken from the options.
    pub fn new(descriptor: ConnectionDescriptor) -> NetResult<Self> {
        let strategy = Strategy::for_descriptor(&descriptor)?;
        let retries = descriptor.options.retries;
        Ok(Self {
            descriptor,
            strategy,
            retries,
            candidates: VecDeque::new(),
            stage: AttemptStage::Idle,
        })
    }

    /// Whether this belongs in the resolving collection.
    pub fn is_resolve_only(&self) -> bool {
        self.strategy == Strategy::ResolveOnly
    }

    /// Externally visible state.
    pub fn state(&self) -> ConnState {
        match (&self.strategy, &self.stage) {
            (Strategy::ResolveOnly, _) | (_, AttemptStage::Resolving(_)) => ConnState::Resolving,
            _ => ConnState::Connecting,
        }
    }

    /// The descriptor that just failed: the candidate being tried, or the
    /// request itself.
    pub fn failed_descriptor(&self) -> ConnectionDescriptor {
        match (self.strategy, self.candidates.front()) {
            (Strategy::Dns, Some(addr)) => self.descriptor.resolved(*addr),
            _ => self.descriptor.clone(),
        }
    }

    /// Apply the retry policy after a failure and report whether to retry.
    ///
    /// The failed candidate is dropped first. Remaining candidates are tried
    /// without charge; the budget is consulted only once they run out, and a
    /// charged retry of a DNS attempt resolves again.
    pub fn should_retry(&mut self, shutting_down: bool) -> bool {
        if self.strategy == Strategy::Dns {
            self.candidates.pop_front();
        }
        if shutting_down {
            return false;
        }
        if !self.candidates.is_empty() {
            return true;
        }
        if self.retries != 0 {
            if self.retries > 0 {
                self.retries -= 1;
            }
            return true;
        }
        false
    }
}

/// Open a TCP connection, bounded by `connect_timeout` unless it is zero.
pub async fn connect_direct(addr: SocketAddr, connect_timeout: Duration) -> NetResult<TcpStream> {
    tracing::debug!(addr = %addr, "Connecting");

    if connect_timeout.is_zero() {
        return Ok(TcpStream::connect(addr).await?);
    }
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetError::Io(e)),
        Err(_) => Err(NetError::ConnectionTimeout { addr }),
    }
}

async fn with_deadline<T>(limit: Duration, what: &'static str, fut: impl Future<Output = NetResult<T>>) -> NetResult<T> {
    if limit.is_zero() {
        return fut.await;
    }
    timeout(limit, fut).await.map_err(|_| NetError::Timeout(what))?
}

/// Connect to the proxy itself, resolving its hostname first if needed.
async fn open_proxy(
    resolver: &dyn HostResolver,
    proxy: &ProxyDescriptor,
    options: &ConnectionOptions,
) -> NetResult<(TcpStream, SocketAddr)> {
    let addr = match &proxy.address {
        Address::Socket(addr) => *addr,
        Address::Host { host, port } => {
            let query = ResolveQuery {
                host: host.clone(),
                port: *port,
                family: AddressFamily::Unspecified,
                max_results: 1,
            };
            let addrs = resolve(resolver, &query).await?;
            addrs.first().copied().ok_or_else(|| NetError::NoAddresses { host: host.clone() })?
        }
    };
    let stream = connect_direct(addr, options.connect_timeout).await?;
    Ok((stream, addr))
}

/// Connect to `target` through a SOCKS5 proxy.
///
/// Returns the stream and the proxy's socket address.
pub async fn connect_proxied(
    resolver: &dyn HostResolver,
    proxy: &ProxyDescriptor,
    target: Address,
    options: &ConnectionOptions,
) -> NetResult<(TcpStream, SocketAddr)> {
    let (mut stream, addr) = open_proxy(resolver, proxy, options).await?;
    let hs = Socks5Handshake::new(Socks5Command::Connect, target, proxy.auth.clone())?;
    with_deadline(options.initial_timeout, "proxy handshake", handshake(&mut stream, hs)).await?;
    tracing::debug!(proxy = %addr, "Proxy accepted connect request");
    Ok((stream, addr))
}

/// Resolve `target` with the proxy's RESOLVE command.
pub async fn proxy_resolve(
    resolver: &dyn HostResolver,
    proxy: &ProxyDescriptor,
    target: Address,
    options: &ConnectionOptions,
) -> NetResult<Vec<SocketAddr>> {
    let port = target.port();
    let (mut stream, _) = open_proxy(resolver, proxy, options).await?;
    let hs = Socks5Handshake::new(Socks5Command::Resolve, target.clone(), proxy.auth.clone())?;
    let bound = with_deadline(options.initial_timeout, "proxy resolve", handshake(&mut stream, hs)).await?;

    let addr = bound
        .map(|addr| SocketAddr::new(addr.ip(), port))
        .ok_or_else(|| NetError::ProxyProtocol("RESOLVE reply carried no address".to_string()))?;
    if !options.family.matches(&addr.ip()) {
        return Err(NetError::NoAddresses {
            host: target.to_string(),
        });
    }
    Ok(vec![addr])
}

/// The lookup for a descriptor's own address.
pub fn lookup_query(descriptor: &ConnectionDescriptor) -> ResolveQuery {
    let host = match &descriptor.address {
        Address::Socket(addr) => addr.ip().to_string(),
        Address::Host { host, .. } => host.clone(),
    };
    ResolveQuery {
        host,
        port: descriptor.address.port(),
        family: descriptor.options.family,
        max_results: descriptor.options.max_lookup_results,
    }
}

/// Spawns the tasks behind attempts and timers.
pub struct Launcher {
    runtime: Handle,
    events: mpsc::UnboundedSender<EngineEvent>,
    resolver: Arc<dyn HostResolver>,
}

impl Launcher {
    /// Create a launcher posting to `events`.
    pub fn new(runtime: Handle, events: mpsc::UnboundedSender<EngineEvent>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            runtime,
            events,
            resolver,
        }
    }

    /// Runtime the tasks run on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Start the next step of `attempt` under `id`.
    pub fn begin(&self, id: ConnId, attempt: &mut Attempt) {
        let desc = &attempt.descriptor;
        attempt.stage = match (attempt.strategy, attempt.candidates.front()) {
            (Strategy::ResolveOnly, _) => match desc.proxy.clone() {
                Some(proxy) => {
                    let target = desc.address.clone();
                    let options = desc.options.clone();
                    self.spawn_with_resolver(move |resolver| async move {
                        let result = proxy_resolve(resolver.as_ref(), &proxy, target, &options).await;
                        EngineEvent::Resolved { id, result }
                    })
                }
                None => self.lookup(id, lookup_query(desc)),
            },
            (Strategy::Dns, Some(addr)) => self.dial_direct(id, *addr, desc.options.connect_timeout),
            (Strategy::Dns, None) => self.lookup(id, lookup_query(desc)),
            (Strategy::Direct, _) => match desc.address.socket_addr() {
                Some(addr) => self.dial_direct(id, addr, desc.options.connect_timeout),
                None => self.post_now(EngineEvent::Established {
                    id,
                    result: Err(NetError::InvalidAddress(desc.address.to_string())),
                }),
            },
            (Strategy::Proxied, _) => {
                let proxy = desc.proxy.clone();
                let target = desc.address.clone();
                let options = desc.options.clone();
                self.spawn_with_resolver(move |resolver| async move {
                    let result = match proxy {
                        Some(proxy) => connect_proxied(resolver.as_ref(), &proxy, target, &options).await,
                        None => Err(NetError::InvalidConfig("proxied attempt without a proxy".to_string())),
                    };
                    EngineEvent::Established { id, result }
                })
            }
        };
    }

    /// Arm the retry timer for `id`.
    pub fn wait_retry(&self, id: ConnId, attempt: &mut Attempt) {
        let delay = attempt.descriptor.options.retry_interval;
        attempt.stage = AttemptStage::Waiting(self.schedule(delay, EngineEvent::RetryDue(id)));
    }

    /// Post `event` after `delay`.
    pub fn schedule(&self, delay: Duration, event: EngineEvent) -> OwnedTask {
        let events = self.events.clone();
        OwnedTask::spawn(&self.runtime, async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        })
    }

    fn lookup(&self, id: ConnId, query: ResolveQuery) -> AttemptStage {
        let events = self.events.clone();
        AttemptStage::Resolving(ResolveRequest::spawn(
            &self.runtime,
            self.resolver.clone(),
            query,
            move |result| {
                let _ = events.send(EngineEvent::Resolved { id, result });
            },
        ))
    }

    fn dial_direct(&self, id: ConnId, addr: SocketAddr, connect_timeout: Duration) -> AttemptStage {
        let events = self.events.clone();
        AttemptStage::Connecting(OwnedTask::spawn(&self.runtime, async move {
            let result = connect_direct(addr, connect_timeout).await.map(|stream| (stream, addr));
            let _ = events.send(EngineEvent::Established { id, result });
        }))
    }

    fn spawn_with_resolver<F, Fut>(&self, make: F) -> AttemptStage
    where
        F: FnOnce(Arc<dyn HostResolver>) -> Fut,
        Fut: Future<Output = EngineEvent> + Send + 'static,
    {
        let events = self.events.clone();
        let fut = make(self.resolver.clone());
        AttemptStage::Connecting(OwnedTask::spawn(&self.runtime, async move {
            let _ = events.send(fut.await);
        }))
    }

    fn post_now(&self, event: EngineEvent) -> AttemptStage {
        let events = self.events.clone();
        AttemptStage::Connecting(OwnedTask::spawn(&self.runtime, async move {
            let _ = events.send(event);
        }))
    }
}
