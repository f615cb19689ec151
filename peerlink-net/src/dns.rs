//! Hostname resolution.
//!
//! The engine talks to DNS through [`HostResolver`] so the lookup backend can
//! be swapped (tests use a static table). [`ResolveRequest`] runs exactly one
//! lookup and is cancelled by dropping it.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;
use trust_dns_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use trust_dns_resolver::{system_conf, TokioAsyncResolver};

use crate::config::AddressFamily;
use crate::error::{NetError, NetResult};
use crate::handle::OwnedTask;

/// Boxed lookup future returned by [`HostResolver::lookup`].
pub type LookupFuture = Pin<Box<dyn Future<Output = NetResult<Vec<IpAddr>>> + Send>>;

/// Asynchronous hostname lookup backend.
pub trait HostResolver: Send + Sync + 'static {
    /// Resolve `host` to addresses in preference order.
    fn lookup(&self, host: &str) -> LookupFuture;
}

/// Resolver backed by the system DNS configuration.
#[derive(Clone)]
pub struct DnsResolver {
    /// The async resolver.
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Create a resolver from the system configuration.
    ///
    /// Falls back to the library defaults when the system configuration is
    /// unreadable.
    pub fn from_system_conf() -> Self {
        let (config, mut opts) = system_conf::read_system_conf().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read system DNS configuration, using defaults");
            (ResolverConfig::default(), ResolverOpts::default())
        });
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl HostResolver for DnsResolver {
    fn lookup(&self, host: &str) -> LookupFuture {
        let resolver = self.resolver.clone();
        let host = host.to_string();
        Box::pin(async move {
            tracing::debug!(host = %host, "Resolving host");
            let response = resolver
                .lookup_ip(host.as_str())
                .await
                .map_err(|e| NetError::DnsResolutionFailed {
                    host: host.clone(),
                    error: e.to_string(),
                })?;
            Ok(response.iter().collect())
        })
    }
}

/// One resolution query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveQuery {
    /// Hostname or numeric address.
    pub host: String,
    /// Port attached to every result.
    pub port: u16,
    /// Accepted families.
    pub family: AddressFamily,
    /// Maximum number of results. Zero keeps all.
    pub max_results: usize,
}

/// Resolve a query into ordered candidate socket addresses.
///
/// Numeric hosts never reach the resolver.
pub async fn resolve(resolver: &dyn HostResolver, query: &ResolveQuery) -> NetResult<Vec<SocketAddr>> {
    let ips = match query.host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => resolver.lookup(&query.host).await?,
    };

    let limit = if query.max_results == 0 {
        usize::MAX
    } else {
        query.max_results
    };
    let addrs: Vec<SocketAddr> = ips
        .into_iter()
        .filter(|ip| query.family.matches(ip))
        .take(limit)
        .map(|ip| SocketAddr::new(ip, query.port))
        .collect();

    if addrs.is_empty() {
        return Err(NetError::NoAddresses {
            host: query.host.clone(),
        });
    }

    tracing::debug!(host = %query.host, count = addrs.len(), "Resolved host");
    Ok(addrs)
}

/// An in-flight resolution. Dropping it cancels the lookup.
#[derive(Debug)]
pub struct ResolveRequest {
    task: OwnedTask,
}

impl ResolveRequest {
    /// Start resolving `query`; `on_done` runs with the outcome unless the
    /// request is cancelled first.
    pub fn spawn<F>(runtime: &Handle, resolver: Arc<dyn HostResolver>, query: ResolveQuery, on_done: F) -> Self
    where
        F: FnOnce(NetResult<Vec<SocketAddr>>) + Send + 'static,
    {
        let task = OwnedTask::spawn(runtime, async move {
            let result = resolve(resolver.as_ref(), &query).await;
            on_done(result);
        });
        Self { task }
    }

    /// Cancel the lookup.
    pub fn cancel(self) {
        self.task.cancel();
    }
}
