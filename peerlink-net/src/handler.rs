//! The connection engine.
//!
//! [`ConnectionHandler`] owns a single-threaded tokio runtime. Connection I/O,
//! connect attempts, lookups and timers run as tasks on it, but they only
//! make progress while the caller is inside [`ConnectionHandler::pump`]. Tasks
//! report completions as engine events; `pump` applies every state
//! transition and calls every [`NetworkEvents`] method on the calling thread.
//!
//! [`NetHandle`] is the cloneable downward interface. It reaches established
//! connections through a locked registry, so with threading enabled its
//! send/close/pause calls are safe from any thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::{ConnectionOptions, HandlerConfig, NetworkConfig};
use crate::dns::{DnsResolver, HostResolver};
use crate::error::{NetError, NetResult};
use crate::events::{ConnectionFailure, FailureKind, NetworkEvents};
use crate::handle::OwnedTask;
use crate::manager::inbound::Listener;
use crate::manager::outbound::{Attempt, AttemptStage, Launcher, Strategy};
use crate::manager::ratelimit::{ConnLimiter, RateGroup, RateLimit};
use crate::manager::slots::{Connected, ConnectionSlots, ListenerEntry, Registry};
use crate::manager::EngineEvent;
use crate::peer::connection::{spawn_connection, ConnEvent, ConnShared, DisconnectReason, IoTimeouts};
use crate::peer::{
    ConnId, ConnState, ConnectionDescriptor, ConnectionDirection, ConnectionInfo, ListenerDescriptor,
};

/// State shared by every [`NetHandle`] clone.
#[derive(Debug)]
struct Shared {
    /// Established connections.
    registry: Arc<Registry>,
    /// Engine event channel.
    events: mpsc::UnboundedSender<EngineEvent>,
    /// Thread that called `start`.
    event_thread: OnceLock<ThreadId>,
    /// Whether the cross-thread entry points may run off the event thread.
    threading: bool,
    /// Set as soon as shutdown is requested.
    shutdown_requested: AtomicBool,
    /// Bandwidth bucket shared by all inbound connections.
    incoming: Arc<RateGroup>,
    /// Bandwidth bucket shared by all outbound connections.
    outgoing: Arc<RateGroup>,
}

/// Downward interface to a running engine.
#[derive(Debug, Clone)]
pub struct NetHandle {
    shared: Arc<Shared>,
}

impl NetHandle {
    /// Panic unless on the event thread, or `threadsafe` and threading is on.
    fn assert_event_thread(&self, threadsafe: bool) {
        if threadsafe && self.shared.threading {
            return;
        }
        if let Some(owner) = self.shared.event_thread.get() {
            assert_eq!(
                *owner,
                thread::current().id(),
                "connection engine called off its event thread"
            );
        }
    }

    fn conn(&self, id: ConnId) -> NetResult<Arc<ConnShared>> {
        self.shared
            .registry
            .lock()
            .get(&id)
            .cloned()
            .ok_or(NetError::NotConnected(id))
    }

    /// Check if `id` is connected.
    pub fn is_connected(&self, id: ConnId) -> bool {
        self.shared.registry.lock().contains_key(&id)
    }

    /// Queue bytes on a connection.
    pub fn send(&self, id: ConnId, data: &[u8]) -> NetResult<()> {
        self.assert_event_thread(true);
        self.conn(id)?.send(data)
    }

    /// Close a connection, now or once its send buffer drains.
    pub fn close(&self, id: ConnId, immediately: bool) -> NetResult<()> {
        self.assert_event_thread(true);
        if self.conn(id)?.close(immediately) {
            Ok(())
        } else {
            Err(NetError::Disconnecting(id))
        }
    }

    /// Stop reading from a connection. Returns the new pause depth.
    pub fn pause_recv(&self, id: ConnId) -> NetResult<u32> {
        self.assert_event_thread(true);
        self.conn(id)?.pause()
    }

    /// Undo one `pause_recv`. Reading resumes at depth zero.
    pub fn unpause_recv(&self, id: ConnId) -> NetResult<u32> {
        self.assert_event_thread(true);
        self.conn(id)?.unpause()
    }

    /// Check if reading is paused.
    pub fn is_recv_paused(&self, id: ConnId) -> NetResult<bool> {
        Ok(self.conn(id)?.pause_depth() > 0)
    }

    /// Install a per-connection rate limit.
    pub fn set_rate_limit(&self, id: ConnId, limit: RateLimit) -> NetResult<()> {
        self.assert_event_thread(true);
        self.conn(id)?.limiter().set_override(limit);
        Ok(())
    }

    /// Set the bandwidth limit shared by all inbound connections.
    pub fn set_incoming_rate_limit(&self, limit: RateLimit) {
        self.assert_event_thread(false);
        self.shared.incoming.set_limit(limit);
    }

    /// Set the bandwidth limit shared by all outbound connections.
    pub fn set_outgoing_rate_limit(&self, limit: RateLimit) {
        self.assert_event_thread(false);
        self.shared.outgoing.set_limit(limit);
    }

    /// Re-arm the ping deadline of a connection. Zero clears it.
    pub fn reset_ping_timeout(&self, id: ConnId, timeout: Duration) -> NetResult<()> {
        self.assert_event_thread(false);
        self.conn(id)?.reset_ping(timeout);
        Ok(())
    }

    /// Request shutdown. Safe from any thread.
    pub fn shutdown(&self) {
        if !self.shared.shutdown_requested.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown requested");
        }
        let _ = self.shared.events.send(EngineEvent::Shutdown);
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::SeqCst)
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Drained,
}

/// The connection engine.
pub struct ConnectionHandler<E: NetworkEvents> {
    /// Engine configuration.
    config: HandlerConfig,
    /// The collaborator.
    events: E,
    /// Downward handle passed to every callback.
    net: NetHandle,
    /// Engine event receiver.
    inbox: mpsc::UnboundedReceiver<EngineEvent>,
    /// The four collections.
    slots: ConnectionSlots,
    /// Spawns attempt tasks and timers.
    launcher: Launcher,
    /// Periodic demand timer.
    ticker: Option<OwnedTask>,
    phase: Phase,
    outgoing_target: usize,
    /// Dropped last so every task above is aborted first.
    runtime: Runtime,
}

impl<E: NetworkEvents> ConnectionHandler<E> {
    /// Create an engine using the system DNS configuration.
    pub fn new(config: HandlerConfig, events: E) -> NetResult<Self> {
        let runtime = build_runtime()?;
        let resolver = {
            let _guard = runtime.enter();
            Arc::new(DnsResolver::from_system_conf())
        };
        Self::build(config, events, resolver, runtime)
    }

    /// Create an engine with a custom resolver.
    pub fn with_resolver(config: HandlerConfig, events: E, resolver: Arc<dyn HostResolver>) -> NetResult<Self> {
        Self::build(config, events, resolver, build_runtime()?)
    }

    fn build(config: HandlerConfig, events: E, resolver: Arc<dyn HostResolver>, runtime: Runtime) -> NetResult<Self> {
        if config.request_interval.is_zero() {
            return Err(NetError::InvalidConfig("request interval must be positive".to_string()));
        }

        let (tx, inbox) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(HashMap::new()));
        let shared = Arc::new(Shared {
            registry: registry.clone(),
            events: tx.clone(),
            event_thread: OnceLock::new(),
            threading: config.enable_threading,
            shutdown_requested: AtomicBool::new(false),
            incoming: Arc::new(RateGroup::new(RateLimit::UNLIMITED)),
            outgoing: Arc::new(RateGroup::new(RateLimit::UNLIMITED)),
        });

        Ok(Self {
            config,
            events,
            net: NetHandle { shared },
            inbox,
            slots: ConnectionSlots::new(registry),
            launcher: Launcher::new(runtime.handle().clone(), tx, resolver),
            ticker: None,
            phase: Phase::Idle,
            outgoing_target: 0,
            runtime,
        })
    }

    /// Start the engine on the calling thread, which becomes the event thread.
    pub fn start(&mut self, outgoing_target: usize) -> NetResult<()> {
        if self.phase != Phase::Idle {
            return Err(NetError::AlreadyStarted);
        }
        let _ = self.net.shared.event_thread.set(thread::current().id());
        self.phase = Phase::Running;
        self.outgoing_target = outgoing_target;
        self.ticker = Some(self.spawn_ticker());

        tracing::info!(
            outgoing_target,
            max_connecting = self.config.max_simultaneous_connecting,
            "Connection engine started"
        );
        self.events.on_startup(&self.net);

        while let Some(descriptor) = self.events.need_incoming_listener(&self.net) {
            let id = self.slots.allocate_id();
            let retries = descriptor.options.retries;
            self.bind_with_retry(id, descriptor, retries);
        }

        self.request_outgoing();
        Ok(())
    }

    fn spawn_ticker(&self) -> OwnedTask {
        let events = self.net.shared.events.clone();
        let period = self.config.request_interval;
        OwnedTask::spawn(self.runtime.handle(), async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if events.send(EngineEvent::RequestOutgoing).is_err() {
                    break;
                }
            }
        })
    }

    /// Run one iteration of the event loop.
    ///
    /// With `block`, waits for at least one engine event. Returns false
    /// before `start` and once shutdown has drained everything.
    pub fn pump(&mut self, block: bool) -> bool {
        if self.phase != Phase::Running {
            return false;
        }

        if block {
            let inbox = &mut self.inbox;
            if let Some(event) = self.runtime.block_on(inbox.recv()) {
                self.dispatch(event);
            }
        } else {
            self.runtime.block_on(async {
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
            });
        }

        while self.phase != Phase::Drained {
            match self.inbox.try_recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => break,
            }
        }

        self.phase != Phase::Drained
    }

    /// Pump until shutdown has drained.
    pub fn run(&mut self) {
        while self.pump(true) {}
    }

    /// Request shutdown. It takes effect on the next pump.
    pub fn shutdown(&self) {
        self.net.shutdown();
    }

    /// Bind a listener now.
    pub fn bind(&mut self, descriptor: ListenerDescriptor) -> NetResult<ConnId> {
        self.net.assert_event_thread(false);
        if self.phase == Phase::Drained || self.net.is_shutting_down() {
            return Err(NetError::Shutdown);
        }
        descriptor.network.validate()?;
        let id = self.slots.allocate_id();
        let listener = Listener::bind(self.runtime.handle(), id, descriptor.clone(), self.net.shared.events.clone())?;
        let local_addr = listener.local_addr;
        self.slots.insert_listener(id, ListenerEntry::Bound(listener));
        self.events.on_bind(&self.net, id, &descriptor, local_addr);
        Ok(id)
    }

    /// Cross-thread handle.
    pub fn handle(&self) -> NetHandle {
        self.net.clone()
    }

    /// The collaborator.
    pub fn events(&self) -> &E {
        &self.events
    }

    /// The collaborator, mutably.
    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    /// Get connected count.
    pub fn connected_count(&self) -> usize {
        self.slots.connected_count()
    }

    /// Get connecting count.
    pub fn connecting_count(&self) -> usize {
        self.slots.connecting_count()
    }

    /// Get resolving count.
    pub fn resolving_count(&self) -> usize {
        self.slots.resolving_count()
    }

    /// Get listening count.
    pub fn listening_count(&self) -> usize {
        self.slots.listening_count()
    }

    /// Check if shutdown has completed.
    pub fn is_drained(&self) -> bool {
        self.phase == Phase::Drained
    }

    /// Bound address of a listener.
    pub fn listener_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.slots.listener(id).map(|l| l.local_addr)
    }

    /// State of an id, or `None` if it was never issued.
    pub fn connection_state(&self, id: ConnId) -> Option<ConnState> {
        self.slots.state(id)
    }

    /// Snapshot of a connected peer.
    pub fn connection_info(&self, id: ConnId) -> Option<ConnectionInfo> {
        self.slots.connected(id).map(|c| c.info.clone())
    }

    fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::RequestOutgoing => self.request_outgoing(),
            EngineEvent::Shutdown => self.shutdown_now(),
            EngineEvent::RetryDue(id) => self.on_retry_due(id),
            EngineEvent::BindRetryDue(id) => self.on_bind_retry_due(id),
            EngineEvent::Resolved { id, result } => self.on_resolved(id, result),
            EngineEvent::Established { id, result } => self.on_established(id, result),
            EngineEvent::Accepted { listener, stream, peer } => self.on_accepted(listener, stream, peer),
            EngineEvent::Conn { id, event } => self.on_conn_event(id, event),
        }
    }

    /// Ask the collaborator for as many outgoing descriptors as are needed.
    fn request_outgoing(&mut self) {
        if self.phase != Phase::Running || self.net.is_shutting_down() {
            return;
        }
        let need = self
            .slots
            .demand(self.outgoing_target, self.config.max_simultaneous_connecting);
        if need == 0 {
            return;
        }

        let descriptors = self.events.need_outgoing_connections(&self.net, need);
        for descriptor in descriptors.into_iter().take(need) {
            let attempt = descriptor.network.validate().and_then(|()| Attempt::new(descriptor));
            match attempt {
                Ok(mut attempt) => {
                    let id = self.slots.allocate_id();
                    tracing::debug!(
                        conn = %id,
                        target = %attempt.descriptor,
                        strategy = ?attempt.strategy,
                        "Starting outgoing attempt"
                    );
                    self.launcher.begin(id, &mut attempt);
                    self.slots.insert_attempt(id, attempt);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring unusable outgoing descriptor");
                }
            }
        }
    }

    fn on_retry_due(&mut self, id: ConnId) {
        match self.slots.attempt_mut(id) {
            Some(attempt) if matches!(attempt.stage, AttemptStage::Waiting(_)) => {
                tracing::debug!(conn = %id, target = %attempt.descriptor, "Retrying");
                self.launcher.begin(id, attempt);
            }
            _ => tracing::trace!(conn = %id, "Ignoring stale retry timer"),
        }
    }

    fn on_resolved(&mut self, id: ConnId, result: NetResult<Vec<SocketAddr>>) {
        let strategy = match self.slots.attempt_mut(id) {
            Some(attempt) if matches!(attempt.stage, AttemptStage::Resolving(_) | AttemptStage::Connecting(_)) => {
                attempt.strategy
            }
            _ => {
                tracing::trace!(conn = %id, "Ignoring stale resolution");
                return;
            }
        };

        match (strategy, result) {
            (Strategy::Dns, Ok(addrs)) => {
                if let Some(attempt) = self.slots.attempt_mut(id) {
                    tracing::debug!(conn = %id, count = addrs.len(), "Resolved candidates");
                    attempt.candidates = addrs.into();
                    self.launcher.begin(id, attempt);
                }
            }
            (Strategy::ResolveOnly, result) => {
                if let Some(attempt) = self.slots.take_attempt(id) {
                    self.finish_lookup(id, attempt, result);
                }
            }
            (_, result) => {
                let error = match result {
                    Ok(_) => NetError::InvalidConfig("unexpected lookup result".to_string()),
                    Err(e) => e,
                };
                if let Some(attempt) = self.slots.take_attempt(id) {
                    self.fail_attempt(id, attempt, FailureKind::Resolve, error);
                }
            }
        }
    }

    /// Report the outcome of a resolve-only request.
    fn finish_lookup(&mut self, id: ConnId, mut attempt: Attempt, result: NetResult<Vec<SocketAddr>>) {
        attempt.stage = AttemptStage::Idle;
        let descriptor = attempt.descriptor.clone();
        match result {
            Ok(addrs) => {
                tracing::debug!(conn = %id, host = %descriptor.address, count = addrs.len(), "Lookup finished");
                let results = addrs.iter().map(|addr| descriptor.resolved(*addr)).collect();
                self.events.on_dns_response(&self.net, id, &descriptor, results);
                self.request_outgoing();
            }
            Err(error) => {
                let retry = self.retry_or_release(attempt);
                tracing::debug!(conn = %id, host = %descriptor.address, error = %error, retry = ?retry, "Lookup failed");
                self.events.on_dns_failure(&self.net, id, &descriptor, &error, retry);
                if retry.is_none() {
                    self.request_outgoing();
                }
            }
        }
    }

    fn on_established(&mut self, id: ConnId, result: NetResult<(TcpStream, SocketAddr)>) {
        let connecting = matches!(
            self.slots.attempt_mut(id),
            Some(attempt) if matches!(attempt.stage, AttemptStage::Connecting(_))
        );
        if !connecting {
            tracing::trace!(conn = %id, "Ignoring stale connect result");
            return;
        }
        let Some(attempt) = self.slots.take_attempt(id) else {
            return;
        };

        match result {
            Ok((stream, addr)) => self.outgoing_connected(id, attempt, stream, addr),
            Err(error) => {
                let kind = match attempt.strategy {
                    Strategy::Proxied => FailureKind::Proxy,
                    _ => FailureKind::Connect,
                };
                self.fail_attempt(id, attempt, kind, error);
            }
        }
    }

    /// Arm a retry under a fresh id if the policy allows one.
    fn retry_or_release(&mut self, mut attempt: Attempt) -> Option<ConnId> {
        if !attempt.should_retry(self.net.is_shutting_down()) {
            return None;
        }
        let id = self.slots.allocate_id();
        self.launcher.wait_retry(id, &mut attempt);
        self.slots.insert_attempt(id, attempt);
        Some(id)
    }

    fn fail_attempt(&mut self, id: ConnId, mut attempt: Attempt, kind: FailureKind, error: NetError) {
        attempt.stage = AttemptStage::Idle;
        let requested = attempt.descriptor.clone();
        let failed = attempt.failed_descriptor();
        let retry = self.retry_or_release(attempt);

        tracing::debug!(
            conn = %id,
            target = %failed,
            kind = %kind,
            error = %error,
            retry = ?retry,
            "Outgoing attempt failed"
        );

        let failure = ConnectionFailure {
            id,
            kind,
            requested,
            failed,
            error,
            retry,
        };
        match kind {
            FailureKind::Proxy => self.events.on_proxy_failure(&self.net, &failure),
            _ => self.events.on_connection_failure(&self.net, &failure),
        }

        if retry.is_none() {
            self.request_outgoing();
        }
    }

    fn outgoing_connected(&mut self, id: ConnId, attempt: Attempt, stream: TcpStream, addr: SocketAddr) {
        // Proxied attempts report the target, not the proxy
        let resolved = match attempt.strategy {
            Strategy::Proxied => attempt.descriptor.clone(),
            _ => attempt.descriptor.resolved(addr),
        };
        if !self
            .events
            .on_outgoing_connection(&self.net, id, &attempt.descriptor, &resolved)
        {
            tracing::debug!(conn = %id, addr = %addr, "Outgoing connection declined");
            drop(stream);
            self.fail_attempt(id, attempt, FailureKind::Connect, NetError::Declined(id));
            return;
        }

        let requested = attempt.descriptor;
        let options = requested.options.clone();
        let network = requested.network.clone();
        self.establish(
            id,
            stream,
            addr,
            ConnectionDirection::Outbound,
            None,
            Some(requested),
            &options,
            network,
        );
        tracing::info!(conn = %id, addr = %addr, "Outbound connection established");
        self.events.on_ready_for_first_send(&self.net, id);
        self.request_outgoing();
    }

    fn on_accepted(&mut self, listener_id: ConnId, stream: TcpStream, peer: SocketAddr) {
        let Some(listener) = self.slots.listener(listener_id) else {
            tracing::trace!(listener = %listener_id, "Dropping socket from released listener");
            return;
        };
        let descriptor = listener.descriptor.clone();
        let live = self.slots.incoming_for(listener_id);
        if listener.is_full(live) {
            tracing::debug!(listener = %listener_id, addr = %peer, "Rejecting inbound: listener full");
            listener.set_enabled(false);
            return;
        }

        let id = self.slots.allocate_id();
        let listener_count = live + 1;
        let total_incoming = self.slots.inbound_count() + 1;
        if !self
            .events
            .on_incoming_connection(&self.net, id, &descriptor, peer, listener_count, total_incoming)
        {
            tracing::debug!(conn = %id, addr = %peer, "Inbound connection refused");
            return;
        }

        self.establish(
            id,
            stream,
            peer,
            ConnectionDirection::Inbound,
            Some(listener_id),
            None,
            &descriptor.options,
            descriptor.network.clone(),
        );
        if let Some(listener) = self.slots.listener(listener_id) {
            if listener.is_full(listener_count) {
                tracing::debug!(listener = %listener_id, "Listener reached its incoming limit");
                listener.set_enabled(false);
            }
        }
        tracing::info!(conn = %id, addr = %peer, "Inbound connection established");
        self.events.on_ready_for_first_send(&self.net, id);
    }

    #[allow(clippy::too_many_arguments)]
    fn establish(
        &mut self,
        id: ConnId,
        stream: TcpStream,
        remote: SocketAddr,
        direction: ConnectionDirection,
        listener: Option<ConnId>,
        requested: Option<ConnectionDescriptor>,
        options: &ConnectionOptions,
        network: NetworkConfig,
    ) {
        let group = match direction {
            ConnectionDirection::Inbound => self.net.shared.incoming.clone(),
            ConnectionDirection::Outbound => self.net.shared.outgoing.clone(),
        };
        let (shared, commands) = ConnShared::new(
            id,
            direction,
            options.max_send_buffer,
            ConnLimiter::new(group),
            self.net.shared.events.clone(),
        );
        let task = spawn_connection(
            self.runtime.handle(),
            shared.clone(),
            commands,
            stream,
            IoTimeouts::from(options),
            network,
        );

        let mut info = ConnectionInfo::new(id, remote, direction);
        info.listener = listener;
        self.slots.insert_connected(
            id,
            Connected {
                shared,
                info,
                task,
                requested,
            },
        );
    }

    fn on_conn_event(&mut self, id: ConnId, event: ConnEvent) {
        let Some(conn) = self.slots.connected_mut(id) else {
            tracing::trace!(conn = %id, "Ignoring event for released connection");
            return;
        };

        match event {
            ConnEvent::BytesRead { delta, total } => {
                conn.info.bytes_read = total;
                tracing::trace!(conn = %id, delta, total, "Read bytes");
                self.events.on_bytes_read(&self.net, id, delta, total);
            }
            ConnEvent::BytesWritten { delta, total } => {
                conn.info.bytes_written = total;
                tracing::trace!(conn = %id, delta, total, "Wrote bytes");
                self.events.on_bytes_written(&self.net, id, delta, total);
            }
            ConnEvent::Messages(messages) => {
                let size = messages.iter().map(|m| m.len()).sum();
                if !self.events.on_receive_messages(&self.net, id, messages, size) {
                    if let Some(conn) = self.slots.connected(id) {
                        tracing::debug!(conn = %id, "Receiver declined, closing after drain");
                        conn.shared.close(false);
                    }
                }
            }
            ConnEvent::Malformed(error) => {
                self.events.on_malformed_message(&self.net, id, &error);
            }
            ConnEvent::WriteBufferFull { size } => {
                tracing::debug!(conn = %id, size, "Send buffer full");
                self.events.on_write_buffer_full(&self.net, id, size);
            }
            ConnEvent::WriteBufferReady { size } => {
                tracing::debug!(conn = %id, size, "Send buffer ready");
                self.events.on_write_buffer_ready(&self.net, id, size);
            }
            ConnEvent::PingTimeout => {
                tracing::debug!(conn = %id, "Ping timeout");
                self.events.on_ping_timeout(&self.net, id);
            }
            ConnEvent::Closed { reason } => self.on_closed(id, reason),
        }
    }

    fn on_closed(&mut self, id: ConnId, reason: DisconnectReason) {
        let Some(conn) = self.slots.remove_connected(id) else {
            return;
        };
        let outgoing = conn.info.is_outbound();
        let will_reconnect = outgoing && conn.is_persistent() && !self.net.is_shutting_down();

        tracing::info!(conn = %id, addr = %conn.info.remote, reason = %reason, "Disconnected");
        let keep = self.events.on_disconnected(&self.net, id, will_reconnect);

        if let Some(listener_id) = conn.info.listener {
            if let Some(listener) = self.slots.listener(listener_id) {
                if !listener.is_enabled() && !listener.is_full(self.slots.incoming_for(listener_id)) {
                    tracing::debug!(listener = %listener_id, "Listener accepting again");
                    listener.set_enabled(true);
                }
            }
        }

        match conn.requested {
            Some(requested) if will_reconnect && keep => match Attempt::new(requested) {
                Ok(mut attempt) => {
                    let new_id = self.slots.allocate_id();
                    tracing::debug!(conn = %id, retry = %new_id, "Scheduling reconnect");
                    self.launcher.wait_retry(new_id, &mut attempt);
                    self.slots.insert_attempt(new_id, attempt);
                }
                Err(e) => tracing::warn!(conn = %id, error = %e, "Cannot reconnect"),
            },
            _ if outgoing => self.request_outgoing(),
            _ => {}
        }
    }

    /// Try to bind a requested listener, arming a retry on failure.
    fn bind_with_retry(&mut self, id: ConnId, descriptor: ListenerDescriptor, retries: i32) {
        let bound = descriptor.network.validate().and_then(|()| {
            Listener::bind(self.runtime.handle(), id, descriptor.clone(), self.net.shared.events.clone())
        });
        match bound {
            Ok(listener) => {
                let local_addr = listener.local_addr;
                self.slots.insert_listener(id, ListenerEntry::Bound(listener));
                self.events.on_bind(&self.net, id, &descriptor, local_addr);
            }
            Err(error) => {
                let retry = if retries != 0 && !self.net.is_shutting_down() {
                    let next = self.slots.allocate_id();
                    let timer = self
                        .launcher
                        .schedule(descriptor.options.retry_interval, EngineEvent::BindRetryDue(next));
                    self.slots.insert_listener(
                        next,
                        ListenerEntry::Retrying {
                            descriptor: descriptor.clone(),
                            retries: if retries > 0 { retries - 1 } else { retries },
                            timer,
                        },
                    );
                    Some(next)
                } else {
                    None
                };
                tracing::warn!(
                    listener = %id,
                    addr = %descriptor.bind_addr,
                    error = %error,
                    retry = ?retry,
                    "Failed to bind listener"
                );
                self.events.on_bind_failure(&self.net, id, &descriptor, &error, retry);
            }
        }
    }

    fn on_bind_retry_due(&mut self, id: ConnId) {
        match self.slots.take_listener(id) {
            Some(ListenerEntry::Retrying { descriptor, retries, .. }) => {
                self.bind_with_retry(id, descriptor, retries);
            }
            Some(entry) => self.slots.insert_listener(id, entry),
            None => tracing::trace!(listener = %id, "Ignoring stale bind retry"),
        }
    }

    /// Release everything and notify the collaborator.
    fn shutdown_now(&mut self) {
        if self.phase == Phase::Drained {
            return;
        }
        tracing::info!("Shutting down connection engine");
        self.net.shared.shutdown_requested.store(true, Ordering::SeqCst);
        self.ticker = None;

        let drained = self.slots.take_all();
        let listeners = drained.listening.len();
        drop(drained.listening);

        for (id, mut attempt) in drained.connecting {
            let kind = match (&attempt.strategy, &attempt.stage) {
                (Strategy::Proxied, _) => FailureKind::Proxy,
                (_, AttemptStage::Resolving(_)) => FailureKind::Resolve,
                _ => FailureKind::Connect,
            };
            attempt.stage = AttemptStage::Idle;
            let failure = ConnectionFailure {
                id,
                kind,
                requested: attempt.descriptor.clone(),
                failed: attempt.failed_descriptor(),
                error: NetError::Shutdown,
                retry: None,
            };
            match kind {
                FailureKind::Proxy => self.events.on_proxy_failure(&self.net, &failure),
                _ => self.events.on_connection_failure(&self.net, &failure),
            }
        }

        for (id, mut attempt) in drained.resolving {
            attempt.stage = AttemptStage::Idle;
            self.events
                .on_dns_failure(&self.net, id, &attempt.descriptor, &NetError::Shutdown, None);
        }

        for (id, conn) in drained.connected {
            conn.task.cancel();
            self.events.on_disconnected(&self.net, id, false);
        }

        // Let the aborted tasks run their destructors and close sockets
        self.runtime.block_on(tokio::task::yield_now());

        tracing::info!(listeners, "Connection engine stopped");
        self.events.on_shutdown(&self.net);
        self.phase = Phase::Drained;
    }
}

fn build_runtime() -> NetResult<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        startups: usize,
        shutdowns: usize,
    }

    impl NetworkEvents for Counter {
        fn on_startup(&mut self, _net: &NetHandle) {
            self.startups += 1;
        }

        fn on_shutdown(&mut self, _net: &NetHandle) {
            self.shutdowns += 1;
        }
    }

    struct NoDns;

    impl HostResolver for NoDns {
        fn lookup(&self, host: &str) -> crate::dns::LookupFuture {
            let host = host.to_string();
            Box::pin(async move {
                Err(NetError::DnsResolutionFailed {
                    host,
                    error: "disabled".to_string(),
                })
            })
        }
    }

    fn handler() -> ConnectionHandler<Counter> {
        ConnectionHandler::with_resolver(HandlerConfig::default(), Counter::default(), Arc::new(NoDns)).unwrap()
    }

    #[test]
    fn test_start_twice() {
        let mut handler = handler();
        handler.start(0).unwrap();
        assert!(matches!(handler.start(0), Err(NetError::AlreadyStarted)));
        assert_eq!(handler.events().startups, 1);
    }

    #[test]
    fn test_shutdown_drains_once() {
        let mut handler = handler();
        handler.start(0).unwrap();

        handler.shutdown();
        handler.shutdown();
        assert!(!handler.pump(true));
        assert!(!handler.pump(false));
        assert!(handler.is_drained());
        assert_eq!(handler.events().shutdowns, 1);
    }

    #[test]
    fn test_pump_before_start() {
        let mut handler = handler();
        assert!(!handler.pump(true));
        assert!(!handler.pump(false));

        handler.start(0).unwrap();
        assert!(handler.pump(false));
    }

    #[test]
    fn test_zero_request_interval_rejected() {
        let config = HandlerConfig::default().with_request_interval(Duration::ZERO);
        let result = ConnectionHandler::with_resolver(config, Counter::default(), Arc::new(NoDns));
        assert!(matches!(result, Err(NetError::InvalidConfig(_))));
    }

    #[test]
    fn test_handle_calls_on_unknown_id() {
        let handler = handler();
        let net = handler.handle();
        let id = ConnId::new(42);

        assert!(matches!(net.send(id, b"x"), Err(NetError::NotConnected(_))));
        assert!(matches!(net.pause_recv(id), Err(NetError::NotConnected(_))));
        assert!(matches!(net.close(id, true), Err(NetError::NotConnected(_))));
        assert!(!net.is_connected(id));
    }

    #[test]
    fn test_bind_reports_address() {
        let mut handler = handler();
        handler.start(0).unwrap();
        let desc = ListenerDescriptor::new(
            "127.0.0.1:0".parse().unwrap(),
            ConnectionOptions::default(),
            NetworkConfig::default(),
        );
        let id = handler.bind(desc).unwrap();

        let addr = handler.listener_addr(id).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(handler.listening_count(), 1);
        assert_eq!(handler.connection_state(id), Some(ConnState::Connected));
    }
}
