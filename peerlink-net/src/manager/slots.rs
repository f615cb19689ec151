//! Connection tracking.
//!
//! Every live id sits in exactly one of four collections: resolving,
//! connecting, connected or listening. Moving an id between them happens
//! inside a single engine step, so callbacks never see it in two places or in
//! none.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::OwnedTask;
use crate::manager::inbound::Listener;
use crate::manager::outbound::Attempt;
use crate::peer::connection::ConnShared;
use crate::peer::{ConnId, ConnState, ConnectionDescriptor, ConnectionDirection, ConnectionInfo, ListenerDescriptor};

/// Connected entries visible to other threads.
pub type Registry = Mutex<HashMap<ConnId, Arc<ConnShared>>>;

/// An established connection.
#[derive(Debug)]
pub struct Connected {
    /// State shared with the I/O task.
    pub shared: Arc<ConnShared>,
    /// Snapshot data.
    pub info: ConnectionInfo,
    /// The I/O task.
    pub task: OwnedTask,
    /// Requested descriptor, for outgoing connections.
    pub requested: Option<ConnectionDescriptor>,
}

impl Connected {
    /// Whether a disconnect should be followed by a reconnect.
    pub fn is_persistent(&self) -> bool {
        self.requested.as_ref().is_some_and(|d| d.options.persistent)
    }
}

/// A listener, bound or waiting to retry its bind.
#[derive(Debug)]
pub enum ListenerEntry {
    /// Accepting.
    Bound(Listener),
    /// Bind failed; the timer posts a retry.
    Retrying {
        descriptor: ListenerDescriptor,
        retries: i32,
        timer: OwnedTask,
    },
}

/// Everything taken out of the collections at shutdown.
#[derive(Debug, Default)]
pub struct Drained {
    pub resolving: Vec<(ConnId, Attempt)>,
    pub connecting: Vec<(ConnId, Attempt)>,
    pub connected: Vec<(ConnId, Connected)>,
    pub listening: Vec<(ConnId, ListenerEntry)>,
}

/// The four tracking collections and id allocation.
#[derive(Debug)]
pub struct ConnectionSlots {
    /// Next id to hand out.
    next_id: u64,
    /// Set once the counter has wrapped.
    wrapped: bool,
    /// Resolve-only requests.
    resolving: HashMap<ConnId, Attempt>,
    /// Outgoing attempts, including those waiting to retry.
    connecting: HashMap<ConnId, Attempt>,
    /// Established connections.
    connected: HashMap<ConnId, Connected>,
    /// Listeners.
    listening: HashMap<ConnId, ListenerEntry>,
    /// Mirror of `connected` for cross-thread calls.
    registry: Arc<Registry>,
}

impl ConnectionSlots {
    /// Create empty collections mirroring into `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            next_id: 1,
            wrapped: false,
            resolving: HashMap::new(),
            connecting: HashMap::new(),
            connected: HashMap::new(),
            listening: HashMap::new(),
            registry,
        }
    }

    /// Allocate a fresh id, skipping any still tracked after a wrap.
    pub fn allocate_id(&mut self) -> ConnId {
        loop {
            let id = ConnId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.wrapped = true;
            }
            if !self.is_tracked(id) {
                return id;
            }
        }
    }

    /// Check if an id sits in any collection.
    pub fn is_tracked(&self, id: ConnId) -> bool {
        self.resolving.contains_key(&id)
            || self.connecting.contains_key(&id)
            || self.connected.contains_key(&id)
            || self.listening.contains_key(&id)
    }

    /// State of an id. Released ids are terminal; unknown ids are `None`.
    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        if let Some(attempt) = self.resolving.get(&id).or_else(|| self.connecting.get(&id)) {
            return Some(attempt.state());
        }
        if let Some(conn) = self.connected.get(&id) {
            return Some(if conn.shared.is_disconnecting() {
                ConnState::DisconnectingDrain
            } else {
                ConnState::Connected
            });
        }
        if self.listening.contains_key(&id) {
            return Some(ConnState::Connected);
        }
        let issued = self.wrapped || (id.0 >= 1 && id.0 < self.next_id);
        issued.then_some(ConnState::Terminal)
    }

    /// Track an outgoing attempt in the collection matching its strategy.
    pub fn insert_attempt(&mut self, id: ConnId, attempt: Attempt) {
        debug_assert!(!self.is_tracked(id));
        if attempt.is_resolve_only() {
            self.resolving.insert(id, attempt);
        } else {
            self.connecting.insert(id, attempt);
        }
    }

    /// Stop tracking an attempt.
    pub fn take_attempt(&mut self, id: ConnId) -> Option<Attempt> {
        self.resolving.remove(&id).or_else(|| self.connecting.remove(&id))
    }

    /// Get an attempt.
    pub fn attempt_mut(&mut self, id: ConnId) -> Option<&mut Attempt> {
        match self.resolving.get_mut(&id) {
            Some(attempt) => Some(attempt),
            None => self.connecting.get_mut(&id),
        }
    }

    /// Track an established connection.
    pub fn insert_connected(&mut self, id: ConnId, conn: Connected) {
        debug_assert!(!self.is_tracked(id));
        self.registry.lock().insert(id, conn.shared.clone());
        self.connected.insert(id, conn);
    }

    /// Stop tracking a connection.
    pub fn remove_connected(&mut self, id: ConnId) -> Option<Connected> {
        self.registry.lock().remove(&id);
        self.connected.remove(&id)
    }

    /// Get a connection.
    pub fn connected(&self, id: ConnId) -> Option<&Connected> {
        self.connected.get(&id)
    }

    /// Get a mutable reference to a connection.
    pub fn connected_mut(&mut self, id: ConnId) -> Option<&mut Connected> {
        self.connected.get_mut(&id)
    }

    /// Track a listener.
    pub fn insert_listener(&mut self, id: ConnId, entry: ListenerEntry) {
        debug_assert!(!self.is_tracked(id));
        self.listening.insert(id, entry);
    }

    /// Stop tracking a listener.
    pub fn take_listener(&mut self, id: ConnId) -> Option<ListenerEntry> {
        self.listening.remove(&id)
    }

    /// Get a bound listener.
    pub fn listener(&self, id: ConnId) -> Option<&Listener> {
        match self.listening.get(&id) {
            Some(ListenerEntry::Bound(listener)) => Some(listener),
            _ => None,
        }
    }

    /// Live connections accepted by a listener.
    pub fn incoming_for(&self, listener: ConnId) -> usize {
        self.connected
            .values()
            .filter(|c| c.info.listener == Some(listener))
            .count()
    }

    /// Get outbound connection count.
    pub fn outbound_count(&self) -> usize {
        self.connected.values().filter(|c| c.info.is_outbound()).count()
    }

    /// Get inbound connection count.
    pub fn inbound_count(&self) -> usize {
        self.connected
            .values()
            .filter(|c| c.info.direction == ConnectionDirection::Inbound)
            .count()
    }

    /// Get connected count.
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Get connecting count.
    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Get resolving count.
    pub fn resolving_count(&self) -> usize {
        self.resolving.len()
    }

    /// Get listening count.
    pub fn listening_count(&self) -> usize {
        self.listening.len()
    }

    /// How many new outgoing attempts to ask for.
    pub fn demand(&self, target: usize, max_simultaneous: usize) -> usize {
        let in_flight = self.connecting.len() + self.resolving.len();
        target
            .saturating_sub(self.outbound_count() + in_flight)
            .min(max_simultaneous)
    }

    /// Check if all four collections are empty.
    pub fn is_empty(&self) -> bool {
        self.resolving.is_empty() && self.connecting.is_empty() && self.connected.is_empty() && self.listening.is_empty()
    }

    /// Move every entry out at once.
    pub fn take_all(&mut self) -> Drained {
        self.registry.lock().clear();
        Drained {
            resolving: self.resolving.drain().collect(),
            connecting: self.connecting.drain().collect(),
            connected: self.connected.drain().collect(),
            listening: self.listening.drain().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionOptions, NetworkConfig, ResolveMode};
    use crate::peer::Address;

    fn attempt(resolve: ResolveMode) -> Attempt {
        let desc = ConnectionDescriptor::new(
            Address::host("seed.test", 8333),
            ConnectionOptions::default().with_resolve(resolve),
            NetworkConfig::default(),
        );
        Attempt::new(desc).unwrap()
    }

    fn slots() -> ConnectionSlots {
        ConnectionSlots::new(Arc::new(Mutex::new(HashMap::new())))
    }

    #[test]
    fn test_ids_are_fresh() {
        let mut slots = slots();
        let a = slots.allocate_id();
        let b = slots.allocate_id();
        assert_eq!(a, ConnId::new(1));
        assert_eq!(b, ConnId::new(2));
    }

    #[test]
    fn test_wrap_skips_tracked() {
        let mut slots = slots();
        slots.insert_attempt(ConnId::new(0), attempt(ResolveMode::Resolve));
        slots.next_id = u64::MAX;

        assert_eq!(slots.allocate_id(), ConnId::new(u64::MAX));
        // 0 is still tracked, so the counter moves on to 1
        assert_eq!(slots.allocate_id(), ConnId::new(1));
        assert!(slots.wrapped);
    }

    #[test]
    fn test_attempts_routed_by_strategy() {
        let mut slots = slots();
        let lookup = slots.allocate_id();
        let dns = slots.allocate_id();
        slots.insert_attempt(lookup, attempt(ResolveMode::ResolveOnly));
        slots.insert_attempt(dns, attempt(ResolveMode::Resolve));

        assert_eq!(slots.resolving_count(), 1);
        assert_eq!(slots.connecting_count(), 1);
        assert_eq!(slots.state(lookup), Some(ConnState::Resolving));
        assert_eq!(slots.state(dns), Some(ConnState::Connecting));

        assert!(slots.take_attempt(lookup).is_some());
        assert_eq!(slots.state(lookup), Some(ConnState::Terminal));
        assert_eq!(slots.state(ConnId::new(99)), None);
    }

    #[test]
    fn test_demand() {
        let mut slots = slots();
        assert_eq!(slots.demand(8, 3), 3);
        assert_eq!(slots.demand(2, 3), 2);

        for _ in 0..2 {
            let id = slots.allocate_id();
            slots.insert_attempt(id, attempt(ResolveMode::Resolve));
        }
        assert_eq!(slots.demand(3, 8), 1);
        assert_eq!(slots.demand(2, 8), 0);
    }

    #[test]
    fn test_take_all() {
        let mut slots = slots();
        let id = slots.allocate_id();
        slots.insert_attempt(id, attempt(ResolveMode::ResolveOnly));

        let drained = slots.take_all();
        assert_eq!(drained.resolving.len(), 1);
        assert!(slots.is_empty());
    }
}
