//! Inbound connection listener.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::error::NetResult;
use crate::handle::OwnedTask;
use crate::manager::EngineEvent;
use crate::peer::{ConnId, ListenerDescriptor};

/// Pause after an accept error before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listening socket and its accept task.
#[derive(Debug)]
pub struct Listener {
    /// Descriptor it was bound from.
    pub descriptor: ListenerDescriptor,
    /// Actual bound address.
    pub local_addr: SocketAddr,
    /// Accepting switch read by the accept task.
    enabled: watch::Sender<bool>,
    /// Accept task. Dropping it closes the socket.
    _task: OwnedTask,
}

impl Listener {
    /// Bind synchronously and start accepting on `runtime`.
    pub fn bind(
        runtime: &Handle,
        id: ConnId,
        descriptor: ListenerDescriptor,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> NetResult<Self> {
        let std_listener = std::net::TcpListener::bind(descriptor.bind_addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        let local_addr = listener.local_addr()?;
        tracing::info!(listener = %id, addr = %local_addr, "Listening for inbound connections");

        let (enabled, enabled_rx) = watch::channel(true);
        let task = OwnedTask::spawn(runtime, accept_loop(id, listener, enabled_rx, events));

        Ok(Self {
            descriptor,
            local_addr,
            enabled,
            _task: task,
        })
    }

    /// Check if the listener is accepting.
    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Start or stop accepting.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.send_replace(enabled);
    }

    /// Check if `live` connections fill this listener.
    pub fn is_full(&self, live: usize) -> bool {
        self.descriptor.max_incoming > 0 && live >= self.descriptor.max_incoming
    }
}

/// Accept connections while enabled and hand them to the engine.
async fn accept_loop(
    id: ConnId,
    listener: TcpListener,
    mut enabled: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    loop {
        if !*enabled.borrow_and_update() {
            if enabled.changed().await.is_err() {
                return;
            }
            continue;
        }

        tokio::select! {
            changed = enabled.changed() => {
                if changed.is_err() {
                    return;
                }
            }

            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    tracing::debug!(listener = %id, addr = %peer, "Accepted inbound connection");
                    if events.send(EngineEvent::Accepted { listener: id, stream, peer }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(listener = %id, error = %e, "Error accepting connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionOptions, NetworkConfig};
    use tokio::net::TcpStream;

    fn descriptor() -> ListenerDescriptor {
        ListenerDescriptor::new("127.0.0.1:0".parse().unwrap(), ConnectionOptions::default(), NetworkConfig::default())
    }

    #[tokio::test]
    async fn test_accept_posts_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Listener::bind(&Handle::current(), ConnId::new(1), descriptor(), tx).unwrap();
        assert!(listener.is_enabled());

        let _client = TcpStream::connect(listener.local_addr).await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::Accepted { listener: id, .. } => assert_eq!(id, ConnId::new(1)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_capacity() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = Listener::bind(runtime.handle(), ConnId::new(2), descriptor().with_max_incoming(2), tx).unwrap();

        assert!(!listener.is_full(1));
        assert!(listener.is_full(2));

        listener.set_enabled(false);
        assert!(!listener.is_enabled());
    }

    #[test]
    fn test_bind_conflict() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut desc = descriptor();
        desc.bind_addr = taken.local_addr().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(Listener::bind(runtime.handle(), ConnId::new(3), desc, tx).is_err());
    }
}
