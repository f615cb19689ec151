//! Per-connection I/O task.
//!
//! Once a socket is established it is handed to [`spawn_connection`], which
//! runs the read/write loop for the rest of the connection's life. The engine
//! and any other thread talk to the task through [`ConnShared`]: outbound
//! bytes are appended to a shared buffer and the task is woken, everything
//! else goes through the command channel. The task reports upward only by
//! posting engine events, and always finishes with exactly one
//! [`ConnEvent::Closed`].

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::Decoder;

use crate::config::{ConnectionOptions, NetworkConfig};
use crate::error::{NetError, NetResult};
use crate::handle::OwnedTask;
use crate::manager::ratelimit::{ConnLimiter, IoDirection};
use crate::manager::EngineEvent;
use crate::peer::{ConnId, ConnectionDirection};
use crate::protocol::FrameCodec;

/// Largest single read.
const READ_CHUNK: usize = 64 * 1024;

/// Largest single write.
const WRITE_CHUNK: usize = 64 * 1024;

/// Commands from the engine to a connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnCommand {
    /// Stop reading.
    Pause,
    /// Start reading again.
    Resume,
    /// Close now, or after the send buffer drains.
    Close { immediately: bool },
    /// Re-arm the ping deadline. `None` clears it.
    ResetPing(Option<Duration>),
}

/// Events from a connection task to the engine.
#[derive(Debug)]
pub enum ConnEvent {
    /// Bytes were received.
    BytesRead { delta: usize, total: u64 },
    /// Bytes were sent.
    BytesWritten { delta: usize, total: u64 },
    /// Complete messages, header included, in arrival order.
    Messages(Vec<Bytes>),
    /// The stream failed framing. `Closed` follows.
    Malformed(NetError),
    /// The send buffer crossed the high watermark.
    WriteBufferFull { size: usize },
    /// The send buffer drained back to the high watermark.
    WriteBufferReady { size: usize },
    /// The ping deadline passed.
    PingTimeout,
    /// The task is finished. Always the last event for the connection.
    Closed { reason: DisconnectReason },
}

/// Why a connection task ended.
#[derive(Debug)]
pub enum DisconnectReason {
    /// Closed by the engine.
    Requested,
    /// The peer closed the stream.
    Eof,
    /// Socket error.
    Io(io::Error),
    /// A timeout fired.
    Timeout(&'static str),
    /// The peer sent a malformed message.
    Malformed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "closed locally"),
            DisconnectReason::Eof => write!(f, "closed by peer"),
            DisconnectReason::Io(e) => write!(f, "socket error: {}", e),
            DisconnectReason::Timeout(kind) => write!(f, "{} timeout", kind),
            DisconnectReason::Malformed => write!(f, "malformed message"),
        }
    }
}

/// Socket timeouts of an established connection. Zero disables one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoTimeouts {
    /// Until the first byte moves.
    pub initial: Duration,
    /// Between reads while reading is enabled.
    pub recv: Duration,
    /// Between writes while output is pending.
    pub send: Duration,
}

impl From<&ConnectionOptions> for IoTimeouts {
    fn from(options: &ConnectionOptions) -> Self {
        Self {
            initial: options.initial_timeout,
            recv: options.recv_timeout,
            send: options.send_timeout,
        }
    }
}

/// Send-side state guarded by one lock.
#[derive(Debug, Default)]
struct Outbound {
    buf: BytesMut,
    /// Set between a full and the matching ready signal.
    full: bool,
    disconnecting: bool,
    pause_depth: u32,
}

/// Connection state shared between the task, the engine and other threads.
#[derive(Debug)]
pub struct ConnShared {
    id: ConnId,
    direction: ConnectionDirection,
    /// High watermark. Zero disables full/ready signals.
    max_send_buffer: usize,
    outbound: Mutex<Outbound>,
    commands: mpsc::UnboundedSender<ConnCommand>,
    wake: Notify,
    limiter: ConnLimiter,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl ConnShared {
    /// Create the shared half and the command receiver for the task.
    pub fn new(
        id: ConnId,
        direction: ConnectionDirection,
        max_send_buffer: usize,
        limiter: ConnLimiter,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnCommand>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            direction,
            max_send_buffer,
            outbound: Mutex::new(Outbound::default()),
            commands,
            wake: Notify::new(),
            limiter,
            events,
        });
        (shared, commands_rx)
    }

    /// Connection id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Connection direction.
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Rate limiter of this connection.
    pub fn limiter(&self) -> &ConnLimiter {
        &self.limiter
    }

    /// Bytes waiting to be sent.
    pub fn buffered(&self) -> usize {
        self.outbound.lock().buf.len()
    }

    /// Whether a close was requested or the task ended.
    pub fn is_disconnecting(&self) -> bool {
        self.outbound.lock().disconnecting
    }

    /// Current pause depth.
    pub fn pause_depth(&self) -> u32 {
        self.outbound.lock().pause_depth
    }

    /// Queue bytes for sending.
    pub fn send(&self, data: &[u8]) -> NetResult<()> {
        {
            let mut out = self.outbound.lock();
            if out.disconnecting {
                return Err(NetError::Disconnecting(self.id));
            }
            let before = out.buf.len();
            out.buf.extend_from_slice(data);
            let after = out.buf.len();
            let max = self.max_send_buffer;
            if max > 0 && !out.full && after > before && after >= max {
                out.full = true;
                self.post(ConnEvent::WriteBufferFull { size: after });
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Increase the pause depth and return the new depth.
    pub fn pause(&self) -> NetResult<u32> {
        let mut out = self.outbound.lock();
        if out.disconnecting {
            return Err(NetError::Disconnecting(self.id));
        }
        out.pause_depth += 1;
        if out.pause_depth == 1 {
            let _ = self.commands.send(ConnCommand::Pause);
        }
        Ok(out.pause_depth)
    }

    /// Decrease the pause depth and return the new depth.
    pub fn unpause(&self) -> NetResult<u32> {
        let mut out = self.outbound.lock();
        if out.pause_depth == 0 {
            return Err(NetError::NotPaused(self.id));
        }
        out.pause_depth -= 1;
        if out.pause_depth == 0 {
            let _ = self.commands.send(ConnCommand::Resume);
        }
        Ok(out.pause_depth)
    }

    /// Request a close. Returns false if one was already requested, unless
    /// this call escalates a draining close to an immediate one.
    pub fn close(&self, immediately: bool) -> bool {
        let mut out = self.outbound.lock();
        if out.disconnecting && !immediately {
            return false;
        }
        out.disconnecting = true;
        self.commands.send(ConnCommand::Close { immediately }).is_ok()
    }

    /// Re-arm the ping deadline. Zero clears it.
    pub fn reset_ping(&self, timeout: Duration) {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        let _ = self.commands.send(ConnCommand::ResetPing(timeout));
    }

    fn post(&self, event: ConnEvent) {
        let _ = self.events.send(EngineEvent::Conn { id: self.id, event });
    }

    /// Copy of up to `max` bytes from the front of the send buffer.
    fn peek(&self, max: usize) -> Bytes {
        let out = self.outbound.lock();
        let n = max.min(out.buf.len());
        Bytes::copy_from_slice(&out.buf[..n])
    }

    /// Drop `n` sent bytes and signal ready once the buffer is back at the
    /// watermark or below.
    fn advance(&self, n: usize) {
        let mut out = self.outbound.lock();
        out.buf.advance(n);
        if out.full && out.buf.len() <= self.max_send_buffer {
            out.full = false;
            self.post(ConnEvent::WriteBufferReady { size: out.buf.len() });
        }
    }

    fn mark_closed(&self) {
        let mut out = self.outbound.lock();
        out.disconnecting = true;
        out.buf.clear();
    }
}

/// Start the I/O task for an established stream.
pub fn spawn_connection(
    runtime: &Handle,
    shared: Arc<ConnShared>,
    mut commands: mpsc::UnboundedReceiver<ConnCommand>,
    stream: TcpStream,
    timeouts: IoTimeouts,
    network: NetworkConfig,
) -> OwnedTask {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(conn = %shared.id, error = %e, "Failed to set TCP_NODELAY");
    }

    OwnedTask::spawn(runtime, async move {
        let reason = drive(&shared, &mut commands, stream, timeouts, network).await;
        shared.mark_closed();
        tracing::debug!(conn = %shared.id, reason = %reason, "Connection task finished");
        shared.post(ConnEvent::Closed { reason });
    })
}

/// Which deadline is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Initial,
    Recv,
    Send,
    Ping,
}

impl Deadline {
    fn name(self) -> &'static str {
        match self {
            Deadline::Initial => "initial",
            Deadline::Recv => "recv",
            Deadline::Send => "send",
            Deadline::Ping => "ping",
        }
    }
}

/// Timeout bookkeeping for one connection.
struct Clock {
    timeouts: IoTimeouts,
    started: Instant,
    /// A byte has moved in either direction.
    active: bool,
    last_read: Instant,
    /// Start of the current send wait, while output is pending.
    send_since: Option<Instant>,
    ping: Option<Instant>,
}

impl Clock {
    fn new(timeouts: IoTimeouts) -> Self {
        let now = Instant::now();
        Self {
            timeouts,
            started: now,
            active: false,
            last_read: now,
            send_since: None,
            ping: None,
        }
    }

    fn on_read(&mut self) {
        self.active = true;
        self.last_read = Instant::now();
    }

    fn on_write(&mut self) {
        self.active = true;
        self.send_since = Some(Instant::now());
    }

    fn track_pending(&mut self, pending: bool) {
        match (pending, self.send_since) {
            (true, None) => self.send_since = Some(Instant::now()),
            (false, Some(_)) => self.send_since = None,
            _ => {}
        }
    }

    fn set_ping(&mut self, timeout: Option<Duration>) {
        self.ping = timeout.map(|t| Instant::now() + t);
    }

    /// The earliest armed deadline.
    fn next(&self, reading: bool, pending: bool) -> Option<(Instant, Deadline)> {
        let after = |start: Instant, timeout: Duration, kind: Deadline| {
            (!timeout.is_zero()).then(|| (start + timeout, kind))
        };

        let initial = if self.active {
            None
        } else {
            after(self.started, self.timeouts.initial, Deadline::Initial)
        };
        let recv = if self.active && reading {
            after(self.last_read, self.timeouts.recv, Deadline::Recv)
        } else {
            None
        };
        let send = match self.send_since {
            Some(since) if self.active && pending => after(since, self.timeouts.send, Deadline::Send),
            _ => None,
        };
        let ping = self.ping.map(|at| (at, Deadline::Ping));

        [initial, recv, send, ping]
            .into_iter()
            .flatten()
            .min_by_key(|(at, _)| *at)
    }
}

/// The read/write loop. Returns when the connection is finished.
async fn drive(
    shared: &ConnShared,
    commands: &mut mpsc::UnboundedReceiver<ConnCommand>,
    stream: TcpStream,
    timeouts: IoTimeouts,
    network: NetworkConfig,
) -> DisconnectReason {
    let (mut reader, mut writer) = stream.into_split();
    let mut codec = FrameCodec::new(network);
    let mut inbuf = BytesMut::with_capacity(READ_CHUNK);
    let mut clock = Clock::new(timeouts);
    let mut reading = true;
    let mut draining = false;
    let mut total_read: u64 = 0;
    let mut total_written: u64 = 0;

    loop {
        let pending = shared.buffered() > 0;
        if draining && !pending {
            let _ = writer.shutdown().await;
            return DisconnectReason::Requested;
        }
        clock.track_pending(pending);
        let deadline = clock.next(reading, pending);
        let sleep_at = deadline
            .map(|(at, _)| at)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            command = commands.recv() => match command {
                Some(ConnCommand::Pause) => reading = false,
                Some(ConnCommand::Resume) => {
                    if !draining {
                        reading = true;
                        clock.last_read = Instant::now();
                    }
                }
                Some(ConnCommand::Close { immediately: false }) => {
                    draining = true;
                    reading = false;
                }
                Some(ConnCommand::Close { immediately: true }) | None => {
                    return DisconnectReason::Requested;
                }
                Some(ConnCommand::ResetPing(timeout)) => clock.set_ping(timeout),
            },

            _ = shared.wake.notified(), if !pending => {}

            written = write_some(shared, &mut writer), if pending => match written {
                Ok(0) => {}
                Ok(n) => {
                    clock.on_write();
                    total_written += n as u64;
                    shared.post(ConnEvent::BytesWritten { delta: n, total: total_written });
                }
                Err(e) => return DisconnectReason::Io(e),
            },

            read = read_some(&shared.limiter, &mut reader, &mut inbuf), if reading => match read {
                Ok(0) => return DisconnectReason::Eof,
                Ok(n) => {
                    clock.on_read();
                    total_read += n as u64;
                    shared.post(ConnEvent::BytesRead { delta: n, total: total_read });
                    if inbuf.len() < codec.threshold() {
                        continue;
                    }
                    if let Err(e) = deliver(shared, &mut codec, &mut inbuf) {
                        tracing::warn!(conn = %shared.id, error = %e, "Malformed message");
                        shared.post(ConnEvent::Malformed(e));
                        return DisconnectReason::Malformed;
                    }
                }
                Err(e) => return DisconnectReason::Io(e),
            },

            _ = sleep_until(sleep_at), if deadline.is_some() => match deadline {
                Some((_, Deadline::Ping)) => {
                    clock.ping = None;
                    shared.post(ConnEvent::PingTimeout);
                }
                Some((_, kind)) => return DisconnectReason::Timeout(kind.name()),
                None => {}
            },
        }
    }
}

/// Decode every complete message in `inbuf` and post them as one batch.
///
/// Called only once the buffer reaches the codec's threshold, so a
/// half-received body is not re-inspected on every read.
fn deliver(shared: &ConnShared, codec: &mut FrameCodec, inbuf: &mut BytesMut) -> NetResult<()> {
    let mut messages = Vec::new();
    let outcome = loop {
        match codec.decode(inbuf) {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    if !messages.is_empty() {
        shared.post(ConnEvent::Messages(messages));
    }
    outcome
}

async fn read_some(limiter: &ConnLimiter, reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> io::Result<usize> {
    let allowed = limiter.ready(IoDirection::Read, READ_CHUNK).await;
    buf.reserve(allowed);
    let n = reader.read_buf(&mut (&mut *buf).limit(allowed)).await?;
    limiter.consume(IoDirection::Read, n as u64);
    Ok(n)
}

async fn write_some(shared: &ConnShared, writer: &mut OwnedWriteHalf) -> io::Result<usize> {
    let allowed = shared.limiter.ready(IoDirection::Write, WRITE_CHUNK).await;
    let chunk = shared.peek(allowed);
    if chunk.is_empty() {
        return Ok(0);
    }
    let n = writer.write(&chunk).await?;
    if n == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    shared.limiter.consume(IoDirection::Write, n as u64);
    shared.advance(n);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ratelimit::RateGroup;
    use crate::protocol::RawMessage;
    use tokio::net::TcpListener;
    use tokio_util::codec::Encoder;

    fn shared(max_send_buffer: usize) -> (Arc<ConnShared>, mpsc::UnboundedReceiver<ConnCommand>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let limiter = ConnLimiter::new(Arc::new(RateGroup::default()));
        let (shared, commands) = ConnShared::new(ConnId::new(7), ConnectionDirection::Outbound, max_send_buffer, limiter, events);
        (shared, commands, events_rx)
    }

    fn conn_event(event: EngineEvent) -> ConnEvent {
        match event {
            EngineEvent::Conn { event, .. } => event,
            other => panic!("unexpected event {:?}", other),
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_pause_depth() {
        let (shared, mut commands, _events) = shared(0);

        assert_eq!(shared.pause().unwrap(), 1);
        assert_eq!(shared.pause().unwrap(), 2);
        assert_eq!(shared.unpause().unwrap(), 1);
        assert_eq!(shared.unpause().unwrap(), 0);
        assert!(matches!(shared.unpause(), Err(NetError::NotPaused(_))));

        // Only the outermost transitions reach the task
        assert_eq!(commands.try_recv().unwrap(), ConnCommand::Pause);
        assert_eq!(commands.try_recv().unwrap(), ConnCommand::Resume);
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn test_send_crosses_watermark_once() {
        let (shared, _commands, mut events) = shared(10);

        shared.send(&[0u8; 6]).unwrap();
        assert!(events.try_recv().is_err());

        shared.send(&[0u8; 6]).unwrap();
        assert!(matches!(conn_event(events.try_recv().unwrap()), ConnEvent::WriteBufferFull { size: 12 }));

        shared.send(&[0u8; 6]).unwrap();
        assert!(events.try_recv().is_err());

        shared.advance(9);
        assert!(matches!(conn_event(events.try_recv().unwrap()), ConnEvent::WriteBufferReady { size: 9 }));
    }

    #[test]
    fn test_ready_at_watermark() {
        let (shared, _commands, mut events) = shared(10);

        shared.send(&[0u8; 15]).unwrap();
        assert!(matches!(conn_event(events.try_recv().unwrap()), ConnEvent::WriteBufferFull { size: 15 }));

        // Exactly at the watermark counts as drained
        shared.advance(5);
        assert!(matches!(conn_event(events.try_recv().unwrap()), ConnEvent::WriteBufferReady { size: 10 }));

        // Growing past it again signals full again
        shared.send(&[0u8; 1]).unwrap();
        assert!(matches!(conn_event(events.try_recv().unwrap()), ConnEvent::WriteBufferFull { size: 11 }));
    }

    #[test]
    fn test_close_rejects_later_sends() {
        let (shared, mut commands, _events) = shared(0);

        assert!(shared.close(false));
        assert!(!shared.close(false));
        assert!(shared.close(true));
        assert!(matches!(shared.send(b"late"), Err(NetError::Disconnecting(_))));
        assert!(matches!(shared.pause(), Err(NetError::Disconnecting(_))));

        assert_eq!(commands.try_recv().unwrap(), ConnCommand::Close { immediately: false });
        assert_eq!(commands.try_recv().unwrap(), ConnCommand::Close { immediately: true });
    }

    #[test]
    fn test_clock_initial_then_steady() {
        let timeouts = IoTimeouts {
            initial: Duration::from_secs(5),
            recv: Duration::from_secs(60),
            send: Duration::ZERO,
        };
        let mut clock = Clock::new(timeouts);
        assert_eq!(clock.next(true, false).map(|(_, k)| k), Some(Deadline::Initial));

        clock.on_read();
        assert_eq!(clock.next(true, true).map(|(_, k)| k), Some(Deadline::Recv));
        // Send timeout disabled and reads paused: nothing armed
        assert_eq!(clock.next(false, true), None);

        clock.set_ping(Some(Duration::from_secs(1)));
        assert_eq!(clock.next(true, false).map(|(_, k)| k), Some(Deadline::Ping));
    }

    #[tokio::test]
    async fn test_messages_and_eof() {
        let (client, server) = socket_pair().await;
        let (shared, commands, mut events) = shared(0);
        let network = NetworkConfig::bitcoin_regtest();
        let _task = spawn_connection(&Handle::current(), shared, commands, server, IoTimeouts::from(&ConnectionOptions::default()), network.clone());

        let mut wire = BytesMut::new();
        let mut codec = FrameCodec::new(network);
        codec.encode(RawMessage::new("ping", vec![1u8; 8]), &mut wire).unwrap();
        codec.encode(RawMessage::new("pong", vec![2u8; 8]), &mut wire).unwrap();

        let mut client = client;
        client.write_all(&wire).await.unwrap();
        drop(client);

        let mut messages = Vec::new();
        loop {
            match conn_event(events.recv().await.unwrap()) {
                ConnEvent::Messages(batch) => messages.extend(batch),
                ConnEvent::Closed { reason } => {
                    assert!(matches!(reason, DisconnectReason::Eof));
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].len(), 32);
    }

    #[tokio::test]
    async fn test_graceful_close_flushes() {
        let (mut client, server) = socket_pair().await;
        let (shared, commands, mut events) = shared(0);
        let _task = spawn_connection(&Handle::current(), shared.clone(), commands, server, IoTimeouts::from(&ConnectionOptions::default()), NetworkConfig::default());

        shared.send(b"hello world").unwrap();
        shared.close(false);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");

        loop {
            if let ConnEvent::Closed { reason } = conn_event(events.recv().await.unwrap()) {
                assert!(matches!(reason, DisconnectReason::Requested));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_initial_timeout() {
        let (_client, server) = socket_pair().await;
        let (shared, commands, mut events) = shared(0);
        let timeouts = IoTimeouts {
            initial: Duration::from_millis(50),
            recv: Duration::ZERO,
            send: Duration::ZERO,
        };
        let _task = spawn_connection(&Handle::current(), shared, commands, server, timeouts, NetworkConfig::default());

        match conn_event(events.recv().await.unwrap()) {
            ConnEvent::Closed { reason } => assert!(matches!(reason, DisconnectReason::Timeout("initial"))),
            other => panic!("unexpected {:?}", other),
        }
    }
}
