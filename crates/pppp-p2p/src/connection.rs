//! Physical links to peers and the set of open links.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use parking_lot::{Mutex, RwLock};
use pppp_protocol::{Message, OpCode, ProtocolError, MAX_FRAME_SIZE};
use pppp_storage::ReplicationSink;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{now_millis, ConnectionSpy, P2pError, Result, TransformPipeline};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We accepted it.
    Inbound,
    /// We dialed it.
    Outbound,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is being established.
    Connecting,
    /// IDENTIFY/OK exchange in progress.
    Handshaking,
    /// Handshake complete; frames are dispatched.
    Open,
    /// Terminal.
    Closed,
}

/// Everything a connection needs from its node.
pub(crate) struct ConnectionContext {
    pub(crate) set: Weak<ConnectionSet>,
    pub(crate) spy: Arc<dyn ConnectionSpy>,
    pub(crate) pipeline: Arc<TransformPipeline>,
    pub(crate) ping_timeout: Duration,
}

/// One link to a peer.
pub struct Connection {
    id: u64,
    host: String,
    port: u16,
    role: Role,
    state: RwLock<ConnectionState>,
    /// Last measured round trip in milliseconds, -1 before the first PONG.
    last_ping: AtomicI64,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending_pings: Mutex<HashMap<i64, Vec<oneshot::Sender<i64>>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    context: ConnectionContext,
}

impl Connection {
    /// Creates a connection and spawns its writer task.
    pub(crate) fn spawn(
        id: u64,
        host: String,
        port: u16,
        role: Role,
        writer: OwnedWriteHalf,
        cancel: CancellationToken,
        context: ConnectionContext,
    ) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let sink = FramedWrite::new(writer, frame_codec());
        tokio::spawn(write_loop(sink, rx, cancel.clone()));

        Arc::new(Self {
            id,
            host,
            port,
            role,
            state: RwLock::new(ConnectionState::Connecting),
            last_ping: AtomicI64::new(-1),
            outbound,
            pending_pings: Mutex::new(HashMap::new()),
            cancel,
            closed: AtomicBool::new(false),
            context,
        })
    }

    /// Node-local identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Peer port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Which side opened the connection.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    /// Returns true once the handshake completed and until the link closes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns true once the link is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Last measured round trip in milliseconds.
    #[must_use]
    pub fn last_ping(&self) -> Option<i64> {
        match self.last_ping.load(Ordering::SeqCst) {
            -1 => None,
            ms => Some(ms),
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends a PING and waits for the matching PONG.
    ///
    /// Fails with [`P2pError::Timeout`] if no PONG arrives within the ping
    /// timeout, and with [`P2pError::TransportClosed`] if the connection
    /// closes first. A timeout does not close the connection.
    pub async fn ping(&self) -> Result<i64> {
        let sent = now_millis();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().entry(sent).or_default().push(tx);
        if let Err(e) = self.send(&Message::Ping(sent)) {
            self.pending_pings.lock().remove(&sent);
            return Err(e);
        }

        match tokio::time::timeout(self.context.ping_timeout, rx).await {
            Ok(Ok(latency)) => Ok(latency),
            Ok(Err(_)) => Err(P2pError::TransportClosed),
            Err(_) => {
                let mut pending = self.pending_pings.lock();
                if let Some(waiters) = pending.get_mut(&sent) {
                    waiters.retain(|w| !w.is_closed());
                    if waiters.is_empty() {
                        pending.remove(&sent);
                    }
                }
                warn!(peer = %self.host, port = self.port, "ping timed out");
                Err(P2pError::Timeout("pong"))
            }
        }
    }

    /// Records a PONG and wakes the pings waiting for it.
    pub(crate) fn handle_pong(&self, sent: i64) {
        let latency = (now_millis() - sent).max(0);
        self.last_ping.store(latency, Ordering::SeqCst);
        let waiters = self.pending_pings.lock().remove(&sent);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(latency);
        }
        trace!(peer = %self.host, port = self.port, latency, "pong");
        self.context.spy.latency_check(latency);
    }

    /// Queues `message` for this peer.
    pub(crate) fn send(&self, message: &Message) -> Result<()> {
        self.send_payload(message.opcode(), message.encode_payload())
    }

    /// Queues an already encoded payload for this peer.
    pub(crate) fn send_payload(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(P2pError::TransportClosed);
        }
        self.enqueue(opcode, payload)
    }

    fn enqueue(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let packed = self.context.pipeline.pack(&self.host, self.port, payload)?;
        if packed.len() + 1 > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: packed.len() + 1,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        let mut frame = BytesMut::with_capacity(1 + packed.len());
        frame.put_u8(opcode.as_byte());
        frame.put_slice(&packed);
        trace!(peer = %self.host, port = self.port, %opcode, len = frame.len(), "queue frame");
        self.outbound
            .send(frame.freeze())
            .map_err(|_| P2pError::TransportClosed)
    }

    /// Reverses the transform pipeline on an inbound payload.
    pub(crate) fn consume(&self, payload: Bytes) -> Result<Bytes> {
        self.context.pipeline.consume(&self.host, self.port, payload)
    }

    pub(crate) fn spy(&self) -> &Arc<dyn ConnectionSpy> {
        &self.context.spy
    }

    /// Sends a best-effort KICK and closes the connection.
    ///
    /// Idempotent. Unblocks pending pings, stops the dispatch loop and removes
    /// the connection from its node. Never waits for the tasks to finish.
    pub fn disconnect(&self) {
        self.shutdown(true);
    }

    /// Closes the connection without telling the peer.
    pub(crate) fn close(&self) {
        self.shutdown(false);
    }

    fn shutdown(&self, kick: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if kick {
            if let Err(e) = self.enqueue(OpCode::Kick, Bytes::new()) {
                debug!(peer = %self.host, port = self.port, error = %e, "could not queue KICK");
            }
        }
        let was_open = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, ConnectionState::Closed) == ConnectionState::Open
        };
        self.cancel.cancel();
        // Dropping the senders fails every waiting ping.
        self.pending_pings.lock().clear();
        if let Some(set) = self.context.set.upgrade() {
            set.remove(self.id);
        }
        if was_open {
            self.context.spy.disconnected();
        }
        info!(peer = %self.host, port = self.port, id = self.id, kick, "connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("last_ping", &self.last_ping())
            .finish()
    }
}

/// Length-delimited framing bounded by [`MAX_FRAME_SIZE`].
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(error = %e, "write failed");
                        cancel.cancel();
                        return;
                    }
                }
                None => break,
            },
        }
    }
    // Flush what was queued before the close, such as a final KICK.
    while let Ok(frame) = rx.try_recv() {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

/// The open connections of a node.
#[derive(Default)]
pub struct ConnectionSet {
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `connection` unless the set already holds `max` connections.
    ///
    /// The check and the insert happen under one lock, so concurrent
    /// handshakes cannot push the set past `max`.
    pub(crate) fn try_insert(&self, connection: Arc<Connection>, max: usize) -> bool {
        let mut connections = self.connections.write();
        if connections.len() >= max {
            return false;
        }
        connections.insert(connection.id(), connection);
        true
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }

    /// Looks up a connection by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Number of connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns true if there are no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Copies the current connections, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.connections.read().values().cloned().collect();
        connections.sort_by_key(|c| c.id());
        connections
    }

    /// Sends `message` to every open connection except `except`.
    ///
    /// Connections that close mid-broadcast are skipped. A message that does
    /// not fit in one frame after the transform stages is dropped with a
    /// warning and the connections stay open. Returns the number of
    /// connections the message was queued for.
    pub fn broadcast(&self, message: &Message, except: Option<u64>) -> usize {
        let opcode = message.opcode();
        let payload = message.encode_payload();
        let mut delivered = 0;
        for connection in self.snapshot() {
            if Some(connection.id()) == except || !connection.is_open() {
                continue;
            }
            match connection.send_payload(opcode, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e @ P2pError::Decode(ProtocolError::TooLarge { .. })) => warn!(
                    peer = %connection.host(),
                    port = connection.port(),
                    %opcode,
                    error = %e,
                    "message does not fit in a frame, not replicated"
                ),
                Err(e) => debug!(
                    peer = %connection.host(),
                    port = connection.port(),
                    %opcode,
                    error = %e,
                    "skipping peer during broadcast"
                ),
            }
        }
        trace!(%opcode, delivered, ?except, "broadcast");
        delivered
    }
}

impl ReplicationSink for ConnectionSet {
    fn replicate(&self, message: Message) {
        self.broadcast(&message, None);
    }
}

impl fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
