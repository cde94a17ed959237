//! A single point-to-point connection: one socket, one reader task, and
//! either a synchronous locked writer or a bounded queue drained by a
//! dedicated writer task.
//!
//! A connection moves forward only: `New → Handshaking → Established →
//! Closing → Closed`. The first two phases happen inside
//! [`Connection::connect`] / [`Connection::accept`] before the object is
//! handed out; a `Closed` connection is discarded and replaced, never reused.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::registry::{ConnectionRegistry, Receiver};
use crate::{framing, handshake, LinkError, PeerAddr, Result};

/// Lifecycle of a connection. Transitions are forward-only; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ConnectionState {
    /// Socket created or accepted, nothing exchanged yet
    New = 0,
    /// Preamble exchange in progress, peer identity not yet trusted
    Handshaking = 1,
    /// Peer identity known, reader (and writer) running
    Established = 2,
    /// Close requested, loops winding down
    Closing = 3,
    /// Socket released, entry removed
    Closed = 4,
}

impl From<u32> for ConnectionState {
    fn from(value: u32) -> Self {
        match value {
            0 => ConnectionState::New,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Established,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

enum Writer {
    /// Synchronous sends under an exclusive write lock
    Direct(Arc<AsyncMutex<BufWriter<OwnedWriteHalf>>>),
    /// Bounded queue drained by a dedicated writer task
    Queued {
        tx: mpsc::Sender<Bytes>,
        pending: Mutex<Option<(mpsc::Receiver<Bytes>, BufWriter<OwnedWriteHalf>)>>,
    },
}

/// One live connection to a peer. Owned by its registry entry; the socket is
/// owned exclusively by this object and its tasks.
pub struct Connection {
    peer: PeerAddr,
    local: PeerAddr,
    state: AtomicU32,
    /// Reference instant for `last_activity`
    epoch: Instant,
    /// Millis since `epoch` of the last frame sent or received
    last_activity: AtomicU64,
    conn_expiry: Duration,
    max_frame_len: usize,
    writer: Writer,
    pending_reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Opens an outbound connection and performs the handshake as initiator.
    /// The dialed address is the connection's peer identity.
    pub(crate) async fn connect(
        addr: PeerAddr,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<Arc<Self>> {
        let config = registry.config();
        let dest = addr.socket_addr();
        let socket = match dest {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(size) = config.send_buf_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = config.recv_buf_size {
            socket.set_recv_buffer_size(size)?;
        }

        let stream = timeout(config.connect_timeout, socket.connect(dest))
            .await
            .map_err(|_| LinkError::ConnectTimeout)??;
        debug!(peer = %addr, "connected, starting handshake");
        Self::establish(stream, Some(addr), registry).await
    }

    /// Wraps an accepted socket and performs the handshake as acceptor. The
    /// identity the peer announces becomes the connection's peer address.
    pub(crate) async fn accept(
        stream: TcpStream,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<Arc<Self>> {
        Self::establish(stream, None, registry).await
    }

    async fn establish(
        stream: TcpStream,
        dialed: Option<PeerAddr>,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<Arc<Self>> {
        let config = registry.config();
        stream.set_nodelay(config.tcp_nodelay)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let announced = handshake::exchange(
            &mut reader,
            &mut writer,
            registry.local_addr(),
            config.handshake_timeout,
            config.version_compat,
        )
        .await?;

        let peer = match dialed {
            Some(dialed) => {
                if dialed != announced {
                    debug!(%dialed, %announced, "peer announced a different identity; keying by dialed address");
                }
                dialed
            }
            None => announced,
        };

        let writer = if config.send_queue_capacity > 0 {
            let (tx, rx) = mpsc::channel(config.send_queue_capacity);
            Writer::Queued {
                tx,
                pending: Mutex::new(Some((rx, writer))),
            }
        } else {
            Writer::Direct(Arc::new(AsyncMutex::new(writer)))
        };

        Ok(Arc::new(Self {
            peer,
            local: registry.local_addr(),
            state: AtomicU32::new(ConnectionState::Established as u32),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            conn_expiry: config.conn_expiry,
            max_frame_len: config.max_frame_len,
            writer,
            pending_reader: Mutex::new(Some(reader)),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        }))
    }

    /// Starts the reader loop (and the writer loop when a send queue is
    /// configured). Called only after the registry has admitted this
    /// connection, so a connection that loses the accept race never delivers
    /// a frame.
    pub(crate) fn start(self: &Arc<Self>, registry: &Arc<ConnectionRegistry>) {
        let reader = self.pending_reader.lock().unwrap().take();
        let Some(reader) = reader else {
            return; // already started
        };

        let conn = Arc::clone(self);
        let weak = Arc::downgrade(registry);
        let receiver = registry.receiver();
        let handle = tokio::spawn(reader_loop(reader, conn, weak, receiver));
        *self.reader_task.lock().unwrap() = Some(handle);

        if let Writer::Queued { pending, .. } = &self.writer {
            if let Some((rx, writer)) = pending.lock().unwrap().take() {
                let conn = Arc::clone(self);
                let weak = Arc::downgrade(registry);
                let handle = tokio::spawn(writer_loop(rx, writer, conn, weak));
                *self.writer_task.lock().unwrap() = Some(handle);
            }
        }
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.local
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Claims the transition into `Closing`. Returns false if another caller
    /// (or the reader loop) is already closing this connection.
    fn begin_close(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if ConnectionState::from(current) >= ConnectionState::Closing {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnectionState::Closing as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::Release);
    }

    /// True only when an idle expiry is configured and this connection has
    /// been idle at least that long at instant `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        let idle_ms = now
            .saturating_duration_since(self.epoch)
            .as_millis()
            .saturating_sub(self.last_activity.load(Ordering::Acquire) as u128);
        expired(idle_ms as u64, self.conn_expiry)
    }

    /// Sends one length-prefixed frame.
    ///
    /// With no send queue, the frame is written and flushed under the
    /// connection's exclusive write lock. With a queue, the frame is copied
    /// and enqueued; a full queue drops the frame with a warning instead of
    /// blocking the caller.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::ConnectionClosed(self.peer));
        }
        match &self.writer {
            Writer::Direct(writer) => {
                let mut writer = writer.lock().await;
                framing::write_frame(&mut *writer, payload).await?;
                self.touch();
                Ok(())
            }
            Writer::Queued { tx, .. } => match tx.try_send(framing::encode_frame(payload)) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer = %self.peer, len = payload.len(), "send queue full, dropping frame");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(LinkError::ConnectionClosed(self.peer))
                }
            },
        }
    }

    /// Closes the connection: stops both loops and releases the socket.
    /// Idempotent and safe to call concurrently with the loops' own
    /// self-initiated close. Does not touch the registry and fires no
    /// notifications; callers that removed the entry decide about those.
    pub(crate) fn close(&self) {
        self.begin_close();

        // Drop any never-started halves so the socket closes even if this
        // connection was rejected before start().
        drop(self.pending_reader.lock().unwrap().take());
        if let Writer::Queued { pending, .. } = &self.writer {
            drop(pending.lock().unwrap().take());
        }

        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Writer::Direct(writer) = &self.writer {
            // graceful shutdown of the write half needs a runtime; without
            // one the socket still closes when the last Arc drops
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let writer = Arc::clone(writer);
                handle.spawn(async move {
                    let mut writer = writer.lock().await;
                    let _ = writer.shutdown().await;
                });
            }
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Self-initiated close from a reader or writer loop that hit EOF or an
    /// I/O error: removes this connection from the registry (unless already
    /// superseded) and fires the "closed" notification exactly once.
    fn finish_close(self: &Arc<Self>, registry: &Weak<ConnectionRegistry>) {
        if !self.begin_close() {
            return;
        }
        if let Some(registry) = registry.upgrade() {
            if registry.remove_if_current(self.peer, self) {
                registry.notify_closed(self.peer);
            }
        }
        self.set_state(ConnectionState::Closed);
        if let Some(handle) = self.writer_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idle = self
            .epoch
            .elapsed()
            .as_millis()
            .saturating_sub(self.last_activity.load(Ordering::Acquire) as u128);
        write!(
            f,
            "<{} -> {}> ({:?}, idle {}ms)",
            self.local,
            self.peer,
            self.state(),
            idle
        )
    }
}

fn expired(idle_ms: u64, expiry: Duration) -> bool {
    !expiry.is_zero() && u128::from(idle_ms) >= expiry.as_millis()
}

async fn reader_loop(
    mut reader: BufReader<OwnedReadHalf>,
    conn: Arc<Connection>,
    registry: Weak<ConnectionRegistry>,
    receiver: Arc<dyn Receiver>,
) {
    loop {
        match framing::read_frame(&mut reader, conn.max_frame_len).await {
            Ok(Some(frame)) => {
                conn.touch();
                receiver.receive(conn.peer(), &frame);
            }
            Ok(None) => {
                debug!(peer = %conn.peer(), "peer closed connection");
                break;
            }
            Err(err) => {
                debug!(peer = %conn.peer(), error = %err, "read failed, closing connection");
                break;
            }
        }
    }
    conn.finish_close(&registry);
}

async fn writer_loop(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: BufWriter<OwnedWriteHalf>,
    conn: Arc<Connection>,
    registry: Weak<ConnectionRegistry>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!(peer = %conn.peer(), error = %err, "write failed, closing connection");
            break;
        }
        conn.touch();
        // Flush promptly when the queue drains; a queued burst keeps
        // batching until it does.
        if rx.is_empty() {
            if let Err(err) = writer.flush().await {
                debug!(peer = %conn.peer(), error = %err, "flush failed, closing connection");
                break;
            }
        }
    }
    conn.finish_close(&registry);
}
