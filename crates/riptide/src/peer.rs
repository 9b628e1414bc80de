use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::error::RiptideError;
use crate::session::Session;
use crate::transport::{self, Transport};
use riptide_proto::{Handshake, Message, HANDSHAKE_LEN};

/// How often the reader logs that a peer has gone quiet.
const IDLE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Choking and interest state plus task-lifecycle flags.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub active: bool,
    pub reader_started: bool,
    pub writer_started: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            active: false,
            reader_started: false,
            writer_started: false,
        }
    }
}

/// One live connection: immutable identity, four-flag state, a bounded
/// write queue drained by the writer task, and one-shot quit signals for
/// the reader/writer pair.
///
/// The connection does not own the session; the per-peer tasks receive a
/// session handle, and teardown is always driven by the session through its
/// quit channel.
#[derive(Debug)]
pub struct PeerConnection {
    pub id: [u8; 20],
    pub id_hex: String,
    pub addr: SocketAddr,

    flags: Mutex<Flags>,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,

    write_tx: mpsc::Sender<Message>,
    write_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    quit_reader: Notify,
    quit_writer: Notify,
    /// Serializes close against concurrent reader/writer failures.
    pub(crate) close_lock: tokio::sync::Mutex<()>,

    /// Outstanding block requests `(piece, begin)` for the scheduler.
    inflight: Mutex<HashSet<(u32, u32)>>,
}

impl PeerConnection {
    pub fn new(id: [u8; 20], addr: SocketAddr, queue_capacity: usize) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(queue_capacity);
        let now = Instant::now();
        Arc::new(Self {
            id,
            id_hex: hex::encode(id),
            addr,
            flags: Mutex::new(Flags::default()),
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            quit_reader: Notify::new(),
            quit_writer: Notify::new(),
            close_lock: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(HashSet::new()),
        })
    }

    pub fn flags(&self) -> Flags {
        *self.flags.lock().unwrap()
    }

    pub fn update_flags(&self, update: impl FnOnce(&mut Flags)) {
        update(&mut self.flags.lock().unwrap())
    }

    pub fn last_read(&self) -> Instant {
        *self.last_read.lock().unwrap()
    }

    pub fn last_write(&self) -> Instant {
        *self.last_write.lock().unwrap()
    }

    fn touch_read(&self) {
        *self.last_read.lock().unwrap() = Instant::now();
    }

    fn touch_write(&self) {
        *self.last_write.lock().unwrap() = Instant::now();
    }

    /// Queues a message for the writer task; waits when the queue is full.
    pub async fn enqueue(&self, message: Message) {
        if self.write_tx.send(message).await.is_err() {
            debug!(peer = %self.id_hex, "write queue closed, message dropped");
        }
    }

    /// Queue variant for broadcast paths that must not block: drops the
    /// message when the queue is full.
    pub fn enqueue_nowait(&self, message: Message) {
        if let Err(e) = self.write_tx.try_send(message) {
            warn!(peer = %self.id_hex, error = %e, "write queue full, message dropped");
        }
    }

    pub fn track_request(&self, piece: u32, begin: u32) -> bool {
        self.inflight.lock().unwrap().insert((piece, begin))
    }

    pub fn request_done(&self, piece: u32, begin: u32) {
        self.inflight.lock().unwrap().remove(&(piece, begin));
    }

    pub fn inflight_requests(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn has_inflight(&self, piece: u32, begin: u32) -> bool {
        self.inflight.lock().unwrap().contains(&(piece, begin))
    }

    /// Non-blocking quit delivery to both tasks; safe to call repeatedly.
    pub fn signal_quit(&self) {
        self.quit_reader.notify_one();
        self.quit_writer.notify_one();
    }

    /// Marks the connection inactive, returning whether it was active. The
    /// session's quitter uses this under `close_lock` to make close
    /// idempotent.
    pub fn take_active(&self) -> bool {
        let mut flags = self.flags.lock().unwrap();
        let was = flags.active;
        flags.active = false;
        was
    }

    pub fn mark_active(&self) {
        self.flags.lock().unwrap().active = true;
    }

    /// Takes ownership of the write-queue receiver; panics on a second
    /// call, which would mean two writer tasks for one socket.
    pub(crate) fn take_write_rx(&self) -> mpsc::Receiver<Message> {
        self.write_rx
            .lock()
            .unwrap()
            .take()
            .expect("peer tasks started twice")
    }

    /// Splits the transport and launches the reader and writer tasks.
    pub fn start(self: Arc<Self>, transport: Transport, session: Arc<Session>) {
        let (read_half, write_half) = tokio::io::split(transport);
        let rx = self.take_write_rx();

        {
            let mut flags = self.flags.lock().unwrap();
            flags.reader_started = true;
            flags.writer_started = true;
        }

        let reader_conn = self.clone();
        let reader_session = session.clone();
        tokio::spawn(async move {
            reader_conn.reader_loop(read_half, reader_session).await;
        });

        tokio::spawn(async move {
            self.writer_loop(write_half, rx, session).await;
        });
    }

    /// Reads the socket as a byte stream, framing by the 4-byte length
    /// prefix: every complete message in the buffer is dispatched, partial
    /// tails wait for the next read.
    async fn reader_loop(self: Arc<Self>, mut read_half: ReadHalf<Transport>, session: Arc<Session>) {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            tokio::select! {
                _ = self.quit_reader.notified() => {
                    debug!(peer = %self.id_hex, "reader quit signal received");
                    break;
                }
                _ = sleep(IDLE_LOG_INTERVAL) => {
                    debug!(peer = %self.id_hex, idle = ?IDLE_LOG_INTERVAL, "peer reader idle");
                }
                result = read_half.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!(peer = %self.id_hex, "connection closed by peer");
                            session.route_quit(&self).await;
                            break;
                        }
                        Ok(n) => {
                            self.touch_read();
                            session.record_download(&self.id_hex, n);
                            if !Self::drain_frames(&self, &mut buf, &session).await {
                                break;
                            }
                        }
                        Err(e) if is_transient(&e) => {
                            debug!(peer = %self.id_hex, error = %e, "transient read error");
                        }
                        Err(e) => {
                            debug!(peer = %self.id_hex, error = %e, "read error, closing");
                            session.route_quit(&self).await;
                            break;
                        }
                    }
                }
            }
        }
        self.flags.lock().unwrap().reader_started = false;
    }

    /// Dispatches every complete frame in `buf`. Returns false when the
    /// connection must die (wire violation or session-reported protocol
    /// error).
    async fn drain_frames(conn: &Arc<Self>, buf: &mut BytesMut, session: &Arc<Session>) -> bool {
        loop {
            match Message::decode(buf) {
                Ok(Some((message, consumed))) => {
                    buf.advance(consumed);
                    debug!(peer = %conn.id_hex, message = message.name(), "message received");
                    if let Err(e) = session.handle_message(conn, message).await {
                        warn!(peer = %conn.id_hex, error = %e, "dispatch failed, closing");
                        session.route_quit(conn).await;
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!(peer = %conn.id_hex, error = %e, "wire violation, closing");
                    session.route_quit(conn).await;
                    return false;
                }
            }
        }
    }

    /// Drains the write queue; when idle past the keep-alive interval,
    /// emits a keep-alive frame instead.
    async fn writer_loop(
        self: Arc<Self>,
        mut write_half: WriteHalf<Transport>,
        mut rx: mpsc::Receiver<Message>,
        session: Arc<Session>,
    ) {
        let keep_alive = session.config().keep_alive_interval;
        loop {
            let idle_deadline = self.last_write() + keep_alive;
            tokio::select! {
                _ = self.quit_writer.notified() => {
                    debug!(peer = %self.id_hex, "writer quit signal received");
                    break;
                }
                maybe = rx.recv() => {
                    let Some(message) = maybe else { break };
                    if !Self::write_message(&self, &mut write_half, message, &session).await {
                        break;
                    }
                }
                _ = sleep_until(idle_deadline) => {
                    debug!(peer = %self.id_hex, "writer idle, sending keep-alive");
                    if !Self::write_message(&self, &mut write_half, Message::KeepAlive, &session).await {
                        break;
                    }
                }
            }
        }
        self.flags.lock().unwrap().writer_started = false;
    }

    /// Returns false when the connection has been routed to the quitter.
    async fn write_message(
        conn: &Arc<Self>,
        write_half: &mut WriteHalf<Transport>,
        message: Message,
        session: &Arc<Session>,
    ) -> bool {
        let encoded = message.encode();
        let result = async {
            write_half.write_all(&encoded).await?;
            write_half.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                conn.touch_write();
                session.record_upload(&conn.id_hex, encoded.len());
                if let Message::Piece { data, .. } = &message {
                    session.record_served_block(data.len()).await;
                }
                true
            }
            Err(e) if is_transient(&e) => {
                debug!(peer = %conn.id_hex, error = %e, "transient write error, re-queueing");
                conn.enqueue_nowait(message);
                true
            }
            Err(e) => {
                debug!(peer = %conn.id_hex, error = %e, "write error, closing");
                session.route_quit(conn).await;
                false
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Connects to a peer with the configured timeout.
pub async fn dial(addr: SocketAddr, dial_timeout: Duration) -> Result<Transport, RiptideError> {
    let stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RiptideError::Timeout(format!("dialing {}", addr)))??;
    stream.set_nodelay(true).ok();
    Ok(transport::from_tcp(stream))
}

/// Sends our handshake, reads the peer's, and validates the protocol string
/// and info-hash. Returns the peer's handshake so the caller can adopt its
/// peer id.
pub async fn perform_handshake(
    transport: &mut Transport,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
) -> Result<Handshake, RiptideError> {
    let ours = Handshake::new(info_hash, local_peer_id);
    transport.write_all(&ours.encode()).await?;
    transport.flush().await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    transport.read_exact(&mut buf).await?;
    let theirs = Handshake::decode(&buf)?;
    if theirs.info_hash != info_hash {
        return Err(RiptideError::info_hash_mismatch(info_hash, theirs.info_hash));
    }
    Ok(theirs)
}
