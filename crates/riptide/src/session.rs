use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bitset::Bitset;
use crate::config::SessionConfig;
use crate::counters::{Counters, Delta, Snapshot};
use crate::error::RiptideError;
use crate::metainfo::Torrent;
use crate::peer::{self, PeerConnection};
use crate::rate::{Direction, RateTracker};
use crate::storage::{Storage, StorageError, WriteOutcome};
use crate::swarm::BitfieldManager;
use crate::tracker::{TrackerClient, TrackerPeer};
use crate::transport::Transport;
use riptide_proto::{Message, BLOCK_SIZE};

/// Capacity of the channel carrying failed connections to the quitter.
const QUIT_CHANNEL_CAPACITY: usize = 16;

/// One active download session: owns the torrent, the peer registry, the
/// swarm bitfield accounting, storage, rates, counters, and the quit
/// channel every failing peer task reports to.
///
/// Every inbound peer message is dispatched centrally through
/// [`Session::handle_message`], so ordering and locking live in one place.
pub struct Session {
    torrent: Torrent,
    config: SessionConfig,
    local_peer_id: [u8; 20],

    storage: RwLock<Option<Arc<Storage>>>,
    peers: RwLock<HashMap<String, Arc<PeerConnection>>>,
    bitfields: RwLock<BitfieldManager>,
    rates: RateTracker,
    counters: Arc<Counters>,

    counters_rx: StdMutex<Option<mpsc::Receiver<Delta>>>,
    quit_tx: mpsc::Sender<Arc<PeerConnection>>,
    quit_rx: StdMutex<Option<mpsc::Receiver<Arc<PeerConnection>>>>,

    shutdown_tx: watch::Sender<bool>,
    complete_tx: watch::Sender<bool>,
}

impl Session {
    pub fn new(torrent: Torrent, local_peer_id: [u8; 20], config: SessionConfig) -> Arc<Self> {
        let num_pieces = torrent.info.num_pieces();
        let (counters, counters_rx) = Counters::new(torrent.info.total_size());
        let (quit_tx, quit_rx) = mpsc::channel(QUIT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let (complete_tx, _) = watch::channel(false);
        let rates = RateTracker::new(config.rate_sampling_window, config.rate_decay_factor);

        Arc::new(Self {
            torrent,
            config,
            local_peer_id,
            storage: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            bitfields: RwLock::new(BitfieldManager::new(num_pieces)),
            rates,
            counters,
            counters_rx: StdMutex::new(Some(counters_rx)),
            quit_tx,
            quit_rx: StdMutex::new(Some(quit_rx)),
            shutdown_tx,
            complete_tx,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn torrent(&self) -> &Torrent {
        &self.torrent
    }

    pub fn counters(&self) -> Snapshot {
        self.counters.snapshot()
    }

    pub fn rates(&self) -> &RateTracker {
        &self.rates
    }

    pub async fn num_connected(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn local_bitfield(&self) -> Bitset {
        self.bitfields.read().await.local().clone()
    }

    pub fn subscribe_completion(&self) -> watch::Receiver<bool> {
        self.complete_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Creates the storage engine on first use, laying out the file tree.
    pub async fn ensure_storage(&self) -> Result<Arc<Storage>, RiptideError> {
        if let Some(storage) = self.storage.read().await.as_ref() {
            return Ok(storage.clone());
        }
        let mut guard = self.storage.write().await;
        if let Some(storage) = guard.as_ref() {
            return Ok(storage.clone());
        }
        let storage = Arc::new(Storage::create(&self.config.download_dir, &self.torrent.info).await?);
        *guard = Some(storage.clone());
        Ok(storage)
    }

    /// Drives the session: storage creation, the background tasks, the
    /// initial announce (whose failure aborts start), and the periodic
    /// re-announce loop until completion or shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), RiptideError> {
        self.ensure_storage().await?;
        self.clone().start_background_tasks();

        let tracker = TrackerClient::new(
            &self.torrent.announce,
            self.torrent.info_hash,
            self.local_peer_id,
            &self.config,
        )?;

        let mut response = tracker.announce(self.counters.snapshot()).await?;
        info!(peers = response.peers.len(), "initial tracker response");
        for peer in response.peers.drain(..) {
            self.clone().connect_peer(peer);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut complete_rx = self.complete_tx.subscribe();
        loop {
            let next = Duration::from_secs(response.next_announce_secs().max(1) as u64);
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("shutdown requested");
                    break;
                }
                _ = complete_rx.changed() => {
                    info!("all pieces obtained");
                    break;
                }
                _ = sleep(next) => {
                    match tracker.announce(self.counters.snapshot()).await {
                        Ok(mut fresh) => {
                            debug!(peers = fresh.peers.len(), "re-announce ok");
                            for peer in fresh.peers.drain(..) {
                                self.clone().connect_peer(peer);
                            }
                            response = fresh;
                        }
                        Err(e) => warn!(error = %e, "re-announce abandoned"),
                    }
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Spawns the counter reducer, the quitter, and the rate ticker.
    pub(crate) fn start_background_tasks(self: Arc<Self>) {
        let counters_rx = self
            .counters_rx
            .lock()
            .unwrap()
            .take()
            .expect("session started twice");
        tokio::spawn(self.counters.clone().run(counters_rx));

        let quit_rx = self
            .quit_rx
            .lock()
            .unwrap()
            .take()
            .expect("session started twice");
        tokio::spawn(self.clone().quitter(quit_rx));

        tokio::spawn(self.clone().rate_ticker());
    }

    /// Dials and handshakes a tracker-provided peer on its own task.
    pub fn connect_peer(self: Arc<Self>, peer: TrackerPeer) {
        let session = self;
        tokio::spawn(async move {
            if session.peers.read().await.contains_key(&peer.id_hex()) {
                debug!(peer = %peer.id_hex(), "already connected, skipping dial");
                return;
            }
            let transport = match peer::dial(peer.addr, session.config.tcp_dial_timeout).await {
                Ok(transport) => transport,
                Err(e) => {
                    debug!(addr = %peer.addr, error = %e, "dial failed");
                    return;
                }
            };
            match session.clone().attach(transport, peer.addr).await {
                Ok(conn) => info!(peer = %conn.id_hex, addr = %peer.addr, "handshake successful"),
                Err(e) => debug!(addr = %peer.addr, error = %e, "handshake failed"),
            }
        });
    }

    /// Handshakes over an established transport, registers the connection
    /// under the peer id the handshake revealed, and launches its tasks.
    pub async fn attach(
        self: Arc<Self>,
        mut transport: Transport,
        addr: SocketAddr,
    ) -> Result<Arc<PeerConnection>, RiptideError> {
        let theirs =
            peer::perform_handshake(&mut transport, self.torrent.info_hash, self.local_peer_id)
                .await?;
        let conn = PeerConnection::new(theirs.peer_id, addr, self.config.write_queue_capacity);
        self.register_peer(&conn).await?;
        conn.clone().start(transport, self);
        Ok(conn)
    }

    /// Inserts the connection into the registries and enqueues our bitfield
    /// as its first outbound message. At most one connection per peer id.
    pub async fn register_peer(&self, conn: &Arc<PeerConnection>) -> Result<(), RiptideError> {
        let _guard = conn.close_lock.lock().await;
        {
            let mut peers = self.peers.write().await;
            if peers.contains_key(&conn.id_hex) {
                return Err(RiptideError::PeerProtocol(format!(
                    "peer {} already connected",
                    conn.id_hex
                )));
            }
            peers.insert(conn.id_hex.clone(), conn.clone());
        }
        let local_bitfield = {
            let mut manager = self.bitfields.write().await;
            manager.add_peer(&conn.id_hex);
            manager.local_bytes()
        };
        conn.enqueue(Message::Bitfield(Bytes::from(local_bitfield))).await;
        conn.mark_active();
        info!(peer = %conn.id_hex, addr = %conn.addr, "peer registered");
        Ok(())
    }

    /// Routes a failing connection to the quitter. Tolerates double
    /// delivery; close itself is idempotent.
    pub(crate) async fn route_quit(&self, conn: &Arc<PeerConnection>) {
        if self.quit_tx.send(conn.clone()).await.is_err() {
            // Quitter already gone (teardown); close inline.
            self.close_connection(conn).await;
        }
    }

    /// Drains the quit channel, closing each delivered connection.
    async fn quitter(self: Arc<Self>, mut rx: mpsc::Receiver<Arc<PeerConnection>>) {
        while let Some(conn) = rx.recv().await {
            self.close_connection(&conn).await;
        }
    }

    /// Unregisters and signals the peer tasks. Guarded by the connection's
    /// own lock so concurrent reader and writer failures are both absorbed.
    pub async fn close_connection(&self, conn: &Arc<PeerConnection>) {
        let _guard = conn.close_lock.lock().await;
        if conn.take_active() {
            self.peers.write().await.remove(&conn.id_hex);
            self.bitfields.write().await.remove_peer(&conn.id_hex);
            self.rates.remove_peer(&conn.id_hex);
            conn.signal_quit();
            info!(peer = %conn.id_hex, "peer connection closed");
        }
    }

    /// Enqueues a message to every connected peer without blocking.
    pub async fn broadcast(&self, message: Message) {
        let peers = self.peers.read().await;
        debug!(message = message.name(), peers = peers.len(), "broadcast");
        for conn in peers.values() {
            conn.enqueue_nowait(message.clone());
        }
    }

    pub(crate) fn record_download(&self, peer: &str, bytes: usize) {
        self.rates.record(Direction::Download, peer, bytes);
    }

    pub(crate) fn record_upload(&self, peer: &str, bytes: usize) {
        self.rates.record(Direction::Upload, peer, bytes);
    }

    /// Counter delta for a served block, recorded by the writer once the
    /// piece message actually went out.
    pub(crate) async fn record_served_block(&self, bytes: usize) {
        self.counters.record(Delta::Uploaded(bytes as u64)).await;
    }

    /// Central dispatch for every message a reader task parses. An error
    /// return is a protocol violation; the reader closes the connection.
    pub async fn handle_message(
        &self,
        conn: &Arc<PeerConnection>,
        message: Message,
    ) -> Result<(), RiptideError> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                conn.update_flags(|f| f.peer_choking = true);
            }
            Message::Unchoke => {
                conn.update_flags(|f| f.peer_choking = false);
                self.schedule_requests(conn).await;
            }
            Message::Interested => {
                conn.update_flags(|f| f.peer_interested = true);
                // No choking algorithm in the core: reciprocate interest by
                // unchoking, so valid requests can be served.
                if conn.flags().am_choking {
                    conn.update_flags(|f| f.am_choking = false);
                    conn.enqueue(Message::Unchoke).await;
                }
            }
            Message::NotInterested => {
                conn.update_flags(|f| f.peer_interested = false);
                if !conn.flags().am_choking {
                    conn.update_flags(|f| f.am_choking = true);
                    conn.enqueue(Message::Choke).await;
                }
            }
            Message::Have(index) => {
                if index as usize >= self.torrent.info.num_pieces() {
                    return Err(RiptideError::PeerProtocol(format!(
                        "have index {} beyond {} pieces",
                        index,
                        self.torrent.info.num_pieces()
                    )));
                }
                self.bitfields
                    .write()
                    .await
                    .add_piece(&conn.id_hex, index as usize);
                self.probe_interest(conn).await;
                self.schedule_requests(conn).await;
            }
            Message::Bitfield(bytes) => {
                let num_pieces = self.torrent.info.num_pieces();
                let Some(bitfield) = Bitset::from_bytes(&bytes, num_pieces) else {
                    return Err(RiptideError::PeerProtocol(format!(
                        "bitfield of {} bytes for {} pieces",
                        bytes.len(),
                        num_pieces
                    )));
                };
                self.bitfields
                    .write()
                    .await
                    .add_bitfield(&conn.id_hex, bitfield);
                self.probe_interest(conn).await;
                self.schedule_requests(conn).await;
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                self.handle_request(conn, index, begin, length).await;
            }
            Message::Piece { index, begin, data } => {
                conn.request_done(index, begin);
                self.handle_block(conn, index, begin, &data).await;
            }
            Message::Cancel {
                index,
                begin,
                length: _,
            } => {
                if begin % BLOCK_SIZE != 0 || index as usize >= self.torrent.info.num_pieces() {
                    return Err(RiptideError::PeerProtocol(format!(
                        "cancel for piece {} begin {}",
                        index, begin
                    )));
                }
                // No per-peer outbound request ledger in the core; a cancel
                // for an already-queued piece is simply dropped.
                debug!(peer = %conn.id_hex, piece = index, begin, "cancel dropped");
            }
        }
        Ok(())
    }

    /// Serves a block request from storage, enqueueing the piece response.
    async fn handle_request(&self, conn: &Arc<PeerConnection>, index: u32, begin: u32, length: u32) {
        if conn.flags().am_choking {
            debug!(peer = %conn.id_hex, piece = index, "request while choked, dropped");
            return;
        }
        let storage = match self.ensure_storage().await {
            Ok(storage) => storage,
            Err(e) => {
                warn!(error = %e, "storage unavailable, request dropped");
                return;
            }
        };
        match storage.read_block(index, begin, length).await {
            Ok(block) => {
                conn.enqueue(Message::Piece {
                    index,
                    begin,
                    data: Bytes::from(block),
                })
                .await;
            }
            Err(StorageError::InvalidRequest(e)) => {
                debug!(peer = %conn.id_hex, error = %e, "invalid request dropped");
            }
            Err(StorageError::Io(e)) => {
                warn!(peer = %conn.id_hex, error = %e, "block read failed");
            }
        }
    }

    /// Hands an arriving block to storage; on piece completion updates the
    /// local bitfield, the counters, and broadcasts `have`.
    async fn handle_block(&self, conn: &Arc<PeerConnection>, index: u32, begin: u32, data: &[u8]) {
        let storage = match self.ensure_storage().await {
            Ok(storage) => storage,
            Err(e) => {
                warn!(error = %e, "storage unavailable, block dropped");
                return;
            }
        };
        match storage.write_block(index, begin, data).await {
            Ok(WriteOutcome::Pending) => {
                self.schedule_requests(conn).await;
            }
            Ok(WriteOutcome::PieceVerified {
                piece_length,
                torrent_complete,
            }) => {
                self.bitfields.write().await.mark_local_piece(index as usize);
                self.counters.record(Delta::Downloaded(piece_length)).await;
                self.counters.record(Delta::Left(piece_length)).await;
                self.broadcast(Message::Have(index)).await;
                if torrent_complete {
                    info!("torrent complete");
                    let _ = self.complete_tx.send(true);
                } else {
                    self.schedule_requests(conn).await;
                }
            }
            Ok(WriteOutcome::HashMismatch) => {
                // No peer penalty here; the blocks are simply refetched.
                warn!(piece = index, peer = %conn.id_hex, "piece failed verification");
                self.schedule_requests(conn).await;
            }
            Err(StorageError::InvalidRequest(e)) => {
                debug!(peer = %conn.id_hex, error = %e, "block dropped");
            }
            Err(StorageError::Io(e)) => {
                warn!(peer = %conn.id_hex, error = %e, "block write failed");
            }
        }
    }

    /// Declares interest the first time the peer turns out to have a piece
    /// we lack.
    async fn probe_interest(&self, conn: &Arc<PeerConnection>) {
        let interested = self.bitfields.read().await.am_interested(&conn.id_hex);
        if interested && !conn.flags().am_interested {
            conn.update_flags(|f| f.am_interested = true);
            conn.enqueue(Message::Interested).await;
        }
    }

    /// Keeps up to `pipeline_depth` block requests outstanding on an
    /// unchoked, interesting peer, preferring the swarm's rarest piece.
    async fn schedule_requests(&self, conn: &Arc<PeerConnection>) {
        let flags = conn.flags();
        if flags.peer_choking || !flags.am_interested {
            return;
        }
        let storage = match self.ensure_storage().await {
            Ok(storage) => storage,
            Err(_) => return,
        };

        let (interesting, rarest) = {
            let manager = self.bitfields.read().await;
            (
                manager.interesting_pieces(&conn.id_hex),
                manager.rarest_piece(),
            )
        };
        let Some(interesting) = interesting else {
            return;
        };

        let mut order: Vec<usize> = interesting
            .ones()
            .filter(|&i| !storage.has_piece(i as u32))
            .collect();
        if let Some(rarest) = rarest {
            if let Some(pos) = order.iter().position(|&i| i == rarest) {
                order.swap(0, pos);
            }
        }

        let mut slots = self
            .config
            .pipeline_depth
            .saturating_sub(conn.inflight_requests());
        for piece in order {
            if slots == 0 {
                break;
            }
            for (begin, length) in storage.missing_blocks(piece as u32).await {
                if slots == 0 {
                    break;
                }
                if !conn.track_request(piece as u32, begin) {
                    continue;
                }
                debug!(peer = %conn.id_hex, piece, begin, length, "requesting block");
                conn.enqueue(Message::Request {
                    index: piece as u32,
                    begin,
                    length,
                })
                .await;
                slots -= 1;
            }
        }
    }

    /// Periodic decay of idle per-peer speeds.
    async fn rate_ticker(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => self.rates.tick(),
            }
        }
    }

    /// Closes every connection; storage drops with the session.
    async fn teardown(&self) {
        let peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        for conn in peers {
            self.close_connection(&conn).await;
        }
        info!("session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{FileEntry, Info, Layout};
    use riptide_proto::{Handshake, HANDSHAKE_LEN};
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PAYLOAD: &[u8] = b"hello, world";

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// The canonical single-file torrent: "hello.txt", 12 bytes, one piece.
    fn hello_torrent() -> Torrent {
        Torrent {
            announce: "http://tracker.test/announce".to_string(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: None,
            created_by: None,
            encoding: None,
            url_list: Vec::new(),
            info: Info {
                name: "hello.txt".to_string(),
                piece_length: 16384,
                pieces: vec![sha1(PAYLOAD)],
                layout: Layout::SingleFile,
                files: vec![FileEntry {
                    length: PAYLOAD.len() as u64,
                    path: vec!["hello.txt".to_string()],
                }],
                length: PAYLOAD.len() as u64,
            },
            info_hash: [0x42; 20],
        }
    }

    fn session_in(dir: &TempDir) -> Arc<Session> {
        let config = SessionConfig {
            download_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        Session::new(hello_torrent(), *b"-RT0001-local-peer-x", config)
    }

    fn test_conn(id_byte: u8) -> Arc<PeerConnection> {
        PeerConnection::new([id_byte; 20], "127.0.0.1:0".parse().unwrap(), 30)
    }

    #[tokio::test]
    async fn registration_enqueues_local_bitfield() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);

        session.register_peer(&conn).await.unwrap();
        assert_eq!(session.num_connected().await, 1);
        assert!(conn.flags().active);

        let mut rx = conn.take_write_rx();
        match rx.try_recv().unwrap() {
            Message::Bitfield(bytes) => assert_eq!(&bytes[..], &[0u8]),
            other => panic!("expected bitfield, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn second_connection_for_same_id_is_refused() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.register_peer(&test_conn(1)).await.unwrap();
        let err = session.register_peer(&test_conn(1)).await.unwrap_err();
        assert!(matches!(err, RiptideError::PeerProtocol(_)));
        assert_eq!(session.num_connected().await, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unregisters() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();

        session.close_connection(&conn).await;
        assert_eq!(session.num_connected().await, 0);
        assert!(!conn.flags().active);
        // A concurrent second failure delivering the same connection again
        // must be absorbed.
        session.close_connection(&conn).await;
        assert_eq!(session.num_connected().await, 0);
    }

    #[tokio::test]
    async fn bitfield_dispatch_updates_swarm_and_declares_interest() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();
        let mut rx = conn.take_write_rx();
        let _ = rx.try_recv(); // our bitfield

        session
            .handle_message(&conn, Message::Bitfield(Bytes::from_static(&[0b1000_0000])))
            .await
            .unwrap();

        assert!(session.bitfields.read().await.am_interested(&conn.id_hex));
        assert_eq!(session.bitfields.read().await.piece_frequency(0), 1);
        assert_eq!(rx.try_recv().unwrap(), Message::Interested);
        assert!(conn.flags().am_interested);
    }

    #[tokio::test]
    async fn wrong_size_bitfield_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();

        let err = session
            .handle_message(&conn, Message::Bitfield(Bytes::from_static(&[0, 0])))
            .await
            .unwrap_err();
        assert!(matches!(err, RiptideError::PeerProtocol(_)));
    }

    #[tokio::test]
    async fn have_beyond_piece_count_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();

        let err = session
            .handle_message(&conn, Message::Have(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RiptideError::PeerProtocol(_)));
    }

    #[tokio::test]
    async fn unaligned_cancel_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();

        let err = session
            .handle_message(
                &conn,
                Message::Cancel {
                    index: 0,
                    begin: 7,
                    length: 100,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RiptideError::PeerProtocol(_)));
    }

    #[tokio::test]
    async fn unchoke_schedules_rarest_first_requests() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();
        let mut rx = conn.take_write_rx();
        let _ = rx.try_recv(); // our bitfield

        session
            .handle_message(&conn, Message::Bitfield(Bytes::from_static(&[0b1000_0000])))
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Message::Interested);

        session
            .handle_message(&conn, Message::Unchoke)
            .await
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Request {
                index: 0,
                begin: 0,
                length: 12
            }
        );
        assert_eq!(conn.inflight_requests(), 1);

        // A second scheduling pass must not duplicate the in-flight request.
        session
            .handle_message(&conn, Message::Unchoke)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn piece_completion_updates_everything_and_broadcasts_have() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.clone().start_background_tasks();

        let downloader = test_conn(1);
        let observer = test_conn(2);
        session.register_peer(&downloader).await.unwrap();
        session.register_peer(&observer).await.unwrap();
        let mut observer_rx = observer.take_write_rx();
        let _ = observer_rx.try_recv(); // our bitfield

        let mut complete_rx = session.subscribe_completion();
        session
            .handle_message(
                &downloader,
                Message::Piece {
                    index: 0,
                    begin: 0,
                    data: Bytes::from_static(PAYLOAD),
                },
            )
            .await
            .unwrap();

        // Scenario: local bitfield "1", piece on disk, counters moved.
        assert_eq!(session.local_bitfield().await.to_string(), "1");
        let storage = session.ensure_storage().await.unwrap();
        assert!(storage.has_piece(0));
        assert_eq!(storage.num_pieces_obtained(), 1);
        let on_disk = std::fs::read(dir.path().join("hello").join("hello.txt")).unwrap();
        assert_eq!(on_disk, PAYLOAD);

        complete_rx.changed().await.unwrap();
        assert!(*complete_rx.borrow());

        // The other peer got the have broadcast.
        assert_eq!(observer_rx.try_recv().unwrap(), Message::Have(0));

        // Counters: downloaded grew by the piece length, left hit zero.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let snap = session.counters();
            if snap.downloaded == 12 && snap.left == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "counters never settled");
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn corrupt_piece_is_invalidated_not_recorded() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();

        session
            .handle_message(
                &conn,
                Message::Piece {
                    index: 0,
                    begin: 0,
                    data: Bytes::from_static(b"HELLO, WORLD"),
                },
            )
            .await
            .unwrap();

        assert_eq!(session.local_bitfield().await.to_string(), "0");
        let storage = session.ensure_storage().await.unwrap();
        assert!(!storage.has_piece(0));
        assert_eq!(storage.missing_blocks(0).await, vec![(0, 12)]);
    }

    #[tokio::test]
    async fn interested_peer_is_unchoked_and_served() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);

        // Complete the piece locally first.
        let seeder_side = session.ensure_storage().await.unwrap();
        seeder_side.write_block(0, 0, PAYLOAD).await.unwrap();

        let conn = test_conn(1);
        session.register_peer(&conn).await.unwrap();
        let mut rx = conn.take_write_rx();
        let _ = rx.try_recv(); // our bitfield

        // A request while still choked is dropped.
        session
            .handle_message(
                &conn,
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: 12,
                },
            )
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        session
            .handle_message(&conn, Message::Interested)
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Message::Unchoke);
        assert!(conn.flags().peer_interested);
        assert!(!conn.flags().am_choking);

        session
            .handle_message(
                &conn,
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: 12,
                },
            )
            .await
            .unwrap();
        match rx.try_recv().unwrap() {
            Message::Piece { index, begin, data } => {
                assert_eq!((index, begin), (0, 0));
                assert_eq!(&data[..], PAYLOAD);
            }
            other => panic!("expected piece, got {:?}", other),
        }

        // Bad requests are dropped, not fatal.
        session
            .handle_message(
                &conn,
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: 5,
                },
            )
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    /// Full leech flow over an in-memory transport: handshake, bitfields,
    /// interest, unchoke, one block, verification, and the have broadcast.
    #[tokio::test]
    async fn end_to_end_single_piece_download() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.clone().start_background_tasks();
        let info_hash = session.torrent().info_hash;

        let (near, far) = tokio::io::duplex(4096);

        let remote = tokio::spawn(async move {
            let mut far: Transport = Box::new(far);

            // Handshake.
            let mut hs = [0u8; HANDSHAKE_LEN];
            far.read_exact(&mut hs).await.unwrap();
            let incoming = Handshake::decode(&hs).unwrap();
            assert_eq!(incoming.info_hash, info_hash);
            far.write_all(&Handshake::new(info_hash, [7u8; 20]).encode())
                .await
                .unwrap();

            // The session leads with its (empty) bitfield: 6 bytes.
            let mut frame = [0u8; 6];
            far.read_exact(&mut frame).await.unwrap();
            assert_eq!(&frame[..5], &[0, 0, 0, 2, 5]);

            // We have the only piece.
            far.write_all(&Message::Bitfield(Bytes::from_static(&[0b1000_0000])).encode())
                .await
                .unwrap();

            // Interested, then unchoke it.
            let mut frame = [0u8; 5];
            far.read_exact(&mut frame).await.unwrap();
            assert_eq!(frame, [0, 0, 0, 1, 2]);
            far.write_all(&Message::Unchoke.encode()).await.unwrap();

            // Serve the requested block.
            let mut frame = [0u8; 17];
            far.read_exact(&mut frame).await.unwrap();
            let (request, _) = Message::decode(&frame).unwrap().unwrap();
            assert_eq!(
                request,
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: 12
                }
            );
            far.write_all(
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    data: Bytes::from_static(PAYLOAD),
                }
                .encode(),
            )
            .await
            .unwrap();

            // The verified piece comes back as a have broadcast.
            let mut frame = [0u8; 9];
            far.read_exact(&mut frame).await.unwrap();
            let (have, _) = Message::decode(&frame).unwrap().unwrap();
            assert_eq!(have, Message::Have(0));
        });

        let mut complete_rx = session.subscribe_completion();
        let conn = session
            .attach(Box::new(near), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(conn.id, [7u8; 20]);

        tokio::time::timeout(Duration::from_secs(5), complete_rx.changed())
            .await
            .expect("download did not complete")
            .unwrap();

        let on_disk = std::fs::read(dir.path().join("hello").join("hello.txt")).unwrap();
        assert_eq!(on_disk, PAYLOAD);

        remote.await.unwrap();
    }
}
