//! Protocol state machine for one remote peer
//!
//! A connection moves `Connecting -> Handshaking -> Active -> Terminated`.
//! Once registered it runs its own message loop task; piece reads and writes
//! run in further tasks so disk I/O never stalls the loop. Terminated is
//! absorbing and reachable from every phase.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Semaphore, broadcast, watch};

use super::bitfield::BitField;
use super::peer_registry::PeerInfo;
use super::protocol::{
    MessageReceiver, MessageSender, PeerHandshake, PeerId, PeerMessage, PeerTransport,
};
use super::session::TorrentSession;
use super::{InfoHash, PieceIndex, TorrentError};
use crate::config::PeerConfig;

/// Invoked once with the connection's identity when it fails after
/// registration.
pub type RemovalCallback = Box<dyn FnOnce(PeerInfo) + Send>;

/// Which side opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Connecting,
    Handshaking,
    Active,
    Terminated,
}

/// Result of a successful remote handshake.
#[derive(Debug, Clone)]
pub struct HandshakeCompleted {
    pub peer_info: PeerInfo,
    /// Hash exactly as the remote sent it
    pub info_hash: InfoHash,
    pub connection: Arc<PeerConnection>,
}

/// Point-in-time view of a connection for logging and tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub address: SocketAddr,
    pub direction: Direction,
    pub phase: ConnectionPhase,
    pub remote_peer_id: Option<PeerId>,
    pub is_choked: bool,
    pub is_interested: bool,
    pub is_remote_interested: bool,
    pub is_remote_choked: bool,
    pub remote_piece_count: Option<usize>,
}

#[derive(Debug)]
struct ConnectionState {
    phase: ConnectionPhase,
    info_hash: Option<InfoHash>,
    remote_peer_id: Option<PeerId>,
    /// Unknown until the first Bitfield or Have arrives
    remote_bitfield: Option<BitField>,
    /// Remote is choking us
    is_choked: bool,
    /// We want pieces the remote has
    is_interested: bool,
    /// Remote wants pieces we have
    is_remote_interested: bool,
    /// We are choking the remote
    is_remote_choked: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            info_hash: None,
            remote_peer_id: None,
            remote_bitfield: None,
            is_choked: true,
            is_interested: false,
            is_remote_interested: false,
            is_remote_choked: true,
        }
    }
}

/// Connection to one remote peer over an abstract message channel.
pub struct PeerConnection {
    address: SocketAddr,
    direction: Direction,
    config: PeerConfig,
    sender: Arc<dyn MessageSender>,
    /// Held here until the message loop takes it
    receiver: Mutex<Option<Box<dyn MessageReceiver>>>,
    state: RwLock<ConnectionState>,
    /// Piece reads in flight
    upload_slots: Arc<Semaphore>,
    /// Requests accepted but not yet answered
    request_slots: Arc<Semaphore>,
    on_removed: Mutex<Option<RemovalCallback>>,
    closed: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl PeerConnection {
    /// Wraps a usable transport. Nothing is sent until `send_handshake`.
    pub fn new(transport: PeerTransport, direction: Direction, config: PeerConfig) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let upload_slots = Arc::new(Semaphore::new(config.max_pending_uploads.max(1)));
        let request_slots = Arc::new(Semaphore::new(config.max_queued_requests.max(1)));

        Arc::new(Self {
            address: transport.remote_address,
            direction,
            config,
            sender: transport.sender,
            receiver: Mutex::new(Some(transport.receiver)),
            state: RwLock::new(ConnectionState::default()),
            upload_slots,
            request_slots,
            on_removed: Mutex::new(None),
            closed,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.read().phase
    }

    /// Torrent this connection is bound to, once a handshake went either way.
    pub fn info_hash(&self) -> Option<InfoHash> {
        self.state.read().info_hash
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.state.read().remote_peer_id
    }

    /// Registry identity, known after the remote handshake.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.state.read().remote_peer_id.map(|peer_id| PeerInfo {
            address: self.address,
            peer_id,
        })
    }

    pub fn is_choked(&self) -> bool {
        self.state.read().is_choked
    }

    pub fn is_interested(&self) -> bool {
        self.state.read().is_interested
    }

    pub fn is_remote_interested(&self) -> bool {
        self.state.read().is_remote_interested
    }

    /// Snapshot of what the remote has told us it holds.
    pub fn remote_bitfield(&self) -> Option<BitField> {
        self.state.read().remote_bitfield.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.state.read();
        ConnectionStats {
            address: self.address,
            direction: self.direction,
            phase: state.phase,
            remote_peer_id: state.remote_peer_id,
            is_choked: state.is_choked,
            is_interested: state.is_interested,
            is_remote_interested: state.is_remote_interested,
            is_remote_choked: state.is_remote_choked,
            remote_piece_count: state.remote_bitfield.as_ref().map(BitField::true_count),
        }
    }

    /// Binds the connection to `info_hash` and sends our handshake.
    ///
    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Connection already terminated or channel gone
    pub async fn send_handshake(
        &self,
        info_hash: InfoHash,
        local_peer_id: PeerId,
    ) -> Result<(), TorrentError> {
        {
            let mut state = self.state.write();
            if state.phase == ConnectionPhase::Terminated {
                return Err(TorrentError::ConnectionClosed {
                    address: self.address,
                });
            }
            state.info_hash = Some(info_hash);
            if state.phase == ConnectionPhase::Connecting {
                state.phase = ConnectionPhase::Handshaking;
            }
        }

        tracing::debug!("Sending handshake for {} to {}", info_hash, self.address);
        self.send(PeerMessage::Handshake(PeerHandshake::new(
            info_hash,
            local_peer_id,
        )))
        .await
    }

    /// Waits for the remote handshake, bounded by the handshake timeout.
    ///
    /// The received hash must match `expected`, or the hash bound by an
    /// earlier `send_handshake`. Any failure disposes the connection.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Not a handshake, empty fields or hash mismatch
    /// - `TorrentError::HandshakeTimeout` - Remote stayed silent too long
    /// - `TorrentError::ConnectionClosed` - Disposed or disconnected while waiting
    pub async fn receive_handshake(
        self: &Arc<Self>,
        expected: Option<InfoHash>,
    ) -> Result<HandshakeCompleted, TorrentError> {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return Err(TorrentError::ConnectionClosed {
                address: self.address,
            });
        };
        {
            let mut state = self.state.write();
            if state.phase == ConnectionPhase::Connecting {
                state.phase = ConnectionPhase::Handshaking;
            }
        }

        let timeout = self.config.handshake_timeout;
        let mut closed = self.closed.subscribe();
        let received = tokio::select! {
            result = tokio::time::timeout(timeout, receiver.receive()) => match result {
                Ok(received) => received,
                Err(_) => Err(TorrentError::HandshakeTimeout {
                    address: self.address,
                    timeout,
                }),
            },
            () = disposed_signal(&mut closed) => Err(TorrentError::ConnectionClosed {
                address: self.address,
            }),
        };
        if !self.is_disposed() {
            *self.receiver.lock() = Some(receiver);
        }

        match received.and_then(|message| self.accept_handshake(message, expected)) {
            Ok(completed) => Ok(completed),
            Err(error) => {
                self.terminate(&error);
                Err(error)
            }
        }
    }

    fn accept_handshake(
        self: &Arc<Self>,
        message: PeerMessage,
        expected: Option<InfoHash>,
    ) -> Result<HandshakeCompleted, TorrentError> {
        let PeerMessage::Handshake(handshake) = message else {
            return Err(TorrentError::violation(format!(
                "expected handshake, received {}",
                message.kind()
            )));
        };
        if handshake.info_hash.is_empty() {
            return Err(TorrentError::violation("handshake carries an empty info hash"));
        }
        if handshake.peer_id.is_empty() {
            return Err(TorrentError::violation("handshake carries an empty peer id"));
        }

        let mut state = self.state.write();
        if state.phase == ConnectionPhase::Terminated {
            return Err(TorrentError::ConnectionClosed {
                address: self.address,
            });
        }
        if let Some(expected) = expected.or(state.info_hash)
            && !expected.matches(&handshake.info_hash)
        {
            return Err(TorrentError::violation(format!(
                "handshake info hash {} does not match {}",
                handshake.info_hash, expected
            )));
        }

        state.info_hash.get_or_insert(handshake.info_hash);
        state.remote_peer_id = Some(handshake.peer_id);
        state.phase = ConnectionPhase::Active;
        drop(state);

        tracing::debug!(
            "Handshake from {} ({}) for {}",
            self.address,
            handshake.peer_id,
            handshake.info_hash
        );
        Ok(HandshakeCompleted {
            peer_info: PeerInfo {
                address: self.address,
                peer_id: handshake.peer_id,
            },
            info_hash: handshake.info_hash,
            connection: Arc::clone(self),
        })
    }

    /// Starts the message loop against `session`.
    ///
    /// `on_removed` fires once if the connection later fails on its own.
    /// Does nothing if the connection is disposed or already started.
    pub fn start(self: &Arc<Self>, session: Arc<TorrentSession>, on_removed: RemovalCallback) {
        if self.is_disposed() {
            return;
        }
        let Some(receiver) = self.receiver.lock().take() else {
            tracing::warn!("Connection to {} started twice", self.address);
            return;
        };
        *self.on_removed.lock() = Some(on_removed);

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            connection.run_message_loop(receiver, session).await;
        });
    }

    async fn run_message_loop(
        self: Arc<Self>,
        mut receiver: Box<dyn MessageReceiver>,
        session: Arc<TorrentSession>,
    ) {
        match self.drive(&mut receiver, &session).await {
            Ok(()) => tracing::trace!("Message loop for {} stopped", self.address),
            Err(error) => self.terminate(&error),
        }
    }

    async fn drive(
        self: &Arc<Self>,
        receiver: &mut Box<dyn MessageReceiver>,
        session: &Arc<TorrentSession>,
    ) -> Result<(), TorrentError> {
        let mut closed = self.closed.subscribe();
        // Subscribe before the snapshot so no completion falls between them.
        let mut haves = session.subscribe_haves();

        if let Some(bitfield) = session.local_bitfield_bytes() {
            self.send(PeerMessage::Bitfield { bitfield }).await?;
        }

        loop {
            tokio::select! {
                () = disposed_signal(&mut closed) => return Ok(()),
                message = receiver.receive() => self.handle_message(message?, session)?,
                announced = haves.recv() => match announced {
                    Ok(piece_index) => self.have(piece_index).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("{} missed {} piece announcements", self.address, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    fn handle_message(
        self: &Arc<Self>,
        message: PeerMessage,
        session: &Arc<TorrentSession>,
    ) -> Result<(), TorrentError> {
        tracing::trace!("{} sent {}", self.address, message.kind());
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Handshake(_) => {
                return Err(TorrentError::violation("second handshake on an active connection"));
            }
            PeerMessage::Choke => self.state.write().is_choked = true,
            PeerMessage::Unchoke => self.state.write().is_choked = false,
            PeerMessage::Interested => self.state.write().is_remote_interested = true,
            PeerMessage::NotInterested => self.state.write().is_remote_interested = false,
            PeerMessage::Have { piece_index } => {
                self.record_remote_have(piece_index, session.piece_count())?;
            }
            PeerMessage::Bitfield { bitfield } => {
                self.merge_remote_bitfield(&bitfield, session.piece_count())?;
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.serve_request(piece_index, offset, length, session)?,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.accept_block(piece_index, offset, data, session)?,
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                // In-flight reads run to completion.
                tracing::debug!(
                    "{} cancelled {}:{}+{}",
                    self.address,
                    piece_index,
                    offset,
                    length
                );
            }
            PeerMessage::Port { port } => {
                tracing::debug!("{} announced DHT port {}", self.address, port);
            }
            PeerMessage::Unknown { id, .. } => {
                return Err(TorrentError::violation(format!("unknown message id {id}")));
            }
        }
        Ok(())
    }

    fn record_remote_have(
        &self,
        piece_index: PieceIndex,
        piece_count: u32,
    ) -> Result<(), TorrentError> {
        if piece_index.as_u32() >= piece_count {
            return Err(TorrentError::violation(format!(
                "have for piece {piece_index} of {piece_count}"
            )));
        }

        let mut state = self.state.write();
        state
            .remote_bitfield
            .get_or_insert_with(|| BitField::new(piece_count as usize))
            .set(piece_index.as_usize());
        Ok(())
    }

    fn merge_remote_bitfield(&self, bytes: &[u8], piece_count: u32) -> Result<(), TorrentError> {
        let incoming = BitField::from_bytes_exact(bytes, piece_count as usize).ok_or_else(|| {
            TorrentError::violation(format!(
                "bitfield of {} bytes for {piece_count} pieces",
                bytes.len()
            ))
        })?;

        let mut state = self.state.write();
        let merged = match state.remote_bitfield.take() {
            Some(mut known) => {
                known.or(&incoming);
                known
            }
            None => incoming,
        };
        state.remote_bitfield = Some(merged);
        Ok(())
    }

    fn serve_request(
        self: &Arc<Self>,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
        session: &Arc<TorrentSession>,
    ) -> Result<(), TorrentError> {
        if !session.has_piece(piece_index) {
            tracing::trace!("{} requested missing piece {}", self.address, piece_index);
            return Ok(());
        }
        let Ok(queued) = Arc::clone(&self.request_slots).try_acquire_owned() else {
            return Err(TorrentError::violation(format!(
                "more than {} outstanding requests",
                self.config.max_queued_requests
            )));
        };

        // Queued requests wait here for a read slot; the loop keeps reading.
        let connection = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let _queued = queued;
            let Ok(_permit) = Arc::clone(&connection.upload_slots).acquire_owned().await else {
                return;
            };
            if connection.is_disposed() {
                return;
            }
            let data = match session.store().get_piece(piece_index, offset, length).await {
                Ok(data) => data,
                Err(error) => {
                    connection.terminate(&error);
                    return;
                }
            };
            if connection.is_disposed() {
                return;
            }
            let message = PeerMessage::Piece {
                piece_index,
                offset,
                data,
            };
            if connection.send(message).await.is_ok() {
                session.counters().record_upload(u64::from(length));
            }
        });
        Ok(())
    }

    fn accept_block(
        self: &Arc<Self>,
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
        session: &Arc<TorrentSession>,
    ) -> Result<(), TorrentError> {
        if piece_index.as_u32() >= session.piece_count() {
            return Err(TorrentError::violation(format!(
                "piece {piece_index} of {}",
                session.piece_count()
            )));
        }
        if session.has_piece(piece_index) || !session.claim_block(piece_index, offset) {
            tracing::trace!(
                "Ignoring duplicate block {}:{} from {}",
                piece_index,
                offset,
                self.address
            );
            return Ok(());
        }

        let connection = Arc::clone(self);
        let session = Arc::clone(session);
        let length = data.len() as u64;
        tokio::spawn(async move {
            match session.store().set_piece(piece_index, offset, data).await {
                Ok(complete) => {
                    session.counters().record_download(length);
                    if complete {
                        session.complete_piece(piece_index);
                    }
                }
                Err(error) => {
                    session.release_block(piece_index, offset);
                    connection.terminate(&error);
                }
            }
        });
        Ok(())
    }

    /// Announces that we now hold `piece_index`.
    ///
    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel gone; the connection is terminated
    pub async fn have(&self, piece_index: PieceIndex) -> Result<(), TorrentError> {
        self.send(PeerMessage::Have { piece_index }).await
    }

    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel gone; the connection is terminated
    pub async fn send_interested(&self) -> Result<(), TorrentError> {
        self.state.write().is_interested = true;
        self.send(PeerMessage::Interested).await
    }

    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel gone; the connection is terminated
    pub async fn send_not_interested(&self) -> Result<(), TorrentError> {
        self.state.write().is_interested = false;
        self.send(PeerMessage::NotInterested).await
    }

    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel gone; the connection is terminated
    pub async fn send_choke(&self) -> Result<(), TorrentError> {
        self.state.write().is_remote_choked = true;
        self.send(PeerMessage::Choke).await
    }

    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel gone; the connection is terminated
    pub async fn send_unchoke(&self) -> Result<(), TorrentError> {
        self.state.write().is_remote_choked = false;
        self.send(PeerMessage::Unchoke).await
    }

    /// Asks the remote for one block.
    ///
    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel gone; the connection is terminated
    pub async fn request_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        self.send(PeerMessage::Request {
            piece_index,
            offset,
            length,
        })
        .await
    }

    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Channel gone; the connection is terminated
    pub async fn send_bitfield(&self, bitfield: &BitField) -> Result<(), TorrentError> {
        self.send(PeerMessage::Bitfield {
            bitfield: Bytes::from(bitfield.to_bytes()),
        })
        .await
    }

    async fn send(&self, message: PeerMessage) -> Result<(), TorrentError> {
        let result = self.sender.send(message).await;
        if let Err(error) = &result {
            self.terminate(error);
        }
        result
    }

    /// Ends the connection after a fault: reports it for removal, then disposes.
    fn terminate(&self, error: &TorrentError) {
        if self.is_disposed() {
            return;
        }
        match error {
            TorrentError::ConnectionClosed { .. } => {
                tracing::debug!("Peer {} disconnected", self.address);
            }
            TorrentError::ProtocolViolation { .. } => {
                tracing::warn!("Dropping peer {}: {}", self.address, error);
            }
            _ => tracing::info!("Dropping peer {}: {}", self.address, error),
        }

        let on_removed = self.on_removed.lock().take();
        if let (Some(on_removed), Some(peer_info)) = (on_removed, self.peer_info()) {
            on_removed(peer_info);
        }
        self.dispose();
    }

    /// Closes the transport and stops the message loop.
    ///
    /// Idempotent and callable from any thread. Does not run the removal
    /// callback.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.write().phase = ConnectionPhase::Terminated;
        self.on_removed.lock().take();
        self.sender.close();
        self.upload_slots.close();
        self.closed.send_replace(true);
        self.receiver.lock().take();
        tracing::debug!("Disposed connection to {}", self.address);
    }
}

/// Resolves once the connection has been disposed.
async fn disposed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::torrent::test_support::{
        RemotePeer, empty_session, memory_transport, seeded_session, socket, wait_until,
    };

    const HASH: InfoHash = InfoHash::V1([7u8; 20]);

    fn connection(direction: Direction) -> (Arc<PeerConnection>, RemotePeer) {
        connection_with(direction, PeerConfig::default())
    }

    fn connection_with(
        direction: Direction,
        config: PeerConfig,
    ) -> (Arc<PeerConnection>, RemotePeer) {
        let (transport, remote) = memory_transport(socket(7001));
        let connection = PeerConnection::new(transport, direction, config);
        (connection, remote)
    }

    fn remote_handshake(info_hash: InfoHash) -> PeerMessage {
        PeerMessage::Handshake(PeerHandshake::new(info_hash, PeerId::new([5u8; 20])))
    }

    async fn active_connection(
        session: &Arc<TorrentSession>,
    ) -> (Arc<PeerConnection>, RemotePeer, Arc<AtomicUsize>) {
        active_connection_with(session, PeerConfig::default()).await
    }

    async fn active_connection_with(
        session: &Arc<TorrentSession>,
        config: PeerConfig,
    ) -> (Arc<PeerConnection>, RemotePeer, Arc<AtomicUsize>) {
        let (connection, mut remote) = connection_with(Direction::Outbound, config);
        connection
            .send_handshake(session.info_hash(), session.local_peer_id())
            .await
            .unwrap();
        assert!(matches!(
            remote.next_message().await,
            Some(PeerMessage::Handshake(_))
        ));
        remote.send(remote_handshake(session.info_hash()));
        connection
            .receive_handshake(Some(session.info_hash()))
            .await
            .unwrap();

        let removals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removals);
        connection.start(
            Arc::clone(session),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (connection, remote, removals)
    }

    #[tokio::test]
    async fn test_new_connection_defaults() {
        let (connection, _remote) = connection(Direction::Inbound);

        assert_eq!(connection.phase(), ConnectionPhase::Connecting);
        assert!(connection.is_choked());
        assert!(!connection.is_interested());
        assert!(!connection.is_remote_interested());
        assert!(connection.remote_bitfield().is_none());
        assert!(connection.peer_info().is_none());
        assert_eq!(connection.direction(), Direction::Inbound);
    }

    #[tokio::test]
    async fn test_handshake_exchange_activates() {
        let (connection, mut remote) = connection(Direction::Outbound);
        let local_id = PeerId::new([1u8; 20]);

        connection.send_handshake(HASH, local_id).await.unwrap();
        assert_eq!(connection.phase(), ConnectionPhase::Handshaking);
        assert_eq!(
            remote.next_message().await,
            Some(PeerMessage::Handshake(PeerHandshake::new(HASH, local_id)))
        );

        remote.send(remote_handshake(HASH));
        let completed = connection.receive_handshake(Some(HASH)).await.unwrap();

        assert_eq!(completed.info_hash, HASH);
        assert_eq!(completed.peer_info.peer_id, PeerId::new([5u8; 20]));
        assert_eq!(completed.peer_info.address, socket(7001));
        assert_eq!(connection.phase(), ConnectionPhase::Active);
        assert!(Arc::ptr_eq(&completed.connection, &connection));
    }

    #[tokio::test]
    async fn test_mismatched_info_hash_disposes() {
        let (connection, mut remote) = connection(Direction::Outbound);
        remote.send(remote_handshake(InfoHash::new([8u8; 20])));

        let result = connection.receive_handshake(Some(HASH)).await;

        assert!(matches!(result, Err(TorrentError::ProtocolViolation { .. })));
        assert!(connection.is_disposed());
        assert_eq!(connection.phase(), ConnectionPhase::Terminated);
        assert!(remote.closed().await);
    }

    #[tokio::test]
    async fn test_empty_peer_id_rejected() {
        let (connection, remote) = connection(Direction::Inbound);
        remote.send(PeerMessage::Handshake(PeerHandshake::new(
            HASH,
            PeerId::new([0u8; 20]),
        )));

        let result = connection.receive_handshake(None).await;
        assert!(matches!(result, Err(TorrentError::ProtocolViolation { .. })));
        assert!(connection.is_disposed());
    }

    #[tokio::test]
    async fn test_non_handshake_first_message_rejected() {
        let (connection, remote) = connection(Direction::Inbound);
        remote.send(PeerMessage::Interested);

        let result = connection.receive_handshake(None).await;
        assert!(matches!(result, Err(TorrentError::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (transport, _remote) = memory_transport(socket(7002));
        let config = PeerConfig {
            handshake_timeout: Duration::from_millis(50),
            ..PeerConfig::default()
        };
        let connection = PeerConnection::new(transport, Direction::Inbound, config);

        let result = connection.receive_handshake(None).await;
        assert!(matches!(result, Err(TorrentError::HandshakeTimeout { .. })));
        assert!(connection.is_disposed());
    }

    #[tokio::test]
    async fn test_dispose_interrupts_handshake_wait() {
        let (connection, _remote) = connection(Direction::Inbound);
        let waiting = Arc::clone(&connection);
        let wait = tokio::spawn(async move { waiting.receive_handshake(None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        connection.dispose();

        let result = wait.await.unwrap();
        assert!(matches!(result, Err(TorrentError::ConnectionClosed { .. })));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (connection, mut remote) = connection(Direction::Outbound);
        connection.dispose();
        connection.dispose();

        assert!(connection.is_disposed());
        assert!(remote.closed().await);
        assert!(connection.have(PieceIndex::new(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_choke_and_interest_flags() {
        let (session, _store) = empty_session(HASH, 8, 16);
        let (connection, remote, _) = active_connection(&session).await;

        remote.send(PeerMessage::Unchoke);
        remote.send(PeerMessage::Interested);
        assert!(wait_until(|| !connection.is_choked() && connection.is_remote_interested()).await);

        remote.send(PeerMessage::Choke);
        remote.send(PeerMessage::NotInterested);
        assert!(wait_until(|| connection.is_choked() && !connection.is_remote_interested()).await);
    }

    #[tokio::test]
    async fn test_have_then_bitfield_merges() {
        let (session, _store) = empty_session(HASH, 10, 16);
        let (connection, remote, _) = active_connection(&session).await;

        remote.send(PeerMessage::Have {
            piece_index: PieceIndex::new(9),
        });
        let mut advertised = BitField::new(10);
        advertised.set(0).set(4);
        remote.send(PeerMessage::Bitfield {
            bitfield: Bytes::from(advertised.to_bytes()),
        });

        assert!(wait_until(|| {
            connection
                .remote_bitfield()
                .is_some_and(|bitfield| bitfield.true_count() == 3)
        })
        .await);
        let remote_bitfield = connection.remote_bitfield().unwrap();
        assert!(remote_bitfield.get(0) && remote_bitfield.get(4) && remote_bitfield.get(9));
    }

    #[tokio::test]
    async fn test_have_out_of_range_is_fatal() {
        let (session, _store) = empty_session(HASH, 4, 16);
        let (connection, mut remote, removals) = active_connection(&session).await;

        remote.send(PeerMessage::Have {
            piece_index: PieceIndex::new(4),
        });

        assert!(remote.closed().await);
        assert!(connection.is_disposed());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_for_held_piece_uploads_once() {
        let (session, store) = seeded_session(HASH, 8, 16);
        let (_connection, mut remote, _) = active_connection(&session).await;
        assert!(matches!(
            remote.next_message().await,
            Some(PeerMessage::Bitfield { .. })
        ));

        remote.send(PeerMessage::Request {
            piece_index: PieceIndex::new(5),
            offset: 4,
            length: 8,
        });

        match remote.next_message().await {
            Some(PeerMessage::Piece {
                piece_index,
                offset,
                data,
            }) => {
                assert_eq!(piece_index, PieceIndex::new(5));
                assert_eq!(offset, 4);
                assert_eq!(data.len(), 8);
            }
            other => panic!("Expected Piece message, got {other:?}"),
        }
        assert!(wait_until(|| session.counters().uploaded() == 8).await);
        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_request_for_missing_piece_has_no_effect() {
        let (session, store) = empty_session(HASH, 8, 16);
        let (_connection, mut remote, _) = active_connection(&session).await;

        remote.send(PeerMessage::Request {
            piece_index: PieceIndex::new(5),
            offset: 0,
            length: 16,
        });

        assert!(remote.expect_silence(Duration::from_millis(100)).await);
        assert_eq!(store.get_calls(), 0);
        assert_eq!(session.counters().uploaded(), 0);
    }

    #[tokio::test]
    async fn test_loop_stays_responsive_during_slow_read() {
        let (session, store) = seeded_session(HASH, 8, 16);
        let (connection, mut remote, _) = active_connection(&session).await;
        let _ = remote.next_message().await;

        store.hold_reads();
        remote.send(PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 0,
            length: 16,
        });
        remote.send(PeerMessage::Unchoke);

        assert!(wait_until(|| !connection.is_choked()).await);
        assert_eq!(session.counters().uploaded(), 0);

        store.release_reads();
        assert!(matches!(
            remote.next_message().await,
            Some(PeerMessage::Piece { .. })
        ));
        assert!(wait_until(|| session.counters().uploaded() == 16).await);
    }

    #[tokio::test]
    async fn test_pipelined_requests_beyond_read_slots_are_all_served() {
        let (session, store) = seeded_session(HASH, 8, 16);
        let config = PeerConfig {
            max_pending_uploads: 4,
            ..PeerConfig::default()
        };
        let (connection, mut remote, _) = active_connection_with(&session, config).await;
        let _ = remote.next_message().await;

        store.hold_reads();
        for _ in 0..20 {
            remote.send(PeerMessage::Request {
                piece_index: PieceIndex::new(1),
                offset: 0,
                length: 16,
            });
        }
        assert!(wait_until(|| store.get_calls() == 4).await);
        store.release_reads();

        let mut served = 0;
        while served < 20 {
            match remote.next_message().await {
                Some(PeerMessage::Piece { piece_index, .. }) => {
                    assert_eq!(piece_index, PieceIndex::new(1));
                    served += 1;
                }
                other => panic!("Expected Piece message, got {other:?}"),
            }
        }
        assert!(wait_until(|| session.counters().uploaded() == 20 * 16).await);
        assert_eq!(store.get_calls(), 20);
        assert!(!connection.is_disposed());
    }

    #[tokio::test]
    async fn test_request_flood_is_fatal() {
        let (session, store) = seeded_session(HASH, 8, 16);
        let config = PeerConfig {
            max_pending_uploads: 1,
            max_queued_requests: 3,
            ..PeerConfig::default()
        };
        let (connection, mut remote, removals) = active_connection_with(&session, config).await;
        let _ = remote.next_message().await;

        store.hold_reads();
        for _ in 0..4 {
            remote.send(PeerMessage::Request {
                piece_index: PieceIndex::new(2),
                offset: 0,
                length: 16,
            });
        }

        assert!(remote.closed().await);
        assert!(connection.is_disposed());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert_eq!(session.counters().uploaded(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_piece_counted_once() {
        let (session, store) = empty_session(HASH, 4, 16);
        let (_connection, remote, _) = active_connection(&session).await;
        let block = PeerMessage::Piece {
            piece_index: PieceIndex::new(2),
            offset: 0,
            data: Bytes::from(vec![3u8; 16]),
        };

        remote.send(block.clone());
        remote.send(block);

        assert!(wait_until(|| session.has_piece(PieceIndex::new(2))).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.counters().downloaded(), 16);
        assert_eq!(session.counters().remaining(), 48);
        assert_eq!(store.set_calls(), 1);
    }

    #[tokio::test]
    async fn test_completed_piece_is_announced() {
        let (session, _store) = empty_session(HASH, 4, 16);
        let (_connection, mut remote, _) = active_connection(&session).await;

        remote.send(PeerMessage::Piece {
            piece_index: PieceIndex::new(1),
            offset: 0,
            data: Bytes::from(vec![1u8; 16]),
        });

        assert_eq!(
            remote.next_message().await,
            Some(PeerMessage::Have {
                piece_index: PieceIndex::new(1)
            })
        );
    }

    #[tokio::test]
    async fn test_failed_write_terminates_and_releases_block() {
        let (session, store) = empty_session(HASH, 4, 16);
        let (connection, mut remote, removals) = active_connection(&session).await;
        store.fail_writes();

        remote.send(PeerMessage::Piece {
            piece_index: PieceIndex::new(0),
            offset: 0,
            data: Bytes::from(vec![1u8; 16]),
        });

        assert!(remote.closed().await);
        assert!(connection.is_disposed());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
        assert_eq!(session.counters().downloaded(), 0);
        assert!(session.claim_block(PieceIndex::new(0), 0));
    }

    #[tokio::test]
    async fn test_unknown_message_is_fatal() {
        let (session, _store) = empty_session(HASH, 4, 16);
        let (connection, mut remote, removals) = active_connection(&session).await;

        remote.send(PeerMessage::Unknown {
            id: 20,
            payload: Bytes::new(),
        });

        assert!(remote.closed().await);
        assert!(connection.is_disposed());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_and_port_are_ignored() {
        let (session, _store) = empty_session(HASH, 4, 16);
        let (connection, mut remote, _) = active_connection(&session).await;

        remote.send(PeerMessage::Cancel {
            piece_index: PieceIndex::new(0),
            offset: 0,
            length: 16,
        });
        remote.send(PeerMessage::Port { port: 6881 });

        assert!(remote.expect_silence(Duration::from_millis(50)).await);
        assert!(!connection.is_disposed());
    }

    #[tokio::test]
    async fn test_remote_disconnect_reports_removal() {
        let (session, _store) = empty_session(HASH, 4, 16);
        let (connection, mut remote, removals) = active_connection(&session).await;

        remote.disconnect();

        assert!(wait_until(|| connection.is_disposed()).await);
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_dispose_skips_removal_callback() {
        let (session, _store) = empty_session(HASH, 4, 16);
        let (connection, mut remote, removals) = active_connection(&session).await;

        connection.dispose();

        assert!(remote.closed().await);
        assert_eq!(removals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outgoing_control_messages() {
        let (session, _store) = empty_session(HASH, 4, 16);
        let (connection, mut remote, _) = active_connection(&session).await;

        connection.send_interested().await.unwrap();
        connection.send_unchoke().await.unwrap();
        connection
            .request_block(PieceIndex::new(2), 0, 16)
            .await
            .unwrap();

        assert_eq!(remote.next_message().await, Some(PeerMessage::Interested));
        assert_eq!(remote.next_message().await, Some(PeerMessage::Unchoke));
        assert_eq!(
            remote.next_message().await,
            Some(PeerMessage::Request {
                piece_index: PieceIndex::new(2),
                offset: 0,
                length: 16,
            })
        );

        let stats = connection.stats();
        assert!(stats.is_interested);
        assert!(!stats.is_remote_choked);
        assert_eq!(stats.phase, ConnectionPhase::Active);

        let mut held = BitField::new(4);
        held.set(1).set(3);
        connection.send_not_interested().await.unwrap();
        connection.send_choke().await.unwrap();
        connection.send_bitfield(&held).await.unwrap();

        assert_eq!(remote.next_message().await, Some(PeerMessage::NotInterested));
        assert_eq!(remote.next_message().await, Some(PeerMessage::Choke));
        assert_eq!(
            remote.next_message().await,
            Some(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b0101_0000]),
            })
        );

        let stats = connection.stats();
        assert!(!stats.is_interested);
        assert!(stats.is_remote_choked);
    }
}
