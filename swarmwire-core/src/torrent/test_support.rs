//! In-memory transports, stores and dialers for exercising the engine
//! without sockets or disks.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::bitfield::BitField;
use super::piece_store::{MemoryPieceStore, PieceStore};
use super::protocol::{
    DialError, Dialer, MessageReceiver, MessageSender, PeerId, PeerMessage, PeerTransport,
};
use super::session::TorrentSession;
use super::{InfoHash, PieceIndex, TorrentError, TorrentMetadata};

/// How long test helpers wait for something to happen.
pub const TEST_WAIT: Duration = Duration::from_secs(2);

/// Loopback address on `port`.
pub fn socket(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Polls `condition` until it holds or `TEST_WAIT` elapses.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

struct MemorySender {
    remote_address: SocketAddr,
    outbound: Mutex<Option<mpsc::UnboundedSender<PeerMessage>>>,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send(&self, message: PeerMessage) -> Result<(), TorrentError> {
        let outbound = self.outbound.lock().clone();
        outbound
            .and_then(|outbound| outbound.send(message).ok())
            .ok_or(TorrentError::ConnectionClosed {
                address: self.remote_address,
            })
    }

    fn close(&self) {
        self.outbound.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_none_or(|outbound| outbound.is_closed())
    }
}

struct MemoryReceiver {
    remote_address: SocketAddr,
    inbound: mpsc::UnboundedReceiver<PeerMessage>,
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<PeerMessage, TorrentError> {
        self.inbound
            .recv()
            .await
            .ok_or(TorrentError::ConnectionClosed {
                address: self.remote_address,
            })
    }
}

/// Test-controlled far end of an in-memory transport.
pub struct RemotePeer {
    outbound: Option<mpsc::UnboundedSender<PeerMessage>>,
    inbound: mpsc::UnboundedReceiver<PeerMessage>,
}

impl RemotePeer {
    /// Delivers `message` to the local side. Ignored after `disconnect`.
    pub fn send(&self, message: PeerMessage) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(message);
        }
    }

    /// Next message the local side sent, or `None` on close or timeout.
    pub async fn next_message(&mut self) -> Option<PeerMessage> {
        tokio::time::timeout(TEST_WAIT, self.inbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// True if the local side sends nothing for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.inbound.recv()).await.is_err()
    }

    /// Drains messages until the local side closes its end.
    pub async fn closed(&mut self) -> bool {
        let drain = async { while self.inbound.recv().await.is_some() {} };
        tokio::time::timeout(TEST_WAIT, drain).await.is_ok()
    }

    /// Hangs up; the local side sees its receive fail.
    pub fn disconnect(&mut self) {
        self.outbound = None;
    }
}

/// In-memory transport whose far end is driven by the test.
pub fn memory_transport(remote_address: SocketAddr) -> (PeerTransport, RemotePeer) {
    let (to_local, from_remote) = mpsc::unbounded_channel();
    let (to_remote, from_local) = mpsc::unbounded_channel();

    let transport = PeerTransport {
        remote_address,
        sender: Arc::new(MemorySender {
            remote_address,
            outbound: Mutex::new(Some(to_remote)),
        }),
        receiver: Box::new(MemoryReceiver {
            remote_address,
            inbound: from_remote,
        }),
    };
    let remote = RemotePeer {
        outbound: Some(to_local),
        inbound: from_local,
    };
    (transport, remote)
}

/// Memory store that counts calls and can be told to stall or fail.
pub struct RecordingPieceStore {
    inner: MemoryPieceStore,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    fail_writes: AtomicBool,
    reads_open: watch::Sender<bool>,
}

impl RecordingPieceStore {
    pub fn new(inner: MemoryPieceStore) -> Self {
        let (reads_open, _) = watch::channel(true);
        Self {
            inner,
            get_calls: AtomicUsize::new(0),
            set_calls: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            reads_open,
        }
    }

    pub fn inner(&self) -> &MemoryPieceStore {
        &self.inner
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Makes every later write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Parks reads until `release_reads`.
    pub fn hold_reads(&self) {
        self.reads_open.send_replace(false);
    }

    pub fn release_reads(&self) {
        self.reads_open.send_replace(true);
    }
}

#[async_trait]
impl PieceStore for RecordingPieceStore {
    async fn get_piece(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<Bytes, TorrentError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let mut open = self.reads_open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        self.inner.get_piece(piece_index, begin, length).await
    }

    async fn set_piece(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        data: Bytes,
    ) -> Result<bool, TorrentError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TorrentError::PieceIoFailure {
                index: piece_index,
                reason: "disk full".to_string(),
            });
        }
        self.inner.set_piece(piece_index, begin, data).await
    }
}

/// Dialer that hands out in-memory transports registered per address.
///
/// Unknown addresses fail as a refused connection and return the buffer.
#[derive(Default)]
pub struct ScriptedDialer {
    transports: Mutex<HashMap<SocketAddr, PeerTransport>>,
    dials: AtomicUsize,
    delay: Duration,
}

impl ScriptedDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialer whose every attempt takes `delay` before resolving.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Makes the next dial of `address` succeed; returns its far end.
    pub fn expect(&self, address: SocketAddr) -> RemotePeer {
        let (transport, remote) = memory_transport(address);
        self.transports.lock().insert(address, transport);
        remote
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(
        &self,
        address: SocketAddr,
        buffer: BytesMut,
    ) -> Result<PeerTransport, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.transports.lock().remove(&address).ok_or(DialError {
            error: TorrentError::ConnectFailure {
                address,
                reason: "connection refused".to_string(),
            },
            buffer: Some(buffer),
        })
    }
}

/// Byte `i` of the generated test content.
pub fn content_byte(i: usize) -> u8 {
    (i % 251) as u8
}

pub fn test_metadata(info_hash: InfoHash, piece_count: u32, piece_length: u32) -> TorrentMetadata {
    TorrentMetadata {
        info_hash,
        piece_count,
        piece_length,
        total_length: u64::from(piece_count) * u64::from(piece_length),
        local_peer_id: PeerId::generate(),
    }
}

/// Session holding every piece of generated content.
pub fn seeded_session(
    info_hash: InfoHash,
    piece_count: u32,
    piece_length: u32,
) -> (Arc<TorrentSession>, Arc<RecordingPieceStore>) {
    let total = piece_count as usize * piece_length as usize;
    let content: Vec<u8> = (0..total).map(content_byte).collect();
    let store = Arc::new(RecordingPieceStore::new(MemoryPieceStore::with_content(
        piece_length,
        &content,
    )));

    let mut bitfield = BitField::new(piece_count as usize);
    bitfield.set_all();
    let session = TorrentSession::with_bitfield(
        test_metadata(info_hash, piece_count, piece_length),
        bitfield,
        Arc::clone(&store) as Arc<dyn PieceStore>,
    );
    (session, store)
}

/// Session holding no pieces.
pub fn empty_session(
    info_hash: InfoHash,
    piece_count: u32,
    piece_length: u32,
) -> (Arc<TorrentSession>, Arc<RecordingPieceStore>) {
    let total = u64::from(piece_count) * u64::from(piece_length);
    let store = Arc::new(RecordingPieceStore::new(MemoryPieceStore::new(
        piece_length,
        total,
    )));
    let session = TorrentSession::new(
        test_metadata(info_hash, piece_count, piece_length),
        Arc::clone(&store) as Arc<dyn PieceStore>,
    );
    (session, store)
}
