//! Per-torrent state shared by every connection of one swarm

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::bitfield::BitField;
use super::piece_store::PieceStore;
use super::protocol::PeerId;
use super::{InfoHash, PieceIndex, TorrentMetadata};

/// Capacity of the completed-piece announcement channel.
const HAVE_CHANNEL_CAPACITY: usize = 256;

/// Transfer totals updated concurrently by every connection of a torrent.
#[derive(Debug, Default)]
pub struct TransferCounters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    remaining: AtomicU64,
}

impl TransferCounters {
    pub fn new(remaining: u64) -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            remaining: AtomicU64::new(remaining),
        }
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to `downloaded` and takes the same amount off `remaining`,
    /// stopping at zero.
    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        let _ = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                Some(remaining.saturating_sub(bytes))
            });
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }
}

/// Session context for one torrent.
///
/// Owns the local bitfield, the transfer counters and the piece store, and
/// hands completed-piece announcements to every active connection.
pub struct TorrentSession {
    metadata: TorrentMetadata,
    local_bitfield: RwLock<BitField>,
    counters: Arc<TransferCounters>,
    store: Arc<dyn PieceStore>,
    /// Block offsets claimed for writing, per incomplete piece
    claimed_blocks: Mutex<HashMap<u32, HashSet<u32>>>,
    have_announcer: broadcast::Sender<PieceIndex>,
}

impl TorrentSession {
    /// Creates a session that starts with no pieces.
    pub fn new(metadata: TorrentMetadata, store: Arc<dyn PieceStore>) -> Arc<Self> {
        let bitfield = BitField::new(metadata.piece_count as usize);
        Self::with_bitfield(metadata, bitfield, store)
    }

    /// Creates a session that already holds the pieces set in `bitfield`.
    ///
    /// # Panics
    /// Panics if `bitfield` is not `piece_count` bits long.
    pub fn with_bitfield(
        metadata: TorrentMetadata,
        bitfield: BitField,
        store: Arc<dyn PieceStore>,
    ) -> Arc<Self> {
        assert_eq!(
            bitfield.len(),
            metadata.piece_count as usize,
            "local bitfield length must equal the piece count"
        );

        let held: u64 = bitfield
            .iter_true()
            .map(|index| metadata.piece_size(PieceIndex::new(index as u32)))
            .sum();
        let counters = Arc::new(TransferCounters::new(
            metadata.total_length.saturating_sub(held),
        ));
        let (have_announcer, _) = broadcast::channel(HAVE_CHANNEL_CAPACITY);

        Arc::new(Self {
            metadata,
            local_bitfield: RwLock::new(bitfield),
            counters,
            store,
            claimed_blocks: Mutex::new(HashMap::new()),
            have_announcer,
        })
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metadata.info_hash
    }

    pub fn piece_count(&self) -> u32 {
        self.metadata.piece_count
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.metadata.local_peer_id
    }

    pub fn counters(&self) -> &Arc<TransferCounters> {
        &self.counters
    }

    pub fn store(&self) -> &Arc<dyn PieceStore> {
        &self.store
    }

    /// Whether the local side holds the piece. Out-of-range indices are not held.
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        piece_index.as_u32() < self.metadata.piece_count
            && self.local_bitfield.read().get(piece_index.as_usize())
    }

    /// Snapshot of the local bitfield.
    pub fn local_bitfield(&self) -> BitField {
        self.local_bitfield.read().clone()
    }

    /// Wire form of the local bitfield, or `None` while no piece is held.
    pub fn local_bitfield_bytes(&self) -> Option<Bytes> {
        let bitfield = self.local_bitfield.read();
        (!bitfield.all_false()).then(|| Bytes::from(bitfield.to_bytes()))
    }

    /// Claims a block for writing; `false` if it was already claimed.
    pub fn claim_block(&self, piece_index: PieceIndex, begin: u32) -> bool {
        self.claimed_blocks
            .lock()
            .entry(piece_index.as_u32())
            .or_default()
            .insert(begin)
    }

    /// Gives a claim back after a failed write.
    pub fn release_block(&self, piece_index: PieceIndex, begin: u32) {
        let mut claimed = self.claimed_blocks.lock();
        if let Some(blocks) = claimed.get_mut(&piece_index.as_u32()) {
            blocks.remove(&begin);
            if blocks.is_empty() {
                claimed.remove(&piece_index.as_u32());
            }
        }
    }

    /// Marks a piece as held and announces it to every active connection.
    ///
    /// Returns `false` if the piece was already held.
    ///
    /// # Panics
    /// Panics if the index is outside the torrent.
    pub fn complete_piece(&self, piece_index: PieceIndex) -> bool {
        {
            let mut bitfield = self.local_bitfield.write();
            if bitfield.get(piece_index.as_usize()) {
                return false;
            }
            bitfield.set(piece_index.as_usize());
        }
        self.claimed_blocks.lock().remove(&piece_index.as_u32());

        tracing::debug!("Piece {} of {} complete", piece_index, self.info_hash());
        let _ = self.have_announcer.send(piece_index);
        true
    }

    /// Receives every piece completed after subscribing.
    pub fn subscribe_haves(&self) -> broadcast::Receiver<PieceIndex> {
        self.have_announcer.subscribe()
    }
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("metadata", &self.metadata)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}
