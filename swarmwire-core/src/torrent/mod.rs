//! Peer-wire engine: bitfields, peer connections, swarm registries and the
//! factory that dials and accepts peers.

pub mod bitfield;
pub mod connection_pool;
pub mod peer_connection;
pub mod peer_factory;
pub mod peer_registry;
pub mod piece_store;
pub mod protocol;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub use bitfield::BitField;
pub use connection_pool::ConnectionPool;
pub use peer_connection::{
    ConnectionPhase, ConnectionStats, Direction, HandshakeCompleted, PeerConnection,
    RemovalCallback,
};
pub use peer_factory::{PeerFactory, PeerListener};
pub use peer_registry::{PeerInfo, PeerRegistry, SwarmDirectory};
pub use piece_store::{MemoryPieceStore, PieceStore};
pub use protocol::{
    DialError, Dialer, MessageReceiver, MessageSender, PeerHandshake, PeerId, PeerMessage,
    PeerTransport, TcpDialer, TcpTransport,
};
pub use session::{TorrentSession, TransferCounters};

/// Identifier of a torrent, derived from its info dictionary.
///
/// v1 torrents carry a 20-byte SHA-1 digest, v2 torrents a 32-byte SHA-256
/// digest and hybrid torrents both. The handshake only has room for 20 bytes,
/// so every variant also has one or two 20-byte wire forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
    Hybrid { v1: [u8; 20], v2: [u8; 32] },
}

impl InfoHash {
    /// Creates a v1 InfoHash from a 20-byte SHA-1 digest.
    pub fn new(hash: [u8; 20]) -> Self {
        Self::V1(hash)
    }

    /// Creates a v2 InfoHash from a 32-byte SHA-256 digest.
    pub fn from_v2(hash: [u8; 32]) -> Self {
        Self::V2(hash)
    }

    /// Creates a hybrid InfoHash carrying both digests.
    pub fn hybrid(v1: [u8; 20], v2: [u8; 32]) -> Self {
        Self::Hybrid { v1, v2 }
    }

    /// Parses a 40-character (v1) or 64-character (v2) hex string.
    ///
    /// # Errors
    /// - `hex::FromHexError` - Invalid characters or unsupported length
    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        match value.len() {
            40 => {
                let mut hash = [0u8; 20];
                hex::decode_to_slice(value, &mut hash)?;
                Ok(Self::V1(hash))
            }
            64 => {
                let mut hash = [0u8; 32];
                hex::decode_to_slice(value, &mut hash)?;
                Ok(Self::V2(hash))
            }
            _ => Err(hex::FromHexError::InvalidStringLength),
        }
    }

    /// Returns the v1 digest if this torrent has one.
    pub fn v1(&self) -> Option<&[u8; 20]> {
        match self {
            Self::V1(v1) | Self::Hybrid { v1, .. } => Some(v1),
            Self::V2(_) => None,
        }
    }

    /// Returns the v2 digest if this torrent has one.
    pub fn v2(&self) -> Option<&[u8; 32]> {
        match self {
            Self::V2(v2) | Self::Hybrid { v2, .. } => Some(v2),
            Self::V1(_) => None,
        }
    }

    /// The 20 bytes this torrent is announced with in a handshake.
    ///
    /// The v1 digest when present, otherwise the truncated v2 digest.
    pub fn wire_bytes(&self) -> [u8; 20] {
        match self {
            Self::V1(v1) | Self::Hybrid { v1, .. } => *v1,
            Self::V2(v2) => truncate_v2(v2),
        }
    }

    /// Every 20-byte form a remote peer may use to name this torrent.
    pub fn wire_forms(&self) -> Vec<[u8; 20]> {
        match self {
            Self::V1(v1) => vec![*v1],
            Self::V2(v2) => vec![truncate_v2(v2)],
            Self::Hybrid { v1, v2 } => vec![*v1, truncate_v2(v2)],
        }
    }

    /// Whether both hashes name the same torrent on the wire.
    pub fn matches(&self, other: &InfoHash) -> bool {
        let ours = self.wire_forms();
        other.wire_forms().iter().any(|form| ours.contains(form))
    }

    /// An all-zero hash is what a peer sends when it has nothing to say.
    pub fn is_empty(&self) -> bool {
        self.wire_forms()
            .iter()
            .all(|form| form.iter().all(|&byte| byte == 0))
    }
}

fn truncate_v2(v2: &[u8; 32]) -> [u8; 20] {
    let mut truncated = [0u8; 20];
    truncated.copy_from_slice(&v2[..20]);
    truncated
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1(v1) | Self::Hybrid { v1, .. } => f.write_str(&hex::encode(v1)),
            Self::V2(v2) => f.write_str(&hex::encode(v2)),
        }
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a bit position.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only torrent facts the engine needs when building registries and
/// connections. Parsing `.torrent` files happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub piece_count: u32,
    pub piece_length: u32,
    pub total_length: u64,
    pub local_peer_id: PeerId,
}

impl TorrentMetadata {
    /// Size in bytes of the given piece; the last piece may be short.
    pub fn piece_size(&self, piece_index: PieceIndex) -> u64 {
        let start = u64::from(piece_index.as_u32()) * u64::from(self.piece_length);
        self.total_length
            .saturating_sub(start)
            .min(u64::from(self.piece_length))
    }
}

/// Errors raised by the peer-wire engine.
///
/// Every variant except `Io` is local to a single connection or swarm: the
/// engine converts them into removed peers and never lets them take down the
/// hosting process.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailure { address: SocketAddr, reason: String },

    #[error("Peer {address} is already registered for torrent {info_hash}")]
    DuplicateRegistration {
        address: SocketAddr,
        info_hash: InfoHash,
    },

    #[error("No swarm registered for torrent {info_hash}")]
    UnknownSwarm { info_hash: InfoHash },

    #[error("Swarm for torrent {info_hash} is full ({max_peers} peers)")]
    SwarmFull { info_hash: InfoHash, max_peers: usize },

    #[error("Piece {index} I/O failed: {reason}")]
    PieceIoFailure { index: PieceIndex, reason: String },

    #[error("Handshake with {address} timed out after {timeout:?}")]
    HandshakeTimeout {
        address: SocketAddr,
        timeout: Duration,
    },

    #[error("Connection to {address} closed")]
    ConnectionClosed { address: SocketAddr },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_info_hash_hex_round_trip() {
        let v1 = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(v1.to_string(), "0123456789abcdef0123456789abcdef01234567");

        let v2 = InfoHash::from_hex(&"ab".repeat(32)).unwrap();
        assert!(matches!(v2, InfoHash::V2(_)));

        assert!(InfoHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_hybrid_matches_either_wire_form() {
        let v1 = [1u8; 20];
        let v2 = [2u8; 32];
        let hybrid = InfoHash::hybrid(v1, v2);

        assert!(hybrid.matches(&InfoHash::new(v1)));
        assert!(hybrid.matches(&InfoHash::new([2u8; 20])));
        assert!(!hybrid.matches(&InfoHash::new([3u8; 20])));
        assert_eq!(hybrid.wire_bytes(), v1);
        assert_eq!(InfoHash::from_v2(v2).wire_bytes(), [2u8; 20]);
    }

    #[test]
    fn test_empty_info_hash() {
        assert!(InfoHash::new([0u8; 20]).is_empty());
        assert!(!InfoHash::new([1u8; 20]).is_empty());
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.to_string(), "10");
    }

    #[test]
    fn test_last_piece_is_short() {
        let metadata = TorrentMetadata {
            info_hash: InfoHash::new([1u8; 20]),
            piece_count: 3,
            piece_length: 100,
            total_length: 250,
            local_peer_id: PeerId::new([9u8; 20]),
        };

        assert_eq!(metadata.piece_size(PieceIndex::new(0)), 100);
        assert_eq!(metadata.piece_size(PieceIndex::new(2)), 50);
        assert_eq!(metadata.piece_size(PieceIndex::new(3)), 0);
    }
}
