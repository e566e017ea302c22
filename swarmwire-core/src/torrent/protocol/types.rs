//! Core types for the BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol string of the only handshake version this engine speaks.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier a party presents during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID with the default client prefix.
    pub fn generate() -> Self {
        Self::generate_with_prefix("-SW0001-")
    }

    /// Generate random peer ID starting with `prefix` (at most 20 bytes used).
    pub fn generate_with_prefix(prefix: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = &prefix.as_bytes()[..prefix.len().min(20)];
        id[..prefix.len()].copy_from_slice(prefix);
        Self(id)
    }

    /// An all-zero id carries no identity.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Handshake exchanged once at the start of every connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL_STRING.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// BitTorrent wire protocol messages.
///
/// The BEP 3 message set plus the handshake and a catch-all for ids this
/// engine does not understand.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Opening handshake, never length-prefixed
    Handshake(PeerHandshake),
    /// Keep-alive message to maintain connection
    KeepAlive,
    /// Sender will not upload to the receiver
    Choke,
    /// Sender is willing to upload to the receiver
    Unchoke,
    /// Sender wants pieces the receiver has
    Interested,
    /// Sender wants nothing from the receiver
    NotInterested,
    /// Sender has acquired a specific piece
    Have {
        /// Index of the piece the sender now has
        piece_index: PieceIndex,
    },
    /// Sender's complete piece availability bitmap
    Bitfield {
        /// Bitmap indicating which pieces the sender has
        bitfield: Bytes,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// A block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The block itself
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
    /// Sender's DHT port
    Port {
        /// UDP port for DHT communication
        port: u16,
    },
    /// Message id outside the supported set
    Unknown {
        /// Raw message id
        id: u8,
        /// Payload following the id
        payload: Bytes,
    },
}

impl PeerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Handshake(_) => "handshake",
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
            PeerMessage::Unknown { .. } => "unknown",
        }
    }
}
