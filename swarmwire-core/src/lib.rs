//! Swarmwire Core - BitTorrent peer-wire protocol engine
//!
//! Manages peer connections for one or more torrents: handshakes, the
//! message exchange once connected, per-swarm peer registries and the
//! factory that dials and accepts peers.

pub mod config;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SwarmwireConfig;
pub use torrent::{
    BitField, InfoHash, PeerConnection, PeerFactory, PeerInfo, PeerRegistry, PieceIndex,
    TorrentError, TorrentSession,
};

/// Errors surfaced to applications embedding the engine.
#[derive(Debug, thiserror::Error)]
pub enum SwarmwireError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmwireError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SwarmwireError::Torrent(e) => match e {
                TorrentError::ConnectFailure { address, .. } => {
                    format!("Could not connect to peer {address}")
                }
                TorrentError::HandshakeTimeout { address, .. } => {
                    format!("Peer {address} did not answer the handshake")
                }
                TorrentError::UnknownSwarm { info_hash } => {
                    format!("Torrent {info_hash} is not being served")
                }
                TorrentError::SwarmFull { max_peers, .. } => {
                    format!("Peer limit of {max_peers} reached")
                }
                TorrentError::ProtocolViolation { .. } => "Peer broke the protocol".to_string(),
                _ => "Peer connection error occurred".to_string(),
            },
            SwarmwireError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            SwarmwireError::Io(_) => "Network or file system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, SwarmwireError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, SwarmwireError>;
