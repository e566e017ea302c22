//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::Subcommand;
use swarmwire_core::SwarmwireConfig;
use swarmwire_core::torrent::{
    InfoHash, MemoryPieceStore, PeerConnection, PeerFactory, PeerId, PieceIndex, PieceStore,
    TorrentMetadata, TorrentSession,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Standard request size used by BitTorrent clients.
const BLOCK_SIZE: u32 = 16 * 1024;

/// How often transfer progress is checked while fetching.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Serve a file to every peer that connects
    Seed {
        /// File to serve
        file: PathBuf,
        /// Info hash peers will ask for, in hex
        #[arg(long)]
        info_hash: String,
        /// Address to accept peers on
        #[arg(short, long, default_value = "0.0.0.0:6881")]
        bind: SocketAddr,
        /// Piece length in bytes
        #[arg(long, default_value = "262144")]
        piece_length: u32,
    },
    /// Download a complete torrent from a single peer
    Fetch {
        /// Peer address
        peer: SocketAddr,
        /// Info hash in hex
        #[arg(long)]
        info_hash: String,
        /// Total torrent size in bytes
        #[arg(long)]
        total_length: u64,
        /// Piece length in bytes
        #[arg(long, default_value = "262144")]
        piece_length: u32,
        /// Where to write the downloaded content
        #[arg(short, long)]
        output: PathBuf,
        /// Give up after this many seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },
    /// Handshake with a peer and report what it advertises
    Probe {
        /// Peer address
        peer: SocketAddr,
        /// Info hash in hex
        #[arg(long)]
        info_hash: String,
        /// Number of pieces in the torrent
        #[arg(long)]
        pieces: u32,
        /// Piece length in bytes
        #[arg(long, default_value = "262144")]
        piece_length: u32,
        /// Seconds to listen for the peer's bitfield and haves
        #[arg(long, default_value = "3")]
        wait_secs: u64,
    },
}

/// Handle CLI commands
///
/// # Errors
///
/// - Configuration from the environment is invalid
/// - The selected command fails; see the individual handlers
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = SwarmwireConfig::from_env();
    config.validate()?;

    match command {
        Commands::Seed {
            file,
            info_hash,
            bind,
            piece_length,
        } => seed(&config, file, &info_hash, bind, piece_length).await,
        Commands::Fetch {
            peer,
            info_hash,
            total_length,
            piece_length,
            output,
            timeout_secs,
        } => {
            let limit = Duration::from_secs(timeout_secs);
            fetch(&config, peer, &info_hash, total_length, piece_length, output, limit).await
        }
        Commands::Probe {
            peer,
            info_hash,
            pieces,
            piece_length,
            wait_secs,
        } => {
            let wait = Duration::from_secs(wait_secs);
            probe(&config, peer, &info_hash, pieces, piece_length, wait).await
        }
    }
}

fn parse_info_hash(value: &str) -> anyhow::Result<InfoHash> {
    InfoHash::from_hex(value).with_context(|| format!("invalid info hash: {value}"))
}

fn metadata(
    config: &SwarmwireConfig,
    info_hash: InfoHash,
    piece_length: u32,
    total_length: u64,
) -> anyhow::Result<TorrentMetadata> {
    if piece_length == 0 {
        bail!("piece length must be greater than zero");
    }
    let piece_count = u32::try_from(total_length.div_ceil(u64::from(piece_length)))
        .context("torrent has too many pieces")?;

    Ok(TorrentMetadata {
        info_hash,
        piece_count,
        piece_length,
        total_length,
        local_peer_id: PeerId::generate_with_prefix(config.peer.client_id),
    })
}

async fn seed(
    config: &SwarmwireConfig,
    file: PathBuf,
    info_hash: &str,
    bind: SocketAddr,
    piece_length: u32,
) -> anyhow::Result<()> {
    let info_hash = parse_info_hash(info_hash)?;
    let content = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    if content.is_empty() {
        bail!("{} is empty", file.display());
    }

    let metadata = metadata(config, info_hash, piece_length, content.len() as u64)?;
    let store = Arc::new(MemoryPieceStore::with_content(piece_length, &content));
    let session = TorrentSession::with_bitfield(
        metadata,
        store.completed_pieces(),
        Arc::clone(&store) as Arc<dyn PieceStore>,
    );

    let factory = PeerFactory::with_tcp(config);
    let registry = factory.create_registry(&session);
    let listener = factory.listen(bind).await?;
    println!(
        "Seeding {} ({} pieces) as {} on {}",
        file.display(),
        session.piece_count(),
        info_hash,
        listener.local_address()
    );

    let mut added = registry.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            peer = added.recv() => match peer {
                Ok(peer_info) => {
                    println!("Peer connected: {peer_info}");
                    if let Some(connection) = registry.connection(&peer_info) {
                        let _ = connection.send_unchoke().await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    listener.shutdown();
    factory.remove_registry(&info_hash);
    println!("Uploaded {} bytes", session.counters().uploaded());
    Ok(())
}

async fn fetch(
    config: &SwarmwireConfig,
    peer: SocketAddr,
    info_hash: &str,
    total_length: u64,
    piece_length: u32,
    output: PathBuf,
    limit: Duration,
) -> anyhow::Result<()> {
    let info_hash = parse_info_hash(info_hash)?;
    let metadata = metadata(config, info_hash, piece_length, total_length)?;
    let store = Arc::new(MemoryPieceStore::new(piece_length, total_length));
    let session = TorrentSession::new(metadata, Arc::clone(&store) as Arc<dyn PieceStore>);

    let factory = PeerFactory::with_tcp(config);
    let registry = factory.create_registry(&session);
    let peer_info = registry
        .add_by_address(peer)
        .await
        .ok_or_else(|| anyhow!("could not establish a session with {peer}"))?;
    let connection = registry
        .connection(&peer_info)
        .ok_or_else(|| anyhow!("{peer} disconnected right after the handshake"))?;
    println!("Connected to {peer_info}");

    connection.send_interested().await?;
    let deadline = Instant::now() + limit;
    wait_for_unchoke(&connection, deadline).await;

    let blocks = plan_blocks(total_length, piece_length, BLOCK_SIZE);
    let window = (config.peer.max_pending_uploads / 2).max(1) as u64 * u64::from(BLOCK_SIZE);
    let mut next = 0;
    let mut requested: u64 = 0;

    while session.counters().remaining() > 0 {
        if connection.is_disposed() {
            bail!("{peer} disconnected during the transfer");
        }
        if Instant::now() >= deadline {
            bail!(
                "timed out with {} of {} bytes received",
                session.counters().downloaded(),
                total_length
            );
        }

        while let Some(&(piece_index, offset, length)) = blocks.get(next)
            && requested.saturating_sub(session.counters().downloaded()) < window
        {
            connection.request_block(piece_index, offset, length).await?;
            requested += u64::from(length);
            next += 1;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let mut content = Vec::with_capacity(total_length as usize);
    for index in 0..session.piece_count() {
        let piece = store
            .piece(PieceIndex::new(index))
            .ok_or_else(|| anyhow!("piece {index} missing after transfer"))?;
        content.extend_from_slice(&piece);
    }
    tokio::fs::write(&output, &content)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    registry.shutdown();
    println!("Wrote {} bytes to {}", content.len(), output.display());
    Ok(())
}

async fn wait_for_unchoke(connection: &PeerConnection, deadline: Instant) {
    while connection.is_choked() && !connection.is_disposed() && Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    if connection.is_choked() {
        tracing::warn!("{} is still choking us; requesting anyway", connection.address());
    }
}

async fn probe(
    config: &SwarmwireConfig,
    peer: SocketAddr,
    info_hash: &str,
    pieces: u32,
    piece_length: u32,
    wait: Duration,
) -> anyhow::Result<()> {
    let info_hash = parse_info_hash(info_hash)?;
    let total_length = u64::from(pieces) * u64::from(piece_length);
    let metadata = metadata(config, info_hash, piece_length, total_length)?;
    let store = Arc::new(MemoryPieceStore::new(piece_length, total_length));
    let session = TorrentSession::new(metadata, store);

    let factory = PeerFactory::with_tcp(config);
    let registry = factory.create_registry(&session);
    let peer_info = registry
        .add_by_address(peer)
        .await
        .ok_or_else(|| anyhow!("could not establish a session with {peer}"))?;
    let connection = registry
        .connection(&peer_info)
        .ok_or_else(|| anyhow!("{peer} disconnected right after the handshake"))?;

    tokio::time::sleep(wait).await;

    let stats = connection.stats();
    println!("Peer:       {peer_info}");
    println!("Phase:      {:?}", stats.phase);
    println!("Choking us: {}", stats.is_choked);
    match stats.remote_piece_count {
        Some(count) => println!("Pieces:     {count}/{pieces}"),
        None => println!("Pieces:     not advertised"),
    }

    registry.shutdown();
    Ok(())
}

/// Splits a torrent into `(piece, offset, length)` requests of at most
/// `block_size` bytes.
fn plan_blocks(
    total_length: u64,
    piece_length: u32,
    block_size: u32,
) -> Vec<(PieceIndex, u32, u32)> {
    let mut blocks = Vec::new();
    let mut piece_start = 0u64;
    let mut index = 0u32;

    while piece_start < total_length {
        let size = (total_length - piece_start).min(u64::from(piece_length)) as u32;
        let mut offset = 0;
        while offset < size {
            let length = (size - offset).min(block_size);
            blocks.push((PieceIndex::new(index), offset, length));
            offset += length;
        }
        piece_start += u64::from(piece_length);
        index += 1;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_blocks_covers_short_tail() {
        let blocks = plan_blocks(50, 20, 8);

        assert_eq!(blocks.len(), 8);
        assert_eq!(blocks[0], (PieceIndex::new(0), 0, 8));
        assert_eq!(blocks[2], (PieceIndex::new(0), 16, 4));
        assert_eq!(blocks[7], (PieceIndex::new(2), 8, 2));
        let total: u32 = blocks.iter().map(|&(_, _, length)| length).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn test_metadata_rejects_zero_piece_length() {
        let config = SwarmwireConfig::default();
        assert!(metadata(&config, InfoHash::new([1u8; 20]), 0, 10).is_err());

        let metadata = metadata(&config, InfoHash::new([1u8; 20]), 4, 10).unwrap();
        assert_eq!(metadata.piece_count, 3);
    }
}
