//! Creates peer connections and routes them to swarm registries
//!
//! The factory owns the registry directory, the outbound buffer pool and the
//! dialer. Outbound peers are dialed through `create_peer`; inbound peers
//! arrive through `accept_inbound`, usually fed by `listen`.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;

use super::connection_pool::ConnectionPool;
use super::peer_connection::{Direction, PeerConnection};
use super::peer_registry::{PeerInfo, PeerRegistry, SwarmDirectory};
use super::protocol::{DialError, Dialer, PeerTransport, TcpDialer, TcpTransport};
use super::session::TorrentSession;
use super::{InfoHash, TorrentError};
use crate::config::SwarmwireConfig;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Entry point of the peer-wire engine for one process.
pub struct PeerFactory {
    self_ref: Weak<PeerFactory>,
    config: SwarmwireConfig,
    dialer: Arc<dyn Dialer>,
    pool: ConnectionPool,
    swarms: SwarmDirectory,
}

impl PeerFactory {
    /// Creates a factory that dials through `dialer`.
    pub fn new(config: &SwarmwireConfig, dialer: Arc<dyn Dialer>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config: config.clone(),
            dialer,
            pool: ConnectionPool::new(&config.pool),
            swarms: SwarmDirectory::new(),
        })
    }

    /// Creates a factory that dials over TCP.
    pub fn with_tcp(config: &SwarmwireConfig) -> Arc<Self> {
        Self::new(config, Arc::new(TcpDialer::new(config.peer.clone())))
    }

    pub fn config(&self) -> &SwarmwireConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Registry for the session's torrent. Repeated calls return the same registry.
    pub fn create_registry(&self, session: &Arc<TorrentSession>) -> Arc<PeerRegistry> {
        self.swarms.get_or_create(
            session,
            &self.self_ref,
            self.config.peer.max_peers_per_swarm,
        )
    }

    /// Looks up the registry serving `info_hash`.
    ///
    /// # Errors
    /// - `TorrentError::UnknownSwarm` - No registry was created for this torrent
    pub fn get_registry(&self, info_hash: &InfoHash) -> Result<Arc<PeerRegistry>, TorrentError> {
        self.swarms
            .get(info_hash)
            .ok_or(TorrentError::UnknownSwarm {
                info_hash: *info_hash,
            })
    }

    /// Forgets a swarm and disconnects its peers.
    pub fn remove_registry(&self, info_hash: &InfoHash) -> Option<Arc<PeerRegistry>> {
        let registry = self.swarms.remove(info_hash)?;
        registry.shutdown();
        tracing::info!("Removed swarm {}", registry.info_hash());
        Some(registry)
    }

    pub fn swarm_count(&self) -> usize {
        self.swarms.len()
    }

    /// Dials `address` for the session's torrent.
    ///
    /// Returns an unregistered outbound connection, or `None` after logging
    /// why the dial failed. Buffers of transient failures go back to the pool.
    /// The dialer bounds the connect itself, so a timed-out dial still hands
    /// its buffer back.
    pub async fn create_peer(
        &self,
        address: SocketAddr,
        session: &TorrentSession,
    ) -> Option<Arc<PeerConnection>> {
        let buffer = self.pool.acquire();

        match self.dialer.dial(address, buffer).await {
            Ok(transport) => {
                tracing::debug!("Connected to {} for {}", address, session.info_hash());
                Some(PeerConnection::new(
                    transport,
                    Direction::Outbound,
                    self.config.peer.clone(),
                ))
            }
            Err(DialError { error, buffer }) => {
                if let Some(buffer) = buffer {
                    self.pool.release(buffer);
                }
                tracing::debug!("Dial for {} failed: {}", session.info_hash(), error);
                None
            }
        }
    }

    /// Takes an inbound transport through the handshake and into the
    /// registry its info hash names.
    ///
    /// A connection for a torrent with no registry is disposed; no registry
    /// is created for it.
    ///
    /// # Errors
    /// - `TorrentError::UnknownSwarm` - Remote named a torrent we do not serve
    /// - Any error of `PeerConnection::receive_handshake` or `PeerRegistry::add`
    pub async fn accept_inbound(&self, transport: PeerTransport) -> Result<PeerInfo, TorrentError> {
        let address = transport.remote_address;
        let connection =
            PeerConnection::new(transport, Direction::Inbound, self.config.peer.clone());
        let completed = connection.receive_handshake(None).await?;

        let Some(registry) = self.swarms.get(&completed.info_hash) else {
            tracing::warn!(
                "Rejecting {}: no swarm for {}",
                address,
                completed.info_hash
            );
            connection.dispose();
            return Err(TorrentError::UnknownSwarm {
                info_hash: completed.info_hash,
            });
        };

        // Answer with the form of the hash the remote used.
        connection
            .send_handshake(completed.info_hash, registry.session().local_peer_id())
            .await?;
        registry.add(connection, false).await
    }

    /// Accepts inbound TCP peers on `address` until the listener is shut down.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Address could not be bound
    pub async fn listen(
        self: &Arc<Self>,
        address: impl ToSocketAddrs,
    ) -> Result<PeerListener, TorrentError> {
        let listener = TcpListener::bind(address).await?;
        let local_address = listener.local_addr()?;
        tracing::info!("Listening for peers on {}", local_address);

        let factory = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept on {} failed: {}", local_address, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                };
                tracing::debug!("Accepted connection from {}", remote);

                let buffer = BytesMut::with_capacity(factory.config.pool.buffer_size);
                let transport =
                    match TcpTransport::from_stream(stream, buffer, &factory.config.peer) {
                        Ok(transport) => transport,
                        Err(e) => {
                            tracing::debug!("Dropping inbound {}: {}", remote, e);
                            continue;
                        }
                    };

                let factory = Arc::clone(&factory);
                tokio::spawn(async move {
                    if let Err(e) = factory.accept_inbound(transport).await {
                        tracing::debug!("Inbound peer {} not registered: {}", remote, e);
                    }
                });
            }
        });

        Ok(PeerListener {
            local_address,
            task,
        })
    }
}

impl std::fmt::Debug for PeerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerFactory")
            .field("swarms", &self.swarm_count())
            .field("idle_buffers", &self.pool.idle_count())
            .finish_non_exhaustive()
    }
}

/// Running inbound accept loop. Stops when shut down or dropped.
#[derive(Debug)]
pub struct PeerListener {
    local_address: SocketAddr,
    task: JoinHandle<()>,
}

impl PeerListener {
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
