//! Live peer set of one swarm, and the directory of swarms.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::peer_connection::PeerConnection;
use super::peer_factory::PeerFactory;
use super::protocol::PeerId;
use super::session::TorrentSession;
use super::{InfoHash, TorrentError};

/// Capacity of the peer-added notification channel.
const PEER_EVENT_CAPACITY: usize = 64;

/// Identity of a registered peer: where it is and who it says it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub peer_id: PeerId,
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_id, self.address)
    }
}

/// Active connections of one torrent, keyed by `PeerInfo`.
///
/// Holds at most one connection per `PeerInfo`. Every registered connection
/// has completed its handshake for this registry's info hash. Connections
/// that fail remove themselves through the callback installed at
/// registration.
pub struct PeerRegistry {
    session: Arc<TorrentSession>,
    factory: Weak<PeerFactory>,
    max_peers: usize,
    peers: Mutex<HashMap<PeerInfo, Arc<PeerConnection>>>,
    peer_added: broadcast::Sender<PeerInfo>,
}

impl PeerRegistry {
    pub(crate) fn new(
        session: Arc<TorrentSession>,
        factory: Weak<PeerFactory>,
        max_peers: usize,
    ) -> Arc<Self> {
        let (peer_added, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        Arc::new(Self {
            session,
            factory,
            max_peers,
            peers: Mutex::new(HashMap::new()),
            peer_added,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.session.info_hash()
    }

    pub fn session(&self) -> &Arc<TorrentSession> {
        &self.session
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn contains(&self, peer_info: &PeerInfo) -> bool {
        self.peers.lock().contains_key(peer_info)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().keys().copied().collect()
    }

    pub fn connection(&self, peer_info: &PeerInfo) -> Option<Arc<PeerConnection>> {
        self.peers.lock().get(peer_info).cloned()
    }

    /// Receives the identity of every peer registered after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerInfo> {
        self.peer_added.subscribe()
    }

    /// Dials `address`, handshakes and registers the peer.
    ///
    /// Every failure is logged and reported as `None`; an unreachable or
    /// misbehaving peer is routine for a swarm.
    pub async fn add_by_address(self: &Arc<Self>, address: SocketAddr) -> Option<PeerInfo> {
        let Some(factory) = self.factory.upgrade() else {
            tracing::warn!("Cannot dial {}: peer factory is gone", address);
            return None;
        };
        let connection = factory.create_peer(address, &self.session).await?;

        match self.add(connection, true).await {
            Ok(peer_info) => Some(peer_info),
            Err(error) => {
                tracing::debug!("Could not add {} to {}: {}", address, self.info_hash(), error);
                None
            }
        }
    }

    /// Registers a connection, first running our side of the handshake if
    /// `send_handshake` is set.
    ///
    /// On any error the connection is disposed. A duplicate or over-capacity
    /// newcomer is disposed while the existing entries stay untouched.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Handshake failed or names another torrent
    /// - `TorrentError::HandshakeTimeout` - Remote never answered
    /// - `TorrentError::ConnectionClosed` - Connection went away first
    /// - `TorrentError::DuplicateRegistration` - Same address and peer id already registered
    /// - `TorrentError::SwarmFull` - `max_peers` connections already registered
    pub async fn add(
        self: &Arc<Self>,
        connection: Arc<PeerConnection>,
        send_handshake: bool,
    ) -> Result<PeerInfo, TorrentError> {
        let info_hash = self.info_hash();
        if send_handshake {
            connection
                .send_handshake(info_hash, self.session.local_peer_id())
                .await?;
            connection.receive_handshake(Some(info_hash)).await?;
        }

        if connection.is_disposed() {
            return Err(TorrentError::ConnectionClosed {
                address: connection.address(),
            });
        }
        let (Some(peer_info), Some(bound)) = (connection.peer_info(), connection.info_hash())
        else {
            connection.dispose();
            return Err(TorrentError::violation(
                "connection registered before completing its handshake",
            ));
        };
        if !info_hash.matches(&bound) {
            connection.dispose();
            return Err(TorrentError::violation(format!(
                "connection for {bound} offered to swarm {info_hash}"
            )));
        }

        self.try_add(peer_info, connection)
    }

    fn try_add(
        self: &Arc<Self>,
        peer_info: PeerInfo,
        connection: Arc<PeerConnection>,
    ) -> Result<PeerInfo, TorrentError> {
        let refused = {
            let mut peers = self.peers.lock();
            if peers.contains_key(&peer_info) {
                Some(TorrentError::DuplicateRegistration {
                    address: peer_info.address,
                    info_hash: self.info_hash(),
                })
            } else if peers.len() >= self.max_peers {
                Some(TorrentError::SwarmFull {
                    info_hash: self.info_hash(),
                    max_peers: self.max_peers,
                })
            } else {
                peers.insert(peer_info, Arc::clone(&connection));
                None
            }
        };
        if let Some(error) = refused {
            connection.dispose();
            return Err(error);
        }

        let registry = Arc::downgrade(self);
        let registered = Arc::downgrade(&connection);
        connection.start(
            Arc::clone(&self.session),
            Box::new(move |peer_info| {
                if let Some(registry) = registry.upgrade() {
                    registry.remove_connection(&peer_info, &registered);
                }
            }),
        );

        let _ = self.peer_added.send(peer_info);
        tracing::info!(
            "Peer {} joined swarm {} ({} peers)",
            peer_info,
            self.info_hash(),
            self.len()
        );
        Ok(peer_info)
    }

    /// Drops the entry only if it still holds this exact connection.
    fn remove_connection(&self, peer_info: &PeerInfo, connection: &Weak<PeerConnection>) {
        let removed = {
            let mut peers = self.peers.lock();
            let is_current = peers
                .get(peer_info)
                .is_some_and(|current| Arc::as_ptr(current) == connection.as_ptr());
            if is_current { peers.remove(peer_info) } else { None }
        };
        if removed.is_some() {
            tracing::info!("Peer {} left swarm {}", peer_info, self.info_hash());
        }
    }

    /// Removes and disposes a peer. Returns whether it was registered.
    pub fn remove(&self, peer_info: &PeerInfo) -> bool {
        let removed = self.peers.lock().remove(peer_info);
        match removed {
            Some(connection) => {
                connection.dispose();
                tracing::info!("Removed peer {} from swarm {}", peer_info, self.info_hash());
                true
            }
            None => false,
        }
    }

    /// Disposes every registered connection.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.peers.lock().drain().collect();
        for (_, connection) in &drained {
            connection.dispose();
        }
        tracing::debug!(
            "Swarm {} shut down, {} peers disconnected",
            self.info_hash(),
            drained.len()
        );
    }
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("info_hash", &self.info_hash())
            .field("peers", &self.len())
            .field("max_peers", &self.max_peers)
            .finish()
    }
}

/// Registries by every 20-byte wire form of their info hash.
#[derive(Default)]
pub struct SwarmDirectory {
    registries: RwLock<HashMap<[u8; 20], Arc<PeerRegistry>>>,
}

impl SwarmDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry for the session's torrent, creating it on first use.
    pub fn get_or_create(
        &self,
        session: &Arc<TorrentSession>,
        factory: &Weak<PeerFactory>,
        max_peers: usize,
    ) -> Arc<PeerRegistry> {
        let forms = session.info_hash().wire_forms();
        let mut registries = self.registries.write();
        if let Some(existing) = forms.iter().find_map(|form| registries.get(form)) {
            return Arc::clone(existing);
        }

        let registry = PeerRegistry::new(Arc::clone(session), factory.clone(), max_peers);
        for form in forms {
            registries.insert(form, Arc::clone(&registry));
        }
        tracing::debug!("Created swarm for {}", session.info_hash());
        registry
    }

    /// Looks up a registry by any wire form of `info_hash`.
    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<PeerRegistry>> {
        let registries = self.registries.read();
        info_hash
            .wire_forms()
            .iter()
            .find_map(|form| registries.get(form))
            .cloned()
    }

    /// Unlinks a registry from every wire form it was filed under.
    pub fn remove(&self, info_hash: &InfoHash) -> Option<Arc<PeerRegistry>> {
        let mut registries = self.registries.write();
        let registry = info_hash
            .wire_forms()
            .iter()
            .find_map(|form| registries.get(form))
            .cloned()?;
        for form in registry.info_hash().wire_forms() {
            registries.remove(&form);
        }
        Some(registry)
    }

    /// Distinct registries.
    pub fn registries(&self) -> Vec<Arc<PeerRegistry>> {
        let registries = self.registries.read();
        let mut seen = HashSet::new();
        registries
            .values()
            .filter(|registry| seen.insert(Arc::as_ptr(registry)))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::torrent::peer_connection::Direction;
    use crate::torrent::protocol::{PeerHandshake, PeerMessage};
    use crate::torrent::test_support::{
        RemotePeer, empty_session, memory_transport, socket, wait_until,
    };

    const HASH: InfoHash = InfoHash::V1([3u8; 20]);

    fn registry(max_peers: usize) -> Arc<PeerRegistry> {
        let (session, _store) = empty_session(HASH, 4, 16);
        PeerRegistry::new(session, Weak::new(), max_peers)
    }

    /// Connection whose remote has already queued its handshake.
    fn answering_peer(
        port: u16,
        peer_id: [u8; 20],
        info_hash: InfoHash,
    ) -> (Arc<PeerConnection>, RemotePeer) {
        let (transport, remote) = memory_transport(socket(port));
        remote.send(PeerMessage::Handshake(PeerHandshake::new(
            info_hash,
            PeerId::new(peer_id),
        )));
        let connection = PeerConnection::new(transport, Direction::Outbound, PeerConfig::default());
        (connection, remote)
    }

    #[tokio::test]
    async fn test_add_registers_and_notifies() {
        let registry = registry(8);
        let mut added = registry.subscribe();
        let (connection, mut remote) = answering_peer(7101, [1u8; 20], HASH);

        let peer_info = registry.add(Arc::clone(&connection), true).await.unwrap();

        assert_eq!(peer_info.address, socket(7101));
        assert_eq!(peer_info.peer_id, PeerId::new([1u8; 20]));
        assert!(registry.contains(&peer_info));
        assert_eq!(registry.len(), 1);
        assert_eq!(added.recv().await.unwrap(), peer_info);
        assert!(matches!(
            remote.next_message().await,
            Some(PeerMessage::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_keeps_first_connection() {
        let registry = registry(8);
        let (first, _first_remote) = answering_peer(7102, [1u8; 20], HASH);
        let (second, _second_remote) = answering_peer(7102, [1u8; 20], HASH);

        let peer_info = registry.add(Arc::clone(&first), true).await.unwrap();
        let result = registry.add(Arc::clone(&second), true).await;

        assert!(matches!(
            result,
            Err(TorrentError::DuplicateRegistration { .. })
        ));
        assert_eq!(registry.len(), 1);
        assert!(second.is_disposed());
        assert!(!first.is_disposed());
        assert!(Arc::ptr_eq(&registry.connection(&peer_info).unwrap(), &first));
    }

    #[tokio::test]
    async fn test_same_address_different_peer_ids_coexist() {
        let registry = registry(8);
        let (first, _first_remote) = answering_peer(7103, [1u8; 20], HASH);
        let (second, _second_remote) = answering_peer(7103, [2u8; 20], HASH);

        registry.add(first, true).await.unwrap();
        registry.add(second, true).await.unwrap();

        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_full_swarm_refuses_newcomer() {
        let registry = registry(1);
        let (first, _first_remote) = answering_peer(7104, [1u8; 20], HASH);
        let (second, _second_remote) = answering_peer(7105, [2u8; 20], HASH);

        registry.add(first, true).await.unwrap();
        let result = registry.add(Arc::clone(&second), true).await;

        assert!(matches!(result, Err(TorrentError::SwarmFull { max_peers: 1, .. })));
        assert!(second.is_disposed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_torrent_is_rejected() {
        let registry = registry(8);
        let (connection, _remote) = answering_peer(7106, [1u8; 20], InfoHash::new([4u8; 20]));

        let result = registry.add(Arc::clone(&connection), true).await;

        assert!(matches!(result, Err(TorrentError::ProtocolViolation { .. })));
        assert!(connection.is_disposed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unhandshaken_connection_is_rejected() {
        let registry = registry(8);
        let (transport, _remote) = memory_transport(socket(7107));
        let connection = PeerConnection::new(transport, Direction::Inbound, PeerConfig::default());

        let result = registry.add(Arc::clone(&connection), false).await;

        assert!(matches!(result, Err(TorrentError::ProtocolViolation { .. })));
        assert!(connection.is_disposed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_of_same_peer_have_one_winner() {
        const RACERS: usize = 16;
        let registry = registry(RACERS);
        let mut added = registry.subscribe();

        let mut connections = Vec::new();
        let mut remotes = Vec::new();
        for _ in 0..RACERS {
            let (connection, remote) = answering_peer(7112, [1u8; 20], HASH);
            connection.receive_handshake(Some(HASH)).await.unwrap();
            connections.push(connection);
            remotes.push(remote);
        }

        let start = Arc::new(tokio::sync::Barrier::new(RACERS));
        let tasks: Vec<_> = connections
            .iter()
            .map(|connection| {
                let registry = Arc::clone(&registry);
                let connection = Arc::clone(connection);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    registry.add(connection, false).await
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(error) => {
                    assert!(matches!(error, TorrentError::DuplicateRegistration { .. }));
                }
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
        let disposed = connections.iter().filter(|c| c.is_disposed()).count();
        assert_eq!(disposed, RACERS - 1);

        let peer_info = added.recv().await.unwrap();
        let winner = registry.connection(&peer_info).unwrap();
        assert!(!winner.is_disposed());
        assert!(matches!(
            added.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_removes_dispose_once() {
        const RACERS: usize = 8;
        let registry = registry(8);
        let (connection, _remote) = answering_peer(7113, [1u8; 20], HASH);
        let peer_info = registry.add(Arc::clone(&connection), true).await.unwrap();

        let start = Arc::new(tokio::sync::Barrier::new(RACERS));
        let tasks: Vec<_> = (0..RACERS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    registry.remove(&peer_info)
                })
            })
            .collect();

        let mut removed = 0;
        for task in tasks {
            if task.await.unwrap() {
                removed += 1;
            }
        }

        assert_eq!(removed, 1);
        assert!(registry.is_empty());
        assert!(connection.is_disposed());
    }

    #[tokio::test]
    async fn test_failed_connection_leaves_registry() {
        let registry = registry(8);
        let (connection, remote) = answering_peer(7108, [1u8; 20], HASH);
        registry.add(Arc::clone(&connection), true).await.unwrap();

        remote.send(PeerMessage::Unknown {
            id: 99,
            payload: bytes::Bytes::new(),
        });

        assert!(wait_until(|| registry.is_empty()).await);
        assert!(connection.is_disposed());
    }

    #[tokio::test]
    async fn test_remove_and_shutdown_dispose() {
        let registry = registry(8);
        let (first, _first_remote) = answering_peer(7109, [1u8; 20], HASH);
        let (second, _second_remote) = answering_peer(7110, [2u8; 20], HASH);
        let first_info = registry.add(Arc::clone(&first), true).await.unwrap();
        registry.add(Arc::clone(&second), true).await.unwrap();

        assert!(registry.remove(&first_info));
        assert!(!registry.remove(&first_info));
        assert!(first.is_disposed());

        registry.shutdown();
        assert!(second.is_disposed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_readding_after_removal_is_not_undone_by_stale_callback() {
        let registry = registry(8);
        let (first, first_remote) = answering_peer(7111, [1u8; 20], HASH);
        let peer_info = registry.add(Arc::clone(&first), true).await.unwrap();

        let (second, _second_remote) = answering_peer(7111, [1u8; 20], HASH);
        registry.peers.lock().remove(&peer_info);
        registry.add(Arc::clone(&second), true).await.unwrap();

        // The first connection now fails and reports itself.
        first_remote.send(PeerMessage::Unknown {
            id: 42,
            payload: bytes::Bytes::new(),
        });
        assert!(wait_until(|| first.is_disposed()).await);

        assert!(Arc::ptr_eq(&registry.connection(&peer_info).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_directory_finds_hybrid_by_either_form() {
        let v1 = [5u8; 20];
        let v2 = [6u8; 32];
        let (session, _store) = empty_session(InfoHash::hybrid(v1, v2), 4, 16);
        let directory = SwarmDirectory::new();

        let created = directory.get_or_create(&session, &Weak::new(), 8);
        let again = directory.get_or_create(&session, &Weak::new(), 8);
        assert!(Arc::ptr_eq(&created, &again));
        assert_eq!(directory.len(), 1);

        let mut truncated = [0u8; 20];
        truncated.copy_from_slice(&v2[..20]);
        assert!(directory.get(&InfoHash::new(v1)).is_some());
        assert!(directory.get(&InfoHash::new(truncated)).is_some());
        assert!(directory.get(&InfoHash::from_v2(v2)).is_some());
        assert!(directory.get(&InfoHash::new([9u8; 20])).is_none());

        assert!(directory.remove(&InfoHash::new(v1)).is_some());
        assert!(directory.is_empty());
        assert!(directory.get(&InfoHash::new(truncated)).is_none());
    }

    #[tokio::test]
    async fn test_add_by_address_without_factory_is_none() {
        let registry = registry(8);
        assert!(registry.add_by_address(socket(7112)).await.is_none());
        assert!(registry.is_empty());
    }
}
