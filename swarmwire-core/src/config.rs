//! Centralized configuration for Swarmwire.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::SwarmwireError;

/// Central configuration for all Swarmwire components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SwarmwireConfig {
    pub peer: PeerConfig,
    pub pool: PoolConfig,
}

/// Per-connection protocol settings.
///
/// Controls dial and handshake bounds, upload backpressure and framing
/// limits for every peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// BitTorrent client identifier used as the peer id prefix
    pub client_id: &'static str,
    /// Upper bound on an outbound TCP connect
    pub connect_timeout: Duration,
    /// How long a connection may wait for the remote handshake
    pub handshake_timeout: Duration,
    /// Piece reads a single connection may have in flight
    pub max_pending_uploads: usize,
    /// Requests a peer may have outstanding before it counts as flooding us
    pub max_queued_requests: usize,
    /// Registrations a single swarm accepts before refusing newcomers
    pub max_peers_per_swarm: usize,
    /// Largest frame accepted from a peer, length prefix excluded
    pub max_frame_len: usize,
    /// Outgoing messages queued per connection before `send` waits
    pub send_queue_len: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            client_id: "-SW0001-",
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            max_pending_uploads: 16,
            max_queued_requests: 250,
            max_peers_per_swarm: 50,
            max_frame_len: 1 << 20, // 1 MiB
            send_queue_len: 64,
        }
    }
}

/// Outbound connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle read buffers kept for reuse
    pub capacity: usize,
    /// Initial capacity of each read buffer
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            buffer_size: 32768, // 32 KiB
        }
    }
}

impl SwarmwireConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_parse::<u64>("SWARMWIRE_CONNECT_TIMEOUT") {
            config.peer.connect_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("SWARMWIRE_HANDSHAKE_TIMEOUT") {
            config.peer.handshake_timeout = Duration::from_secs(seconds);
        }

        if let Some(count) = env_parse::<usize>("SWARMWIRE_MAX_PENDING_UPLOADS") {
            config.peer.max_pending_uploads = count;
        }

        if let Some(count) = env_parse::<usize>("SWARMWIRE_MAX_QUEUED_REQUESTS") {
            config.peer.max_queued_requests = count;
        }

        if let Some(count) = env_parse::<usize>("SWARMWIRE_MAX_PEERS") {
            config.peer.max_peers_per_swarm = count;
        }

        if let Some(count) = env_parse::<usize>("SWARMWIRE_POOL_CAPACITY") {
            config.pool.capacity = count;
        }

        config
    }

    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    /// - `SwarmwireError::Configuration` - A timeout or limit is zero
    pub fn validate(&self) -> Result<(), SwarmwireError> {
        let zero = [
            ("connect timeout", self.peer.connect_timeout.is_zero()),
            ("handshake timeout", self.peer.handshake_timeout.is_zero()),
            ("pending upload limit", self.peer.max_pending_uploads == 0),
            ("queued request limit", self.peer.max_queued_requests == 0),
            ("peers per swarm", self.peer.max_peers_per_swarm == 0),
            ("frame length limit", self.peer.max_frame_len == 0),
            ("send queue length", self.peer.send_queue_len == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((setting, _)) => Err(SwarmwireError::Configuration {
                reason: format!("{setting} must be greater than zero"),
            }),
            None => Ok(()),
        }
    }

    /// Configuration with short bounds for fast tests.
    pub fn for_testing() -> Self {
        Self {
            peer: PeerConfig {
                connect_timeout: Duration::from_millis(500),
                handshake_timeout: Duration::from_millis(500),
                max_pending_uploads: 4,
                max_queued_requests: 32,
                max_peers_per_swarm: 8,
                ..PeerConfig::default()
            },
            pool: PoolConfig {
                capacity: 2,
                buffer_size: 1024,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
