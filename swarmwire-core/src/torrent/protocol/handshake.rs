//! BitTorrent handshake serialization and deserialization

use bytes::{Buf, BufMut, BytesMut};

use super::types::{PROTOCOL_STRING, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// pstrlen + pstr + reserved + info_hash + peer_id
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        Self::encode(handshake, &mut buf);
        buf.to_vec()
    }

    /// Appends the wire form of `handshake` to `buf`.
    ///
    /// The info hash goes out in its 20-byte wire form.
    pub fn encode(handshake: &PeerHandshake, buf: &mut BytesMut) {
        buf.put_u8(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash.wire_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Invalid handshake format or length
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        let mut buf = BytesMut::from(data);
        Self::decode(&mut buf)?.ok_or_else(|| TorrentError::violation("Handshake too short"))
    }

    /// Pops a handshake off the front of `buf`, or returns `Ok(None)` until
    /// all of it has arrived.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Unsupported protocol string
    pub fn decode(buf: &mut BytesMut) -> Result<Option<PeerHandshake>, TorrentError> {
        let Some(&protocol_len) = buf.first() else {
            return Ok(None);
        };
        if usize::from(protocol_len) != PROTOCOL_STRING.len() {
            return Err(TorrentError::violation(format!(
                "Unsupported protocol string length {protocol_len}"
            )));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let protocol_bytes = buf.split_to(PROTOCOL_STRING.len());
        if protocol_bytes[..] != *PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::violation(format!(
                "Unsupported protocol {:?}",
                String::from_utf8_lossy(&protocol_bytes)
            )));
        }

        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);

        let mut info_hash_bytes = [0u8; 20];
        buf.copy_to_slice(&mut info_hash_bytes);

        let mut peer_id_bytes = [0u8; 20];
        buf.copy_to_slice(&mut peer_id_bytes);

        Ok(Some(PeerHandshake {
            protocol: PROTOCOL_STRING.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash_bytes),
            peer_id: PeerId::new(peer_id_bytes),
        }))
    }
}
