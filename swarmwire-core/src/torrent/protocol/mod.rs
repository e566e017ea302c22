//! BitTorrent wire protocol: message types, codecs and transports.
//!
//! Peer-to-peer protocol following BEP 3. Byte-level framing lives here so
//! that connections above only ever see whole `PeerMessage`s.

pub mod handshake;
pub mod messages;
pub mod transport;
pub mod types;

pub use handshake::{HANDSHAKE_LEN, HandshakeCodec};
pub use messages::MessageCodec;
pub use transport::{
    DialError, Dialer, MessageReceiver, MessageSender, PeerTransport, TcpDialer, TcpTransport,
};
pub use types::{PROTOCOL_STRING, PeerHandshake, PeerId, PeerMessage};
