//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::handshake::HandshakeCodec;
use super::types::PeerMessage;
use crate::torrent::{PieceIndex, TorrentError};

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

/// Length-prefixed framing for every message after the handshake.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Self::encode(message, &mut buf);
        buf.to_vec()
    }

    /// Appends the wire form of `message` to `buf`.
    pub fn encode(message: &PeerMessage, buf: &mut BytesMut) {
        match message {
            PeerMessage::Handshake(handshake) => HandshakeCodec::encode(handshake, buf),
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => put_signal(buf, ID_CHOKE),
            PeerMessage::Unchoke => put_signal(buf, ID_UNCHOKE),
            PeerMessage::Interested => put_signal(buf, ID_INTERESTED),
            PeerMessage::NotInterested => put_signal(buf, ID_NOT_INTERESTED),
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // id + index
                buf.put_u8(ID_HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(ID_BITFIELD);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => put_block_ref(buf, ID_REQUEST, *piece_index, *offset, *length),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // id + index + offset + data
                buf.put_u8(ID_PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => put_block_ref(buf, ID_CANCEL, *piece_index, *offset, *length),
            PeerMessage::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(ID_PORT);
                buf.put_u16(*port);
            }
            PeerMessage::Unknown { id, payload } => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(*id);
                buf.extend_from_slice(payload);
            }
        }
    }

    /// Deserializes one complete length-prefixed message.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Truncated frame or bad payload length
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        let mut buf = BytesMut::from(data);
        match Self::decode_frame(&mut buf, usize::MAX)? {
            Some(message) => Ok(message),
            None => Err(TorrentError::violation("Incomplete message")),
        }
    }

    /// Pops one frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a whole frame has
    /// arrived.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Frame longer than `max_frame_len`
    ///   or a payload length that does not fit its message id
    pub fn decode_frame(
        buf: &mut BytesMut,
        max_frame_len: usize,
    ) -> Result<Option<PeerMessage>, TorrentError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > max_frame_len {
            return Err(TorrentError::violation(format!(
                "Frame of {length} bytes exceeds limit of {max_frame_len}"
            )));
        }
        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(length).freeze();
        if frame.is_empty() {
            return Ok(Some(PeerMessage::KeepAlive));
        }

        let id = frame.get_u8();
        let message = match id {
            ID_CHOKE => expect_empty(id, &frame, PeerMessage::Choke)?,
            ID_UNCHOKE => expect_empty(id, &frame, PeerMessage::Unchoke)?,
            ID_INTERESTED => expect_empty(id, &frame, PeerMessage::Interested)?,
            ID_NOT_INTERESTED => expect_empty(id, &frame, PeerMessage::NotInterested)?,
            ID_HAVE => {
                expect_len(id, &frame, 4)?;
                PeerMessage::Have {
                    piece_index: PieceIndex::new(frame.get_u32()),
                }
            }
            ID_BITFIELD => PeerMessage::Bitfield { bitfield: frame },
            ID_REQUEST => {
                expect_len(id, &frame, 12)?;
                PeerMessage::Request {
                    piece_index: PieceIndex::new(frame.get_u32()),
                    offset: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            ID_PIECE => {
                if frame.len() < 8 {
                    return Err(TorrentError::violation("Invalid Piece message length"));
                }
                PeerMessage::Piece {
                    piece_index: PieceIndex::new(frame.get_u32()),
                    offset: frame.get_u32(),
                    data: frame,
                }
            }
            ID_CANCEL => {
                expect_len(id, &frame, 12)?;
                PeerMessage::Cancel {
                    piece_index: PieceIndex::new(frame.get_u32()),
                    offset: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            ID_PORT => {
                expect_len(id, &frame, 2)?;
                PeerMessage::Port {
                    port: frame.get_u16(),
                }
            }
            _ => PeerMessage::Unknown { id, payload: frame },
        };

        Ok(Some(message))
    }
}

fn put_signal(buf: &mut BytesMut, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn put_block_ref(buf: &mut BytesMut, id: u8, piece_index: PieceIndex, offset: u32, length: u32) {
    buf.put_u32(13); // id + index + offset + length
    buf.put_u8(id);
    buf.put_u32(piece_index.as_u32());
    buf.put_u32(offset);
    buf.put_u32(length);
}

fn expect_len(id: u8, payload: &Bytes, expected: usize) -> Result<(), TorrentError> {
    if payload.len() != expected {
        return Err(TorrentError::violation(format!(
            "Message {id} carries {} payload bytes, expected {expected}",
            payload.len()
        )));
    }
    Ok(())
}

fn expect_empty(
    id: u8,
    payload: &Bytes,
    message: PeerMessage,
) -> Result<PeerMessage, TorrentError> {
    expect_len(id, payload, 0)?;
    Ok(message)
}
