//! Piece storage abstraction
//!
//! Connections read blocks to serve Requests and write blocks received in
//! Piece messages through this seam. Hash verification and file layout
//! belong to the implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::bitfield::BitField;
use super::{PieceIndex, TorrentError};

/// Abstract interface for reading and writing piece blocks.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Reads `length` bytes of a piece starting at `begin`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceIoFailure` - Piece missing, range invalid or storage failure
    async fn get_piece(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<Bytes, TorrentError>;

    /// Writes one block of a piece starting at `begin`.
    ///
    /// Returns `true` once the piece is complete and verified.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceIoFailure` - Range invalid or storage failure
    async fn set_piece(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        data: Bytes,
    ) -> Result<bool, TorrentError>;
}

/// Piece store held entirely in memory.
///
/// Tracks per-byte coverage of partially written pieces; a piece counts as
/// complete once every byte has been written.
pub struct MemoryPieceStore {
    piece_length: u32,
    total_length: u64,
    pieces: Mutex<HashMap<u32, StoredPiece>>,
}

struct StoredPiece {
    data: Vec<u8>,
    written: BitField,
}

impl StoredPiece {
    fn is_complete(&self) -> bool {
        self.written.all_true()
    }
}

impl MemoryPieceStore {
    /// Creates an empty store for a torrent of `total_length` bytes.
    pub fn new(piece_length: u32, total_length: u64) -> Self {
        assert!(piece_length > 0, "piece length must be greater than zero");
        Self {
            piece_length,
            total_length,
            pieces: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a store holding every piece of `content`.
    pub fn with_content(piece_length: u32, content: &[u8]) -> Self {
        let store = Self::new(piece_length, content.len() as u64);
        {
            let mut pieces = store.pieces.lock();
            for (index, chunk) in content.chunks(piece_length as usize).enumerate() {
                let mut written = BitField::new(chunk.len());
                written.set_all();
                pieces.insert(
                    index as u32,
                    StoredPiece {
                        data: chunk.to_vec(),
                        written,
                    },
                );
            }
        }
        store
    }

    pub fn piece_count(&self) -> u32 {
        self.total_length.div_ceil(u64::from(self.piece_length)) as u32
    }

    /// Bitfield of complete pieces, suitable as a session's local bitfield.
    pub fn completed_pieces(&self) -> BitField {
        let mut field = BitField::new(self.piece_count() as usize);
        for (&index, piece) in self.pieces.lock().iter() {
            if piece.is_complete() {
                field.set(index as usize);
            }
        }
        field
    }

    /// Contents of a complete piece.
    pub fn piece(&self, piece_index: PieceIndex) -> Option<Bytes> {
        self.pieces
            .lock()
            .get(&piece_index.as_u32())
            .filter(|piece| piece.is_complete())
            .map(|piece| Bytes::copy_from_slice(&piece.data))
    }

    fn piece_size(&self, piece_index: PieceIndex) -> Option<usize> {
        if piece_index.as_u32() >= self.piece_count() {
            return None;
        }
        let start = u64::from(piece_index.as_u32()) * u64::from(self.piece_length);
        Some((self.total_length - start).min(u64::from(self.piece_length)) as usize)
    }

    fn block_range(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        length: usize,
    ) -> Result<(usize, std::ops::Range<usize>), TorrentError> {
        let size = self.piece_size(piece_index).ok_or_else(|| TorrentError::PieceIoFailure {
            index: piece_index,
            reason: "piece index out of range".to_string(),
        })?;
        let start = begin as usize;
        let end = start.checked_add(length).filter(|&end| end <= size).ok_or_else(|| {
            TorrentError::PieceIoFailure {
                index: piece_index,
                reason: format!("block {start}+{length} exceeds piece size {size}"),
            }
        })?;
        Ok((size, start..end))
    }
}

#[async_trait]
impl PieceStore for MemoryPieceStore {
    async fn get_piece(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<Bytes, TorrentError> {
        let (_, range) = self.block_range(piece_index, begin, length as usize)?;
        let pieces = self.pieces.lock();
        let piece = pieces
            .get(&piece_index.as_u32())
            .filter(|piece| piece.is_complete())
            .ok_or_else(|| TorrentError::PieceIoFailure {
                index: piece_index,
                reason: "piece not available".to_string(),
            })?;
        Ok(Bytes::copy_from_slice(&piece.data[range]))
    }

    async fn set_piece(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        data: Bytes,
    ) -> Result<bool, TorrentError> {
        let (size, range) = self.block_range(piece_index, begin, data.len())?;
        let mut pieces = self.pieces.lock();
        let piece = pieces
            .entry(piece_index.as_u32())
            .or_insert_with(|| StoredPiece {
                data: vec![0u8; size],
                written: BitField::new(size),
            });

        piece.data[range.clone()].copy_from_slice(&data);
        for offset in range {
            piece.written.set(offset);
        }
        Ok(piece.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_store_serves_blocks() {
        let content: Vec<u8> = (0..250u32).map(|value| value as u8).collect();
        let store = MemoryPieceStore::with_content(100, &content);

        assert_eq!(store.piece_count(), 3);
        assert_eq!(store.completed_pieces().true_count(), 3);

        let block = store.get_piece(PieceIndex::new(1), 10, 5).await.unwrap();
        assert_eq!(&block[..], &content[110..115]);

        let tail = store.get_piece(PieceIndex::new(2), 0, 50).await.unwrap();
        assert_eq!(&tail[..], &content[200..250]);
    }

    #[tokio::test]
    async fn test_out_of_range_reads_fail() {
        let store = MemoryPieceStore::with_content(100, &[1u8; 250]);

        let past_end = store.get_piece(PieceIndex::new(2), 40, 20).await;
        assert!(matches!(past_end, Err(TorrentError::PieceIoFailure { .. })));

        let bad_index = store.get_piece(PieceIndex::new(3), 0, 1).await;
        assert!(bad_index.is_err());
    }

    #[tokio::test]
    async fn test_piece_completes_when_all_blocks_written() {
        let store = MemoryPieceStore::new(8, 16);

        let first = store
            .set_piece(PieceIndex::new(1), 0, Bytes::from_static(&[1, 2, 3, 4]))
            .await
            .unwrap();
        assert!(!first);
        assert!(store.get_piece(PieceIndex::new(1), 0, 4).await.is_err());

        let second = store
            .set_piece(PieceIndex::new(1), 4, Bytes::from_static(&[5, 6, 7, 8]))
            .await
            .unwrap();
        assert!(second);
        assert_eq!(
            store.piece(PieceIndex::new(1)).unwrap(),
            Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8])
        );
        assert!(store.completed_pieces().get(1));
        assert!(!store.completed_pieces().get(0));
    }
}
