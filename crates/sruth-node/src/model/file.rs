//! `FileId`, `FileInfo`, `Piece` — the versioned-file identity and the unit
//! of transfer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::path::ArchivePath;
use super::time::ArchiveTime;

/// Fixed piece size for every file in the archive.
pub const PIECE_SIZE: u64 = 131_072;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub path: ArchivePath,
    pub time: ArchiveTime,
}

impl FileId {
    pub fn new(path: ArchivePath, time: ArchiveTime) -> Self {
        Self { path, time }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: FileId,
    pub size: u64,
    pub piece_size: u64,
    /// Seconds until expiry after materialization; negative means never.
    pub ttl_secs: i64,
}

impl FileInfo {
    pub fn new(id: FileId, size: u64, ttl_secs: i64) -> Self {
        Self {
            id,
            size,
            piece_size: PIECE_SIZE,
            ttl_secs,
        }
    }

    pub fn piece_count(&self) -> u32 {
        if self.size == 0 {
            return 1;
        }
        self.size.div_ceil(self.piece_size) as u32
    }

    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_size
    }

    /// Payload length of piece `index`: `min(piece_size, size - offset)`.
    pub fn piece_len(&self, index: u32) -> u64 {
        let offset = self.piece_offset(index);
        self.piece_size.min(self.size.saturating_sub(offset))
    }

    pub fn never_expires(&self) -> bool {
        self.ttl_secs < 0
    }

    pub fn valid_index(&self, index: u32) -> bool {
        index < self.piece_count()
    }
}

/// `payload` is `Bytes` rather than `Vec<u8>` so that handing the same
/// piece to both the archive and a clearinghouse broadcast (see
/// `piece_receiver_task`) is a refcount bump, not a piece-sized copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    pub info: FileInfo,
    pub index: u32,
    pub payload: Bytes,
}

impl Piece {
    pub fn offset(&self) -> u64 {
        self.info.piece_offset(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::path::ArchivePath;

    fn fi(size: u64) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::new("a/b.txt").unwrap(), ArchiveTime::from_millis(1)),
            size,
            -1,
        )
    }

    #[test]
    fn piece_count_rounds_up_and_last_piece_is_short() {
        let info = fi(PIECE_SIZE * 2 + 1);
        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.piece_len(0), PIECE_SIZE);
        assert_eq!(info.piece_len(1), PIECE_SIZE);
        assert_eq!(info.piece_len(2), 1);
    }

    #[test]
    fn empty_file_has_one_zero_length_piece() {
        let info = fi(0);
        assert_eq!(info.piece_count(), 1);
        assert_eq!(info.piece_len(0), 0);
    }
}
