//! `DiskFile`: per-`FileId` on-disk state machine. Pieces land in a hidden
//! staging copy; the last piece triggers an atomic rename into the visible
//! archive tree.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::Error;
use crate::model::{FileInfo, FiniteBitSet};

/// A file is `Partial` while pieces are still missing (stored hidden, with a
/// trailing serialized bitmap past `size`) and `Complete` once materialized
/// (visible, no trailing bytes). `Absent` is represented by the `DiskFile`
/// simply not existing in the archive's map.
pub struct DiskFile {
    pub info: FileInfo,
    hidden_path: PathBuf,
    visible_path: PathBuf,
    state: State,
    handle: Option<File>,
}

enum State {
    Partial(FiniteBitSet),
    Complete,
}

impl DiskFile {
    /// Opens (creating if needed) the hidden staging copy for a brand new
    /// file version.
    pub async fn create_partial(
        info: FileInfo,
        hidden_path: PathBuf,
        visible_path: PathBuf,
    ) -> Result<Self, Error> {
        if let Some(parent) = hidden_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let mut handle = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&hidden_path)
            .await
            .map_err(|e| io_err(&hidden_path, e))?;
        handle
            .set_len(info.size)
            .await
            .map_err(|e| io_err(&hidden_path, e))?;
        let bitset = FiniteBitSet::empty(info.piece_count());
        let mut file = Self {
            info,
            hidden_path,
            visible_path,
            state: State::Partial(bitset),
            handle: Some(handle),
        };
        file.persist_bitmap().await?;
        Ok(file)
    }

    /// Reopens an existing hidden staging copy, decoding its trailing bitmap.
    pub async fn reopen_partial(
        info: FileInfo,
        hidden_path: PathBuf,
        visible_path: PathBuf,
    ) -> Result<Self, Error> {
        let mut handle = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&hidden_path)
            .await
            .map_err(|e| io_err(&hidden_path, e))?;
        let bitset = read_trailing_bitmap(&mut handle, info.size).await?;
        Ok(Self {
            info,
            hidden_path,
            visible_path,
            state: State::Partial(bitset),
            handle: Some(handle),
        })
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    pub fn have_pieces(&self) -> Option<&FiniteBitSet> {
        match &self.state {
            State::Partial(b) => Some(b),
            State::Complete => None,
        }
    }

    /// Writes one piece's payload; returns `true` if this call completed
    /// the file (materializing it), matching `Archive::putPiece`'s contract.
    pub async fn write_piece(&mut self, index: u32, payload: &[u8]) -> Result<bool, Error> {
        if self.is_complete() {
            return Ok(true);
        }
        let offset = self.info.piece_offset(index);
        let handle = self.handle.as_mut().expect("handle present while partial");
        handle
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(&self.hidden_path, e))?;
        handle
            .write_all(payload)
            .await
            .map_err(|e| io_err(&self.hidden_path, e))?;

        let bitset = match &self.state {
            State::Partial(b) => b.set_bit(index),
            State::Complete => return Ok(true),
        };
        self.state = State::Partial(bitset);
        self.persist_bitmap().await?;

        let complete = matches!(&self.state, State::Partial(b) if b.are_all_set());
        if complete {
            self.materialize().await?;
        }
        Ok(complete)
    }

    async fn persist_bitmap(&mut self) -> Result<(), Error> {
        let State::Partial(bitset) = &self.state else {
            return Ok(());
        };
        let encoded = bincode::serde::encode_to_vec(bitset, bincode::config::standard())
            .map_err(|e| Error::Decode(e.to_string()))?;
        let handle = self.handle.as_mut().expect("handle present while partial");
        handle
            .seek(std::io::SeekFrom::Start(self.info.size))
            .await
            .map_err(|e| io_err(&self.hidden_path, e))?;
        handle
            .set_len(self.info.size)
            .await
            .map_err(|e| io_err(&self.hidden_path, e))?;
        handle
            .seek(std::io::SeekFrom::Start(self.info.size))
            .await
            .map_err(|e| io_err(&self.hidden_path, e))?;
        handle
            .write_all(&encoded)
            .await
            .map_err(|e| io_err(&self.hidden_path, e))?;
        handle.flush().await.map_err(|e| io_err(&self.hidden_path, e))?;
        Ok(())
    }

    /// Last-piece transition: flush, close, truncate the trailing bitmap,
    /// atomically rename hidden → visible. A missing parent directory
    /// during rename is a race with a concurrent removal and is retried
    /// once after `create_dir_all`.
    async fn materialize(&mut self) -> Result<(), Error> {
        if let Some(mut handle) = self.handle.take() {
            handle.flush().await.map_err(|e| io_err(&self.hidden_path, e))?;
            handle
                .set_len(self.info.size)
                .await
                .map_err(|e| io_err(&self.hidden_path, e))?;
        }
        match fs::rename(&self.hidden_path, &self.visible_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = self.visible_path.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_err(parent, e))?;
                }
                fs::rename(&self.hidden_path, &self.visible_path)
                    .await
                    .map_err(|e| Error::Rename {
                        from: self.hidden_path.clone(),
                        to: self.visible_path.clone(),
                        source: e,
                    })?;
            }
            Err(e) => {
                return Err(Error::Rename {
                    from: self.hidden_path.clone(),
                    to: self.visible_path.clone(),
                    source: e,
                });
            }
        }
        self.state = State::Complete;
        Ok(())
    }

    /// Removes the disk state backing this `DiskFile` (TTL expiry or
    /// explicit removal).
    pub async fn remove(&mut self) -> Result<(), Error> {
        self.handle.take();
        let path = if self.is_complete() {
            &self.visible_path
        } else {
            &self.hidden_path
        };
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path, e)),
        }
    }
}

async fn read_trailing_bitmap(handle: &mut File, size: u64) -> Result<FiniteBitSet, Error> {
    let meta = handle.metadata().await.map_err(|e| Error::Io {
        path: PathBuf::new(),
        source: e,
    })?;
    let trailing_len = meta.len().saturating_sub(size);
    let mut buf = vec![0u8; trailing_len as usize];
    handle
        .seek(std::io::SeekFrom::Start(size))
        .await
        .map_err(|e| Error::Io { path: PathBuf::new(), source: e })?;
    use tokio::io::AsyncReadExt;
    handle
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Io { path: PathBuf::new(), source: e })?;
    bincode::serde::decode_from_slice(&buf, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| Error::Decode(e.to_string()))
}

fn io_err(path: &Path, source: std::io::Error) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArchivePath, ArchiveTime, FileId};
    use tempfile::tempdir;

    fn fi(size: u64) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::new("a/b.txt").unwrap(), ArchiveTime::from_millis(1)),
            size,
            -1,
        )
    }

    #[tokio::test]
    async fn materializes_atomically_after_last_piece() {
        let dir = tempdir().unwrap();
        let info = fi(10);
        let hidden = dir.path().join(".sruth").join("a/b.txt");
        let visible = dir.path().join("a/b.txt");
        let mut f = DiskFile::create_partial(info, hidden.clone(), visible.clone())
            .await
            .unwrap();
        assert!(!visible.exists());
        let complete = f.write_piece(0, &[1u8; 10]).await.unwrap();
        assert!(complete);
        assert!(f.is_complete());
        assert!(visible.exists());
        assert!(!hidden.exists());
        let bytes = fs::read(&visible).await.unwrap();
        assert_eq!(bytes.len(), 10);
    }

    #[tokio::test]
    async fn partial_state_round_trips_bitmap_through_reopen() {
        let dir = tempdir().unwrap();
        let info = fi(crate::model::PIECE_SIZE * 2 + 1);
        let hidden = dir.path().join(".sruth").join("a/b.txt");
        let visible = dir.path().join("a/b.txt");
        {
            let mut f = DiskFile::create_partial(info.clone(), hidden.clone(), visible.clone())
                .await
                .unwrap();
            let complete = f
                .write_piece(0, &vec![7u8; crate::model::PIECE_SIZE as usize])
                .await
                .unwrap();
            assert!(!complete);
        }
        let reopened = DiskFile::reopen_partial(info, hidden, visible).await.unwrap();
        let have = reopened.have_pieces().unwrap();
        assert!(have.is_set(0));
        assert!(!have.is_set(1));
    }
}
