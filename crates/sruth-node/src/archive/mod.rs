//! The `Archive`: disk-backed, content-addressed store of files broken into
//! fixed-size pieces, plus the watcher that discovers files dropped onto
//! disk by something other than the piece-exchange protocol.

pub mod cache;
pub mod delayed_deletion;
pub mod disk_file;
pub mod watcher;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::model::path::ADMIN_DIR;
use crate::model::{
    ArchivePath, ArchiveTime, FileId, FileInfo, FilePieceSpecs, Piece, PieceSpec, Predicate,
};

use cache::{open_with_retry, FileCache};
use delayed_deletion::DelayedPathActionQueue;
use disk_file::DiskFile;

/// Emitted when the archive's visible content changes, so the
/// `ClearingHouse` can offer the new data to interested peers.
#[derive(Debug, Clone)]
pub enum ArchiveEvent {
    NewData(FilePieceSpecs),
    Removed(FileId),
}

/// Disk-backed content store for one node. Exclusively owns disk state;
/// `DiskFile`s are loaned to callers under the cache's per-entry lock.
pub struct Archive {
    root: PathBuf,
    cache: FileCache,
    /// Which `FileId` is currently resident (partial or complete) for a
    /// given path -- the version-reconciliation index (spec.md §4.1).
    resident: SyncMutex<HashMap<ArchivePath, FileId>>,
    deletion_queue: Arc<DelayedPathActionQueue>,
    events: broadcast::Sender<ArchiveEvent>,
    cancel: CancellationToken,
}

impl Archive {
    pub async fn open(root: PathBuf, active_file_cache_size: usize) -> Result<Arc<Self>, Error> {
        let hidden = root.join(crate::model::path::HIDDEN_DIR);
        tokio::fs::create_dir_all(&hidden).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::RootNotWritable(root.clone())
            } else {
                Error::Io { path: hidden.clone(), source: e }
            }
        })?;
        purge_hidden_except_journal(&hidden).await?;

        let journal = hidden.join("fileDeletionQueue");
        let deletion_queue = Arc::new(DelayedPathActionQueue::load(root.clone(), journal).await);

        let (events, _) = broadcast::channel(1024);
        let archive = Arc::new(Self {
            root,
            cache: FileCache::new(active_file_cache_size),
            resident: SyncMutex::new(HashMap::new()),
            deletion_queue: deletion_queue.clone(),
            events,
            cancel: CancellationToken::new(),
        });

        let cancel = archive.cancel.clone();
        tokio::spawn(deletion_queue.run(cancel));

        Ok(archive)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.events.subscribe()
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Starts the recursive directory watcher; CREATE/DELETE events on the
    /// visible tree are folded into `ArchiveEvent`s.
    pub fn watch(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher::spawn(self.root.clone(), tx, self.cancel.clone());
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_watch_event(event).await;
            }
        });
    }

    async fn handle_watch_event(self: &Arc<Self>, event: watcher::WatchEvent) {
        match event {
            watcher::WatchEvent::Created(path) => {
                if let Some(archive_path) = self.archive_path_of(&path) {
                    if let Err(e) = self.ingest_external_file(&archive_path, &path).await {
                        warn!(?archive_path, error = %e, "failed to ingest watcher-discovered file");
                    }
                }
            }
            watcher::WatchEvent::Removed(path) => {
                if let Some(archive_path) = self.archive_path_of(&path) {
                    let existing = self.resident.lock().get(&archive_path).cloned();
                    if let Some(id) = existing {
                        self.resident.lock().remove(&archive_path);
                        let _ = self.events.send(ArchiveEvent::Removed(id));
                    }
                }
            }
            watcher::WatchEvent::Rescan => {
                if let Err(e) = self.rescan().await {
                    warn!(error = %e, "archive rescan after watcher overflow failed");
                }
            }
        }
    }

    fn archive_path_of(&self, absolute: &std::path::Path) -> Option<ArchivePath> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        ArchivePath::new(rel.to_string_lossy().as_ref()).ok()
    }

    /// A file that appeared on disk without going through `put_piece`
    /// (created directly by a publisher, or pre-existing at startup).
    async fn ingest_external_file(self: &Arc<Self>, path: &ArchivePath, abs: &std::path::Path) -> Result<(), Error> {
        let meta = tokio::fs::metadata(abs)
            .await
            .map_err(|e| Error::Io { path: abs.to_path_buf(), source: e })?;
        if !meta.is_file() {
            return Ok(());
        }
        // A file that appeared without going through put_piece carries no
        // TTL metadata of its own; treat it as permanent like any other
        // directly-published file until explicitly removed.
        let id = FileId::new(path.clone(), ArchiveTime::now());
        let info = FileInfo::new(id.clone(), meta.len(), -1);
        self.resident.lock().insert(path.clone(), id.clone());
        let _ = self.events.send(ArchiveEvent::NewData(FilePieceSpecs::all_pieces(info)));
        Ok(())
    }

    /// Walks the whole visible tree and re-registers any file the resident
    /// index is missing. Used at startup and after a watcher overflow.
    pub async fn rescan(self: &Arc<Self>) -> Result<(), Error> {
        let root = self.root.clone();
        let hidden_root = root.join(crate::model::path::HIDDEN_DIR);
        for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let abs = entry.path();
            if abs.starts_with(&hidden_root) {
                continue;
            }
            if let Some(path) = self.archive_path_of(abs) {
                if self.resident.lock().contains_key(&path) {
                    continue;
                }
                self.ingest_external_file(&path, abs).await?;
            }
        }
        Ok(())
    }

    /// `putPiece(Piece) -> complete?`. Version-reconciles against any
    /// resident `DiskFile` for the same path, writes the piece, and on
    /// completion materializes the file and schedules its TTL.
    pub async fn put_piece(self: &Arc<Self>, piece: Piece) -> Result<bool, Error> {
        let path = piece.info.id.path.clone();
        let incoming_id = piece.info.id.clone();

        let resident_id = self.resident.lock().get(&path).cloned();
        if let Some(resident_id) = &resident_id {
            if incoming_id.time < resident_id.time {
                // Incoming is older than what we have: discard (P6).
                return Ok(false);
            }
            if incoming_id.time > resident_id.time {
                self.remove(resident_id.clone()).await?;
            }
        }

        let handle = self.open_or_create(&piece.info).await?;
        let complete = {
            let mut file = handle.lock().await;
            file.write_piece(piece.index, &piece.payload).await?
        };

        self.resident.lock().insert(path.clone(), incoming_id.clone());

        if complete {
            if !piece.info.never_expires() {
                let abs = path.visible_path(&self.root);
                self.deletion_queue
                    .schedule(abs, Duration::from_secs(piece.info.ttl_secs.max(0) as u64));
            }
            // No `ArchiveEvent` here: a piece delivered over the wire is
            // already broadcast by the peer layer (`piece_receiver_task`),
            // which excludes the delivering peer from the notice. Emitting
            // one here too would double-announce and re-notify the origin.
        }
        Ok(complete)
    }

    async fn open_or_create(&self, info: &FileInfo) -> Result<Arc<Mutex<DiskFile>>, Error> {
        if let Some(existing) = self.cache.get(&info.id).await {
            return Ok(existing);
        }
        let hidden = info.id.path.hidden_path(&self.root);
        let visible = info.id.path.visible_path(&self.root);

        let file = open_with_retry(&self.cache, || async {
            if tokio::fs::try_exists(&hidden).await.unwrap_or(false) {
                DiskFile::reopen_partial(info.clone(), hidden.clone(), visible.clone()).await
            } else {
                DiskFile::create_partial(info.clone(), hidden.clone(), visible.clone()).await
            }
        })
        .await?;

        let handle = Arc::new(Mutex::new(file));
        if let Some((evicted_id, evicted)) = self.cache.insert(info.id.clone(), handle.clone()).await {
            // Eviction only closes the handle; the disk state stays exactly
            // as it is (complete or partial-with-bitmap) until reopened.
            debug!(?evicted_id, "evicted least-recently-used disk file handle");
            drop(evicted);
        }
        Ok(handle)
    }

    /// `getPiece(PieceSpec) -> Piece | absent`.
    pub async fn get_piece(&self, spec: &PieceSpec) -> Result<Option<Piece>, Error> {
        let resident_id = self.resident.lock().get(&spec.info.id.path).cloned();
        let Some(resident_id) = resident_id else {
            return Ok(None);
        };
        if resident_id != spec.info.id {
            return Ok(None);
        }
        if let Some(handle) = self.cache.get(&spec.info.id).await {
            let file = handle.lock().await;
            if !spec.info.valid_index(spec.index) {
                return Ok(None);
            }
            if file.is_complete() {
                let abs = spec.info.id.path.visible_path(&self.root);
                let offset = spec.info.piece_offset(spec.index);
                let len = spec.info.piece_len(spec.index);
                let payload = read_range(&abs, offset, len).await?;
                return Ok(Some(Piece { info: spec.info.clone(), index: spec.index, payload }));
            }
            if let Some(have) = file.have_pieces() {
                if !have.is_set(spec.index) {
                    return Ok(None);
                }
            } else {
                return Ok(None);
            }
            let abs = spec.info.id.path.hidden_path(&self.root);
            let offset = spec.info.piece_offset(spec.index);
            let len = spec.info.piece_len(spec.index);
            let payload = read_range(&abs, offset, len).await?;
            return Ok(Some(Piece { info: spec.info.clone(), index: spec.index, payload }));
        }
        // Resident but not presently open (complete, evicted from cache):
        // the file is on the visible path; read directly.
        let abs = spec.info.id.path.visible_path(&self.root);
        let exists = tokio::fs::try_exists(&abs).await.unwrap_or(false);
        if !spec.info.valid_index(spec.index) || !exists {
            return Ok(None);
        }
        let offset = spec.info.piece_offset(spec.index);
        let len = spec.info.piece_len(spec.index);
        let payload = read_range(&abs, offset, len).await?;
        Ok(Some(Piece { info: spec.info.clone(), index: spec.index, payload }))
    }

    /// `exists(PieceSpec)`: true if this exact piece of this exact file
    /// version is already held (complete file, or that bit set in a
    /// partial file).
    pub async fn exists_spec(&self, spec: &PieceSpec) -> bool {
        let resident_id = self.resident.lock().get(&spec.info.id.path).cloned();
        let Some(resident_id) = resident_id else { return false };
        if resident_id != spec.info.id {
            return false;
        }
        if let Some(handle) = self.cache.get(&spec.info.id).await {
            let file = handle.lock().await;
            if file.is_complete() {
                return true;
            }
            return file.have_pieces().map(|b| b.is_set(spec.index)).unwrap_or(false);
        }
        // Not cached: resident and not partial means it was already materialized.
        true
    }

    /// Saves a whole object directly as a complete, visible file (used for
    /// administrative snapshots like the distributed tracker topology).
    pub async fn save(self: &Arc<Self>, path: ArchivePath, bytes: &[u8]) -> Result<FileInfo, Error> {
        let abs = path.visible_path(&self.root);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io { path: parent.to_path_buf(), source: e })?;
        }
        tokio::fs::write(&abs, bytes)
            .await
            .map_err(|e| Error::Io { path: abs.clone(), source: e })?;
        let ttl = if path.is_admin() { -1 } else { 0 };
        let id = FileId::new(path.clone(), ArchiveTime::now());
        let info = FileInfo::new(id.clone(), bytes.len() as u64, ttl);
        self.resident.lock().insert(path, id);
        let _ = self.events.send(ArchiveEvent::NewData(FilePieceSpecs::all_pieces(info.clone())));
        Ok(info)
    }

    /// Writes `bytes` to the hidden staging copy of `path` without
    /// materializing it -- used for intermediate administrative state that
    /// should not be distributed until `reveal`ed.
    pub async fn hide(&self, path: &ArchivePath, bytes: &[u8]) -> Result<(), Error> {
        let abs = path.hidden_path(&self.root);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io { path: parent.to_path_buf(), source: e })?;
        }
        tokio::fs::write(&abs, bytes)
            .await
            .map_err(|e| Error::Io { path: abs, source: e })
    }

    /// Promotes a previously `hide`n path to visible, as a complete file.
    pub async fn reveal(self: &Arc<Self>, path: ArchivePath) -> Result<FileInfo, Error> {
        let hidden = path.hidden_path(&self.root);
        let bytes = tokio::fs::read(&hidden)
            .await
            .map_err(|e| Error::Io { path: hidden.clone(), source: e })?;
        let info = self.save(path, &bytes).await?;
        let _ = tokio::fs::remove_file(&hidden).await;
        Ok(info)
    }

    /// `remove(FileId)`: deletes disk state for exactly this version,
    /// clearing it from the resident index if it is still the current one.
    pub async fn remove(self: &Arc<Self>, id: FileId) -> Result<(), Error> {
        if let Some(handle) = self.cache.remove(&id).await {
            let mut file = handle.lock().await;
            file.remove().await?;
        } else {
            // Not cached: try both possible locations directly.
            let _ = tokio::fs::remove_file(id.path.visible_path(&self.root)).await;
            let _ = tokio::fs::remove_file(id.path.hidden_path(&self.root)).await;
        }
        let mut resident = self.resident.lock();
        if resident.get(&id.path) == Some(&id) {
            resident.remove(&id.path);
        }
        drop(resident);
        let _ = self.events.send(ArchiveEvent::Removed(id));
        Ok(())
    }

    /// `walk(Filter, visitor)`: every resident `FileId` matching `filter`.
    pub fn walk(&self, filter: &crate::model::Filter) -> Vec<FileId> {
        self.resident
            .lock()
            .iter()
            .filter(|(path, _)| filter.matches(path))
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// `getDistributedTrackerFiles(trackerAddr)`: the most recent cached
    /// topology snapshot for `tracker_addr`, if one has been distributed
    /// through the archive's admin subtree.
    pub async fn get_distributed_tracker_files(&self, tracker_addr: SocketAddr) -> Option<Vec<u8>> {
        let path = tracker_snapshot_path(tracker_addr);
        let abs = path.visible_path(&self.root);
        tokio::fs::read(&abs).await.ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// `<root>/SRUTH/trackers/<host>_<port>.bin`, the infinite-TTL admin path a
/// tracker topology snapshot is redistributed under.
pub fn tracker_snapshot_path(tracker_addr: SocketAddr) -> ArchivePath {
    let name = format!("{}_{}.bin", tracker_addr.ip(), tracker_addr.port());
    ArchivePath::new(format!("{ADMIN_DIR}/trackers/{name}")).expect("well-formed admin path")
}

async fn read_range(path: &std::path::Path, offset: u64, len: u64) -> Result<bytes::Bytes, Error> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Io { path: path.to_path_buf(), source: e })?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| Error::Io { path: path.to_path_buf(), source: e })?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| Error::Io { path: path.to_path_buf(), source: e })?;
    Ok(buf.into())
}

async fn purge_hidden_except_journal(hidden: &std::path::Path) -> Result<(), Error> {
    let mut entries = tokio::fs::read_dir(hidden)
        .await
        .map_err(|e| Error::Io { path: hidden.to_path_buf(), source: e })?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Io { path: hidden.to_path_buf(), source: e })?
    {
        if entry.file_name() == "fileDeletionQueue" {
            continue;
        }
        let path = entry.path();
        let meta = entry
            .metadata()
            .await
            .map_err(|e| Error::Io { path: path.clone(), source: e })?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(e) = result {
            warn!(?path, error = %e, "failed to purge stale hidden archive state");
        }
    }
    debug!("purged .sruth except the deletion journal");
    info!("archive hidden directory ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArchivePath, Filter, PIECE_SIZE};
    use tempfile::tempdir;

    fn info(path: &str, size: u64) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::new(path).unwrap(), ArchiveTime::now()),
            size,
            -1,
        )
    }

    #[tokio::test]
    async fn put_piece_materializes_and_get_piece_reads_it_back() {
        let dir = tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        let info = info("a/b.txt", 10);
        let payload: bytes::Bytes = vec![42u8; 10].into();
        let complete = archive
            .put_piece(Piece { info: info.clone(), index: 0, payload: payload.clone() })
            .await
            .unwrap();
        assert!(complete);

        let spec = PieceSpec::new(info.clone(), 0);
        assert!(archive.exists_spec(&spec).await);
        let piece = archive.get_piece(&spec).await.unwrap().unwrap();
        assert_eq!(piece.payload, payload);
    }

    #[tokio::test]
    async fn older_version_is_discarded() {
        let dir = tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        let path = ArchivePath::new("a/b.txt").unwrap();
        let newer = FileInfo::new(FileId::new(path.clone(), ArchiveTime::from_millis(200)), 1, -1);
        let older = FileInfo::new(FileId::new(path.clone(), ArchiveTime::from_millis(100)), 1, -1);

        archive
            .put_piece(Piece { info: newer.clone(), index: 0, payload: vec![1].into() })
            .await
            .unwrap();
        let complete = archive
            .put_piece(Piece { info: older, index: 0, payload: vec![2].into() })
            .await
            .unwrap();
        assert!(!complete);

        let spec = PieceSpec::new(newer, 0);
        let piece = archive.get_piece(&spec).await.unwrap().unwrap();
        assert_eq!(piece.payload, bytes::Bytes::from(vec![1]));
    }

    #[tokio::test]
    async fn newer_version_replaces_resident() {
        let dir = tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        let path = ArchivePath::new("a/b.txt").unwrap();
        let t1 = FileInfo::new(FileId::new(path.clone(), ArchiveTime::from_millis(100)), 1, -1);
        let t2 = FileInfo::new(FileId::new(path.clone(), ArchiveTime::from_millis(200)), 1, -1);

        archive
            .put_piece(Piece { info: t1.clone(), index: 0, payload: vec![1].into() })
            .await
            .unwrap();
        archive
            .put_piece(Piece { info: t2.clone(), index: 0, payload: vec![2].into() })
            .await
            .unwrap();

        let old_spec = PieceSpec::new(t1, 0);
        assert!(archive.get_piece(&old_spec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn walk_filters_by_path() {
        let dir = tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        archive
            .put_piece(Piece { info: info("a/x.txt", 1), index: 0, payload: vec![1].into() })
            .await
            .unwrap();
        archive
            .put_piece(Piece { info: info("b/y.txt", 1), index: 0, payload: vec![2].into() })
            .await
            .unwrap();
        let found = archive.walk(&Filter::Prefix("a/".to_string()));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path.as_str(), "a/x.txt");
    }

    #[tokio::test]
    async fn multi_piece_file_stays_partial_until_last_piece() {
        let dir = tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        let info = info("a/big.bin", PIECE_SIZE + 10);
        let complete = archive
            .put_piece(Piece { info: info.clone(), index: 0, payload: vec![1u8; PIECE_SIZE as usize].into() })
            .await
            .unwrap();
        assert!(!complete);
        assert!(!archive.exists_spec(&PieceSpec::new(info.clone(), 1)).await);
        let complete = archive
            .put_piece(Piece { info: info.clone(), index: 1, payload: vec![2u8; 10].into() })
            .await
            .unwrap();
        assert!(complete);
    }
}
