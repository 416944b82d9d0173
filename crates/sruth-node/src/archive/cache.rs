//! Active-file LRU cache bounding simultaneously open `DiskFile`s.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::model::FileId;

use super::disk_file::DiskFile;

pub struct FileCache {
    inner: Mutex<LruCache<FileId, Arc<Mutex<DiskFile>>>>,
}

impl FileCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn get(&self, id: &FileId) -> Option<Arc<Mutex<DiskFile>>> {
        let mut guard = self.inner.lock().await;
        guard.get(id).cloned()
    }

    /// Inserts `file`, evicting the least-recently-used entry if the cache
    /// is at capacity. Returns the entry that was evicted, if any, so the
    /// caller can close it.
    pub async fn insert(
        &self,
        id: FileId,
        file: Arc<Mutex<DiskFile>>,
    ) -> Option<(FileId, Arc<Mutex<DiskFile>>)> {
        let mut guard = self.inner.lock().await;
        guard.push(id, file)
    }

    pub async fn remove(&self, id: &FileId) -> Option<Arc<Mutex<DiskFile>>> {
        let mut guard = self.inner.lock().await;
        guard.pop(id)
    }

    /// Evicts the single least-recently-used entry, used both for normal
    /// capacity-triggered eviction and for "too many open files" retries:
    /// an open-file failure retries once after evicting LRU; if eviction
    /// yields nothing, the error propagates.
    pub async fn evict_lru(&self) -> Option<(FileId, Arc<Mutex<DiskFile>>)> {
        let mut guard = self.inner.lock().await;
        guard.pop_lru()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Retries `open` once after evicting the LRU entry from `cache` if the
/// first attempt fails with a "too many open files" style error.
pub async fn open_with_retry<F, Fut, T>(cache: &FileCache, open: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    match open().await {
        Ok(v) => Ok(v),
        Err(Error::Io { source, .. }) if is_too_many_open_files(&source) => {
            if cache.evict_lru().await.is_none() {
                return Err(Error::FileCacheExhausted);
            }
            open().await
        }
        Err(e) => Err(e),
    }
}

fn is_too_many_open_files(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(24) | Some(23))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::disk_file::DiskFile;
    use crate::model::{ArchivePath, ArchiveTime, FileId, FileInfo};
    use tempfile::tempdir;

    fn id() -> FileId {
        FileId::new(ArchivePath::new("a/b").unwrap(), ArchiveTime::from_millis(1))
    }

    #[tokio::test]
    async fn respects_capacity_bound() {
        let cache = FileCache::new(1);
        let dir = tempdir().unwrap();
        let info = FileInfo::new(id(), 4, -1);
        let f1 = DiskFile::create_partial(
            info.clone(),
            dir.path().join("h1"),
            dir.path().join("v1"),
        )
        .await
        .unwrap();
        let evicted = cache
            .insert(id(), Arc::new(Mutex::new(f1)))
            .await;
        assert!(evicted.is_none());

        let mut other_id = id();
        other_id.time = ArchiveTime::from_millis(2);
        let f2 = DiskFile::create_partial(
            FileInfo::new(other_id.clone(), 4, -1),
            dir.path().join("h2"),
            dir.path().join("v2"),
        )
        .await
        .unwrap();
        let evicted = cache.insert(other_id, Arc::new(Mutex::new(f2))).await;
        assert!(evicted.is_some());
        assert_eq!(cache.len().await, 1);
    }
}
