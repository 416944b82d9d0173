//! `DelayedPathActionQueue`: a persistent priority queue of scheduled
//! deletions that survives restart, journaled as newline-delimited JSON
//! next to the data it describes.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Entry {
    due_unix_secs: u64,
    path: PathBuf,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_unix_secs.cmp(&other.due_unix_secs)
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct DelayedPathActionQueue {
    journal_path: PathBuf,
    root: PathBuf,
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
}

impl DelayedPathActionQueue {
    /// Loads any previously persisted schedule from `journal_path` under
    /// `root`. `.sruth` is purged at startup except for this journal.
    pub async fn load(root: PathBuf, journal_path: PathBuf) -> Self {
        let entries = match tokio::fs::read_to_string(&journal_path).await {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| serde_json::from_str::<Entry>(line).ok())
                .collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        info!(count = entries.len(), "loaded deletion queue journal");
        Self {
            journal_path,
            root,
            heap: Mutex::new(entries.into_iter().map(Reverse).collect()),
            notify: Notify::new(),
        }
    }

    /// Schedules `path` for deletion `ttl` from now; a TTL of `None` means
    /// the caller already checked `never_expires()` and should not call
    /// this at all.
    pub fn schedule(&self, path: PathBuf, ttl: Duration) {
        let due = now_unix_secs() + ttl.as_secs();
        let entry = Entry {
            due_unix_secs: due,
            path,
        };
        {
            let mut heap = self.heap.lock();
            heap.push(Reverse(entry));
        }
        self.persist();
        self.notify.notify_one();
    }

    fn persist(&self) {
        let heap = self.heap.lock();
        let lines: Vec<String> = heap
            .iter()
            .filter_map(|Reverse(e)| serde_json::to_string(e).ok())
            .collect();
        drop(heap);
        if let Some(parent) = self.journal_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.journal_path, lines.join("\n")) {
            warn!(error = %e, "failed to persist deletion queue journal");
        }
    }

    fn pop_due(&self) -> Option<PathBuf> {
        let mut heap = self.heap.lock();
        let now = now_unix_secs();
        match heap.peek() {
            Some(Reverse(e)) if e.due_unix_secs <= now => heap.pop().map(|Reverse(e)| e.path),
            _ => None,
        }
    }

    fn next_due_in(&self) -> Option<Duration> {
        let heap = self.heap.lock();
        heap.peek().map(|Reverse(e)| {
            let now = now_unix_secs();
            Duration::from_secs(e.due_unix_secs.saturating_sub(now))
        })
    }

    /// Runs forever, deleting paths as they come due and then recursively
    /// pruning now-empty ancestor directories up to (but not including)
    /// `root`.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        loop {
            if let Some(path) = self.pop_due() {
                self.persist();
                if let Err(e) = delete_and_prune(&path, &self.root).await {
                    warn!(?path, error = %e, "failed to delete expired file");
                } else {
                    debug!(?path, "expired file removed");
                }
                continue;
            }
            let sleep = self
                .next_due_in()
                .unwrap_or(Duration::from_secs(3600));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

async fn delete_and_prune(path: &Path, root: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root {
            break;
        }
        match tokio::fs::read_dir(d).await {
            Ok(mut entries) => {
                if entries.next_entry().await?.is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
        if tokio::fs::remove_dir(d).await.is_err() {
            break;
        }
        dir = d.parent();
    }
    Ok(())
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn schedules_and_persists_across_reload() {
        let dir = tempdir().unwrap();
        let journal = dir.path().join(".sruth/fileDeletionQueue");
        let target = dir.path().join("a/b.txt");
        tokio::fs::create_dir_all(target.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&target, b"x").await.unwrap();

        let q = DelayedPathActionQueue::load(dir.path().to_path_buf(), journal.clone()).await;
        q.schedule(target.clone(), Duration::from_secs(0));
        assert!(q.pop_due().is_some());

        // A second schedule should persist and be recoverable after reload.
        tokio::fs::write(&target, b"x").await.unwrap();
        q.schedule(target.clone(), Duration::from_secs(1000));
        let reloaded =
            DelayedPathActionQueue::load(dir.path().to_path_buf(), journal.clone()).await;
        assert!(reloaded.next_due_in().is_some());
    }

    #[tokio::test]
    async fn prunes_empty_ancestors_up_to_root() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c.txt");
        tokio::fs::create_dir_all(target.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&target, b"x").await.unwrap();
        delete_and_prune(&target, dir.path()).await.unwrap();
        assert!(!target.exists());
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().exists());
    }
}
