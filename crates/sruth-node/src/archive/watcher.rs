//! Recursive directory watcher: registers every non-hidden directory under
//! the archive root with the OS file-notification service and turns
//! CREATE/DELETE events into `ArchiveEvent`s. `notify`'s watcher is
//! callback-based (not async); the callback hands events to a bounded
//! std channel that a blocking task forwards into the async world.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use notify::{EventKind, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::model::path::HIDDEN_DIR;

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Created(PathBuf),
    Removed(PathBuf),
    /// The watcher lost events (OS buffer overflow); everything under
    /// `root` should be rescanned to restore completeness (REDESIGN FLAGS).
    Rescan,
}

/// Spawns the watcher on a blocking thread and forwards translated events
/// into `tx` until `cancel` fires or the watcher errors out.
pub fn spawn(root: PathBuf, tx: mpsc::UnboundedSender<WatchEvent>, cancel: CancellationToken) {
    std::thread::spawn(move || run(root, tx, cancel));
}

fn run(root: PathBuf, tx: mpsc::UnboundedSender<WatchEvent>, cancel: CancellationToken) {
    let (raw_tx, raw_rx) = std_mpsc::channel();
    let mut watcher = match notify::recommended_watcher(move |res| {
        let _ = raw_tx.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to start archive watcher");
            return;
        }
    };

    let mut watched: HashSet<PathBuf> = HashSet::new();
    register_tree(&mut watcher, &root, &root, &mut watched);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        match raw_rx.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(Ok(event)) => handle_event(&mut watcher, &root, &event, &mut watched, &tx),
            Ok(Err(e)) => {
                warn!(error = %e, "archive watcher error, rescanning");
                let _ = tx.send(WatchEvent::Rescan);
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn handle_event(
    watcher: &mut notify::RecommendedWatcher,
    root: &Path,
    event: &notify::Event,
    watched: &mut HashSet<PathBuf>,
    tx: &mpsc::UnboundedSender<WatchEvent>,
) {
    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                if is_hidden(root, path) {
                    continue;
                }
                if path.is_dir() {
                    register_tree(watcher, root, path, watched);
                    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                        if entry.file_type().is_file() {
                            let _ = tx.send(WatchEvent::Created(entry.path().to_path_buf()));
                        }
                    }
                } else {
                    let _ = tx.send(WatchEvent::Created(path.clone()));
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if is_hidden(root, path) {
                    continue;
                }
                watched.remove(path);
                let _ = tx.send(WatchEvent::Removed(path.clone()));
            }
        }
        EventKind::Other => {
            debug!("archive watcher overflow, requesting rescan");
            let _ = tx.send(WatchEvent::Rescan);
        }
        _ => {}
    }
}

fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .map(|c| c.as_os_str() == HIDDEN_DIR)
        .unwrap_or(false)
}

fn register_tree(
    watcher: &mut notify::RecommendedWatcher,
    root: &Path,
    start: &Path,
    watched: &mut HashSet<PathBuf>,
) {
    for entry in WalkDir::new(start).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        if is_hidden(root, path) || watched.contains(path) {
            continue;
        }
        if watcher.watch(path, RecursiveMode::NonRecursive).is_ok() {
            watched.insert(path.to_path_buf());
        }
    }
}
