//! `ClearingHouse`: the node-wide broker reconciling local archive state,
//! outstanding requests, and peer offerings. Peers hold a non-owning
//! `Arc<ClearingHouse>`; the `ClearingHouse` holds only a by-id table of
//! registered peers, purged on peer termination (spec.md §9, cyclic
//! reference note).

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::archive::{Archive, ArchiveEvent};
use crate::model::{ArchivePath, FileId, FilePieceSpecs, PieceSpec, PieceSpecSet, Predicate};
use crate::wire::Message;

pub type PeerId = u64;

struct RegisteredPeer {
    remote_predicate: Mutex<Predicate>,
    notice_tx: mpsc::Sender<Message>,
}

/// Key identifying one outstanding request: a specific piece of a specific
/// file version. `PieceSpec` itself embeds the full `FileInfo` (not just
/// the id), so the outstanding-request table keys on the narrower
/// `(FileId, index)` pair instead.
type RequestKey = (FileId, u32);

pub struct ClearingHouse {
    archive: Arc<Archive>,
    /// Read on every handshake and every inbound notice, written only when
    /// a local file completes and its matching filter narrows -- an
    /// `ArcSwap` avoids taking a lock on the hot read path (mirrors the
    /// teacher's `ArcSwapOption` use for infrequently-updated,
    /// frequently-read torrent state).
    local_predicate: ArcSwap<Predicate>,
    /// Exactly one peer is recorded as responsible for an outstanding
    /// request, or the request has been satisfied and removed (P3).
    outstanding: DashMap<RequestKey, PeerId>,
    peers: DashMap<PeerId, RegisteredPeer>,
}

impl ClearingHouse {
    pub fn new(archive: Arc<Archive>, local_predicate: Predicate) -> Arc<Self> {
        Arc::new(Self {
            archive,
            local_predicate: ArcSwap::from_pointee(local_predicate),
            outstanding: DashMap::new(),
            peers: DashMap::new(),
        })
    }

    pub fn local_predicate(&self) -> Predicate {
        (**self.local_predicate.load()).clone()
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn register_peer(&self, id: PeerId, remote_predicate: Predicate, notice_tx: mpsc::Sender<Message>) {
        self.peers.insert(
            id,
            RegisteredPeer { remote_predicate: Mutex::new(remote_predicate), notice_tx },
        );
    }

    /// Peer termination: the ClearingHouse reclaims outstanding requests by
    /// simply dropping the bookkeeping entry -- another Notice for the same
    /// piece (from this or another peer) is free to re-request it.
    pub fn unregister_peer(&self, id: PeerId) {
        self.peers.remove(&id);
        self.outstanding.retain(|_, responsible| *responsible != id);
        debug!(peer = id, "peer unregistered, outstanding requests reclaimed");
    }

    /// Inbound Notice processing (spec.md §4.3): for each advertised piece,
    /// if it matches the local predicate, isn't already held, and has no
    /// outstanding request, it becomes owed to `from` and is returned for
    /// the caller to enqueue as a Request.
    pub async fn on_inbound_notice(&self, from: PeerId, specs: &PieceSpecSet) -> Vec<PieceSpec> {
        // A source's predicate is `Predicate::nothing()`: it serves but
        // never requests (spec.md §9 open question). Short-circuit here so
        // no outstanding-request bookkeeping is created for a source.
        let predicate = self.local_predicate.load();
        if predicate.is_nothing() {
            return Vec::new();
        }
        let mut to_request = Vec::new();
        for spec in specs.iter_specs() {
            if !predicate.matches(&spec.info.id.path) {
                continue;
            }
            if self.archive.exists_spec(&spec).await {
                continue;
            }
            let key = (spec.info.id.clone(), spec.index);
            let mut newly_claimed = false;
            self.outstanding.entry(key).or_insert_with(|| {
                newly_claimed = true;
                from
            });
            if newly_claimed {
                to_request.push(spec);
            }
        }
        to_request
    }

    /// Cancels the outstanding-request bookkeeping for a piece that has
    /// just arrived (from anyone). No cancellation is sent on the wire;
    /// stale duplicate requests simply produce no piece at the remote.
    pub fn on_piece_delivered(&self, file_id: &FileId, index: u32) {
        self.outstanding.remove(&(file_id.clone(), index));
    }

    pub fn mark_local_satisfied(&self, path: &ArchivePath) {
        let mut updated = self.local_predicate();
        updated.mark_satisfied(path);
        self.local_predicate.store(Arc::new(updated));
    }

    /// Routes newly-available data to every registered peer whose remote
    /// predicate matches, except `origin` (the peer it arrived from, if
    /// any).
    pub async fn broadcast_new_data(&self, specs: FilePieceSpecs, origin: Option<PeerId>) {
        let targets: Vec<mpsc::Sender<Message>> = self
            .peers
            .iter()
            .filter(|entry| Some(*entry.key()) != origin)
            .filter(|entry| entry.value().remote_predicate.lock().matches(&specs.info.id.path))
            .map(|entry| entry.value().notice_tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(Message::AddendumSpec(specs.clone())).await;
        }
    }

    pub async fn broadcast_removal(&self, file_id: FileId, origin: Option<PeerId>) {
        let targets: Vec<mpsc::Sender<Message>> = self
            .peers
            .iter()
            .filter(|entry| Some(*entry.key()) != origin)
            .map(|entry| entry.value().notice_tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(Message::Removal(file_id.clone())).await;
        }
    }

    /// Subscribes to the archive's event stream and routes watcher- or
    /// direct-save-originated changes to every interested peer (spec.md
    /// §4.3: "On archive-originated 'new file' ... enqueue Notice to all
    /// peers whose Predicate matches"). Peer-delivered completions instead
    /// call `broadcast_new_data` directly from `piece_receiver_task`, tagged
    /// with their origin so the delivering peer isn't echoed its own data.
    pub fn spawn_archive_event_router(self: &Arc<Self>, cancel: CancellationToken) {
        let mut events = self.archive.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ArchiveEvent::NewData(specs)) => this.broadcast_new_data(specs, None).await,
                    Ok(ArchiveEvent::Removed(file_id)) => this.broadcast_removal(file_id, None).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "archive event router lagged, some notices were dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
