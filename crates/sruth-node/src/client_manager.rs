//! `ClientManager` (sink nodes only): periodically queries the
//! `TrackerProxy` for a `FilterServerMap`, ranks candidate servers,
//! maintains a bounded number of concurrent outbound `Peer`s, and reports
//! unreachable remotes back to the tracker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::clearinghouse::ClearingHouse;
use crate::connection::Connection;
use crate::model::Filter;
use crate::peer;
use crate::tracker_proxy::TrackerProxy;

/// How often a `ClientManager` re-polls the tracker for fresh topology.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct ClientManager {
    tracker: Arc<TrackerProxy>,
    filter: Filter,
    local_server: SocketAddr,
    max_outbound_peers: usize,
    clearinghouse: Arc<ClearingHouse>,
    archive: Arc<Archive>,
    read_timeout: Duration,
    active: DashSet<SocketAddr>,
    /// Starts at `1 << 32` so outbound peer ids never collide with the
    /// `Server`'s own inbound peer id counter within one node.
    next_peer_id: AtomicU64,
}

impl ClientManager {
    pub fn new(
        tracker: Arc<TrackerProxy>,
        filter: Filter,
        local_server: SocketAddr,
        max_outbound_peers: usize,
        clearinghouse: Arc<ClearingHouse>,
        archive: Arc<Archive>,
        read_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            filter,
            local_server,
            max_outbound_peers,
            clearinghouse,
            archive,
            read_timeout,
            active: DashSet::new(),
            next_peer_id: AtomicU64::new(1 << 32),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if let Err(e) = self.poll_once(&cancel).await {
                warn!(error = %e, "client manager poll failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered_poll_interval()) => {}
            }
        }
    }

    async fn poll_once(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), crate::error::Error> {
        let map = self.tracker.get_network(false, &self.filter, self.local_server).await?;
        let wire_filter = to_wire_filter(&self.filter);
        let candidates = rank(map.servers_for(&wire_filter));
        debug!(count = candidates.len(), "tracker returned candidate servers");

        for addr in candidates {
            if self.active.len() >= self.max_outbound_peers {
                break;
            }
            if addr == self.local_server || self.active.contains(&addr) {
                continue;
            }
            self.spawn_outbound(addr, cancel.child_token());
        }
        Ok(())
    }

    /// Outbound peers are spawned independently of the polling loop (so a
    /// slow connect doesn't stall discovery of other candidates) but tied
    /// to a child of the node's own cancellation token, so node shutdown
    /// still tears every one of them down.
    fn spawn_outbound(self: &Arc<Self>, addr: SocketAddr, peer_cancel: CancellationToken) {
        self.active.insert(addr);
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.connect_and_run(addr, peer_cancel).await;
            this.active.remove(&addr);
            if let Err(e) = result {
                warn!(%addr, error = %e, "outbound peer failed, reporting offline to tracker");
                if let Err(e) = this.tracker.report_offline(addr).await {
                    warn!(error = %e, "failed to report offline peer");
                }
            }
        });
    }

    async fn connect_and_run(
        self: &Arc<Self>,
        addr: SocketAddr,
        peer_cancel: CancellationToken,
    ) -> Result<(), crate::error::Error> {
        let connection = Connection::connect(addr).await?;
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        info!(%addr, "outbound peer connected");
        peer::run(
            id,
            addr,
            connection,
            self.clearinghouse.clone(),
            self.archive.clone(),
            self.read_timeout,
            peer_cancel,
        )
        .await
    }
}

fn to_wire_filter(filter: &Filter) -> sruth_tracker::Filter {
    match filter {
        Filter::Everything => sruth_tracker::Filter::Everything,
        Filter::Nothing => sruth_tracker::Filter::Nothing,
        Filter::Prefix(p) => sruth_tracker::Filter::Prefix(p.clone()),
        Filter::Regex(r) => sruth_tracker::Filter::Regex(r.clone()),
    }
}

/// Ranks candidate servers. The tracker does its own matchmaking (spec.md
/// §1, out of scope); this ranking is just a stable, duplicate-free order
/// over what it returned.
fn rank(servers: &[SocketAddr]) -> Vec<SocketAddr> {
    use itertools::Itertools;
    servers.iter().copied().unique().collect()
}

/// `POLL_INTERVAL` plus up to 10% random jitter, so that many sink nodes
/// started at once don't all hit the tracker in lockstep.
fn jittered_poll_interval() -> Duration {
    use rand::Rng;
    let jitter_ms = rand::rng().random_range(0..POLL_INTERVAL.as_millis() as u64 / 10);
    POLL_INTERVAL + Duration::from_millis(jitter_ms)
}
