//! `TrackerProxy`: a node's soft dependency on a tracker for discovery.
//! Shared by every `ClientManager` in a node. A node can keep exchanging
//! data using a stale topology as long as it knows at least one live peer
//! (spec.md §4.6).

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tracing::warn;

use crate::archive::{tracker_snapshot_path, Archive};
use crate::error::Error;
use crate::model::Filter;

fn to_wire_filter(filter: &Filter) -> sruth_tracker::Filter {
    match filter {
        Filter::Everything => sruth_tracker::Filter::Everything,
        Filter::Nothing => sruth_tracker::Filter::Nothing,
        Filter::Prefix(p) => sruth_tracker::Filter::Prefix(p.clone()),
        Filter::Regex(r) => sruth_tracker::Filter::Regex(r.clone()),
    }
}

pub struct TrackerProxy {
    tracker_addr: SocketAddr,
    archive: Arc<Archive>,
    cached: Mutex<Option<sruth_tracker::FilterServerMap>>,
    report_addr: Mutex<Option<SocketAddr>>,
    closed: std::sync::atomic::AtomicBool,
}

impl TrackerProxy {
    pub fn new(tracker_addr: SocketAddr, archive: Arc<Archive>) -> Self {
        Self {
            tracker_addr,
            archive,
            cached: Mutex::new(None),
            report_addr: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// `getNetwork(refresh, filter, localServer) -> FilterServerMap`.
    pub async fn get_network(
        &self,
        refresh: bool,
        filter: &Filter,
        local_server: SocketAddr,
    ) -> Result<sruth_tracker::FilterServerMap, Error> {
        self.check_open()?;
        if !refresh {
            if let Some(cached) = self.cached.lock().clone() {
                return Ok(cached);
            }
        }
        match self.query_tracker(filter, local_server).await {
            Ok(response) => {
                *self.report_addr.lock() = Some(response.report_addr);
                *self.cached.lock() = Some(response.servers.clone());
                self.persist_snapshot(&response.servers).await;
                Ok(response.servers)
            }
            Err(e) => {
                warn!(error = %e, tracker = %self.tracker_addr, "tracker unreachable, falling back to cached topology");
                self.load_cached_snapshot().await
            }
        }
    }

    async fn query_tracker(
        &self,
        filter: &Filter,
        local_server: SocketAddr,
    ) -> Result<sruth_tracker::TrackerResponse, Error> {
        let mut stream = TcpStream::connect(self.tracker_addr)
            .await
            .map_err(Error::TrackerUnreachable)?;
        let request = sruth_tracker::TrackerRequest {
            filter: to_wire_filter(filter),
            local_server,
        };
        sruth_tracker::write_request(&mut stream, &request)
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;
        sruth_tracker::read_response(&mut stream)
            .await
            .map_err(|e| Error::Decode(e.to_string()))
    }

    async fn persist_snapshot(&self, servers: &sruth_tracker::FilterServerMap) {
        let Ok(bytes) = bincode::serde::encode_to_vec(servers, bincode::config::standard()) else {
            return;
        };
        let path = tracker_snapshot_path(self.tracker_addr);
        if let Err(e) = self.archive.save(path, &bytes).await {
            warn!(error = %e, "failed to persist tracker topology snapshot");
        }
    }

    /// Falls back to the snapshot previously redistributed through the
    /// archive's admin subtree (`getDistributedTrackerFiles`), logging
    /// the resulting staleness.
    async fn load_cached_snapshot(&self) -> Result<sruth_tracker::FilterServerMap, Error> {
        if let Some(cached) = self.cached.lock().clone() {
            return Ok(cached);
        }
        let Some(bytes) = self.archive.get_distributed_tracker_files(self.tracker_addr).await else {
            return Ok(sruth_tracker::FilterServerMap::default());
        };
        let (snapshot, _): (sruth_tracker::FilterServerMap, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| Error::Decode(e.to_string()))?;
        warn!(tracker = %self.tracker_addr, "using stale tracker topology snapshot from the archive");
        *self.cached.lock() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// `reportOffline(addr)`: one-shot, fire-and-forget UDP datagram, no
    /// retry (spec.md §9, open question).
    pub async fn report_offline(&self, offline: SocketAddr) -> Result<(), Error> {
        self.check_open()?;
        let Some(report_addr) = *self.report_addr.lock() else {
            return Ok(());
        };
        let payload = sruth_tracker::encode_offline_report(offline).map_err(|e| Error::Decode(e.to_string()))?;
        let bind_addr: SocketAddr = if report_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse().unwrap();
        let socket = UdpSocket::bind(bind_addr).await.map_err(Error::PeerIo)?;
        // Fire-and-forget: a send error is logged, never retried.
        if let Err(e) = socket.send_to(&payload, report_addr).await {
            warn!(error = %e, %offline, "failed to report offline peer to tracker");
        }
        Ok(())
    }

    /// `close()`: idempotent; a double-close call is an error (spec.md §4.6).
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::InvalidConfig("TrackerProxy already closed".to_string()));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::InvalidConfig("TrackerProxy is closed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn falls_back_to_cache_when_tracker_unreachable() {
        let dir = tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        // Nothing bound at this address: connect fails immediately.
        let dead_tracker: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let proxy = TrackerProxy::new(dead_tracker, archive);
        let map = proxy
            .get_network(true, &Filter::Everything, "127.0.0.1:9000".parse().unwrap())
            .await
            .unwrap();
        assert!(map.entries.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_second_call() {
        let dir = tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        let proxy = TrackerProxy::new("127.0.0.1:1".parse().unwrap(), archive);
        proxy.close().unwrap();
        assert!(proxy.close().is_err());
    }
}
