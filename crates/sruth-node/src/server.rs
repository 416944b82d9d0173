//! `Server`: binds `SOCKET_COUNT` consecutive ports, accepts inbound
//! sockets, matches them into triples by remote address, and spawns a
//! `Peer` per completed triple.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::Archive;
use crate::clearinghouse::ClearingHouse;
use crate::config::SOCKET_COUNT;
use crate::error::Error;
use crate::peer;

pub struct Server {
    pub ports: [u16; SOCKET_COUNT as usize],
}

#[derive(Default)]
struct PendingTriple {
    request: Option<TcpStream>,
    notice: Option<TcpStream>,
    data: Option<TcpStream>,
}

impl PendingTriple {
    fn is_complete(&self) -> bool {
        self.request.is_some() && self.notice.is_some() && self.data.is_some()
    }

    fn take(self) -> Option<(TcpStream, TcpStream, TcpStream)> {
        Some((self.request?, self.notice?, self.data?))
    }
}

impl Server {
    /// Binds the first free set of `SOCKET_COUNT` consecutive ports in
    /// `[start_port, start_port + range)`.
    pub async fn bind(start_port: u16, range: u16) -> Result<(Self, Vec<TcpListener>), Error> {
        'outer: for base in start_port..start_port.saturating_add(range.max(1)) {
            let mut listeners = Vec::with_capacity(SOCKET_COUNT as usize);
            for offset in 0..SOCKET_COUNT {
                let port = base.wrapping_add(offset);
                match TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(l) => listeners.push(l),
                    Err(_) => continue 'outer,
                }
            }
            let ports: Vec<u16> = listeners
                .iter()
                .map(|l| l.local_addr().map(|a| a.port()).unwrap_or(base))
                .collect();
            info!(?ports, "server bound");
            return Ok((
                Server { ports: ports.try_into().map_err(|_| Error::NoPortAvailable)? },
                listeners,
            ));
        }
        Err(Error::NoPortAvailable)
    }

    /// Runs the accept loop until `cancel` fires: matches inbound sockets
    /// by remote IP into triples (one per socket index), completing a
    /// `Connection` -- and spawning a `Peer` for it -- only once all three
    /// are present.
    pub async fn run_accept_loop(
        listeners: Vec<TcpListener>,
        clearinghouse: Arc<ClearingHouse>,
        archive: Arc<Archive>,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) {
        assert_eq!(listeners.len(), SOCKET_COUNT as usize);
        let mut pending: HashMap<IpAddr, PendingTriple> = HashMap::new();
        let next_peer_id = AtomicU64::new(1);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                result = accept_any(&listeners) => result,
            };
            let (socket_index, stream, remote) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let entry = pending.entry(remote.ip()).or_default();
            match socket_index {
                0 => entry.request = Some(stream),
                1 => entry.notice = Some(stream),
                2 => entry.data = Some(stream),
                _ => unreachable!(),
            }
            if entry.is_complete() {
                let entry = pending.remove(&remote.ip()).expect("just matched");
                let Some((request, notice, data)) = entry.take() else { continue };
                let peer_addr = SocketAddr::new(remote.ip(), request.peer_addr().map(|a| a.port()).unwrap_or(remote.port()));
                let connection = crate::connection::Connection::from_triple(peer_addr, request, notice, data);
                let id = next_peer_id.fetch_add(1, Ordering::Relaxed);
                let clearinghouse = clearinghouse.clone();
                let archive = archive.clone();
                let peer_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) =
                        peer::run(id, peer_addr, connection, clearinghouse, archive, read_timeout, peer_cancel).await
                    {
                        warn!(?peer_addr, error = %e, "inbound peer ended with error");
                    }
                });
            }
        }
    }
}

async fn accept_any(listeners: &[TcpListener]) -> std::io::Result<(usize, TcpStream, SocketAddr)> {
    let (result, index, _) = futures::future::select_all(listeners.iter().map(|l| Box::pin(l.accept()))).await;
    let (stream, addr) = result?;
    Ok((index, stream, addr))
}
