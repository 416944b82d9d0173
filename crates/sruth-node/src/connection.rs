//! `Connection`: a bundle of exactly `SOCKET_COUNT` TCP sockets between the
//! same two endpoints, one each for the REQUEST, NOTICE and DATA streams.
//! Separating small control messages from bulk piece payloads keeps
//! requests and notices from starving behind a multi-megabyte piece.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::config::SOCKET_COUNT;
use crate::error::Error;

pub struct Connection {
    pub peer_addr: SocketAddr,
    pub request: TcpStream,
    pub notice: TcpStream,
    pub data: TcpStream,
}

impl Connection {
    /// Client-side construction: opens `SOCKET_COUNT` sockets in ascending
    /// port order starting at `addr`'s port, one per stream.
    pub async fn connect(addr: SocketAddr) -> Result<Self, Error> {
        let mut streams = Vec::with_capacity(SOCKET_COUNT as usize);
        for offset in 0..SOCKET_COUNT {
            let target = SocketAddr::new(addr.ip(), addr.port() + offset);
            let stream = TcpStream::connect(target)
                .await
                .map_err(|_| Error::ConnectionFailed(target))?;
            let _ = stream.set_nodelay(true);
            streams.push(stream);
        }
        let mut streams = streams.into_iter();
        Ok(Self {
            peer_addr: addr,
            request: streams.next().expect("request socket"),
            notice: streams.next().expect("notice socket"),
            data: streams.next().expect("data socket"),
        })
    }

    /// Server-side construction from three already-accepted sockets that a
    /// `Server` has matched by remote address (§4.2).
    pub fn from_triple(peer_addr: SocketAddr, request: TcpStream, notice: TcpStream, data: TcpStream) -> Self {
        Self { peer_addr, request, notice, data }
    }

    pub fn split(self) -> ConnectionHalves {
        let (request_rx, request_tx) = self.request.into_split();
        let (notice_rx, notice_tx) = self.notice.into_split();
        let (data_rx, data_tx) = self.data.into_split();
        ConnectionHalves {
            request_rx,
            request_tx,
            notice_rx,
            notice_tx,
            data_rx,
            data_tx,
        }
    }
}

/// The six half-duplex halves a `Peer` drives independently.
pub struct ConnectionHalves {
    pub request_rx: tokio::net::tcp::OwnedReadHalf,
    pub request_tx: tokio::net::tcp::OwnedWriteHalf,
    pub notice_rx: tokio::net::tcp::OwnedReadHalf,
    pub notice_tx: tokio::net::tcp::OwnedWriteHalf,
    pub data_rx: tokio::net::tcp::OwnedReadHalf,
    pub data_tx: tokio::net::tcp::OwnedWriteHalf,
}
