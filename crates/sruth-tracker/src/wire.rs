//! The wire-level request/response types shared between a `TrackerProxy`
//! client and any tracker implementation. This crate fixes the bytes on
//! the wire only; the tracker's own admission/matchmaking policy is an
//! external collaborator (spec.md §1).

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest TCP frame this codec accepts: bounds memory against a
/// misbehaving or malicious tracker.
pub const MAX_FRAME_BYTES: u32 = 1 << 20;

/// Mirrors `sruth_node::model::Filter`'s wire shape without depending on
/// that crate -- the tracker protocol is a standalone wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    Everything,
    Nothing,
    Prefix(String),
    Regex(String),
}

/// `getNetwork` request: a filter plus the requester's own server address,
/// so the tracker can register it as a candidate for others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerRequest {
    pub filter: Filter,
    pub local_server: SocketAddr,
}

/// A topology snapshot: for each filter the tracker knows about, the
/// servers currently offering data matching it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterServerMap {
    pub entries: Vec<(Filter, Vec<SocketAddr>)>,
}

impl FilterServerMap {
    pub fn servers_for(&self, filter: &Filter) -> &[SocketAddr] {
        self.entries
            .iter()
            .find(|(f, _)| f == filter)
            .map(|(_, servers)| servers.as_slice())
            .unwrap_or(&[])
    }
}

/// `getNetwork` reply: the topology snapshot plus the UDP address
/// `reportOffline` datagrams should be sent to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerResponse {
    pub servers: FilterServerMap,
    pub report_addr: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("declared frame length {0} exceeds MAX_FRAME_BYTES")]
    TooLarge(u32),
    #[error("failed to decode tracker record: {0}")]
    Decode(String),
}

async fn write_framed<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, value: &T) -> Result<(), WireError> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| WireError::Decode(e.to_string()))?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_framed<R: AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(WireError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| WireError::Decode(e.to_string()))
}

pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, req: &TrackerRequest) -> Result<(), WireError> {
    write_framed(writer, req).await
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TrackerRequest, WireError> {
    read_framed(reader).await
}

pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, resp: &TrackerResponse) -> Result<(), WireError> {
    write_framed(writer, resp).await
}

pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TrackerResponse, WireError> {
    read_framed(reader).await
}

/// Encodes the one-shot UDP `reportOffline` datagram: a bincode-framed
/// `SocketAddr`, sized exactly to the serialized address with no padding
/// (spec.md §9, open question).
pub fn encode_offline_report(addr: SocketAddr) -> Result<Vec<u8>, WireError> {
    bincode::serde::encode_to_vec(addr, bincode::config::standard()).map_err(|e| WireError::Decode(e.to_string()))
}

pub fn decode_offline_report(bytes: &[u8]) -> Result<SocketAddr, WireError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| WireError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_request_and_response() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = TrackerRequest {
            filter: Filter::Prefix("a/".to_string()),
            local_server: "127.0.0.1:9000".parse().unwrap(),
        };
        write_request(&mut a, &req).await.unwrap();
        let got = read_request(&mut b).await.unwrap();
        assert_eq!(got.local_server, req.local_server);

        let resp = TrackerResponse {
            servers: FilterServerMap {
                entries: vec![(Filter::Everything, vec!["127.0.0.1:9100".parse().unwrap()])],
            },
            report_addr: "127.0.0.1:9200".parse().unwrap(),
        };
        write_response(&mut a, &resp).await.unwrap();
        let got = read_response(&mut b).await.unwrap();
        assert_eq!(got.servers.servers_for(&Filter::Everything).len(), 1);
    }

    #[test]
    fn offline_report_round_trips() {
        let addr: SocketAddr = "192.168.1.1:4242".parse().unwrap();
        let bytes = encode_offline_report(addr).unwrap();
        let decoded = decode_offline_report(&bytes).unwrap();
        assert_eq!(decoded, addr);
    }
}
