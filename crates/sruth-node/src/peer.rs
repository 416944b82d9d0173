//! `Peer`: a full-duplex protocol engine over one `Connection`. Runs six
//! concurrent tasks -- three senders draining outbound queues into their
//! socket, three receivers reading typed messages and dispatching to the
//! `ClearingHouse` -- sharing one generic typed-stream-task helper instead
//! of a sender/receiver class hierarchy (spec.md §9).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::archive::Archive;
use crate::clearinghouse::{ClearingHouse, PeerId};
use crate::connection::Connection;
use crate::error::Error;
use crate::wire::{self, Message};

/// Outbound queue depth for each of the three sender tasks: the backpressure
/// point described in spec.md §5.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Runs one Peer to completion: handshake, then the six tasks, then
/// cleanup. Returns once the connection has ended (normally or by error).
#[instrument(skip_all, fields(peer = %peer_addr))]
pub async fn run(
    id: PeerId,
    peer_addr: SocketAddr,
    connection: Connection,
    clearinghouse: Arc<ClearingHouse>,
    archive: Arc<Archive>,
    read_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let halves = connection.split();
    let mut request_rx = halves.request_rx;
    let mut request_tx = halves.request_tx;
    let mut notice_rx = halves.notice_rx;
    let mut notice_tx = halves.notice_tx;
    let mut data_rx = halves.data_rx;
    let mut data_tx = halves.data_tx;

    let local_predicate = clearinghouse.local_predicate();
    wire::write_handshake(&mut request_tx, &local_predicate).await?;
    let remote_predicate = tokio::time::timeout(read_timeout, wire::read_handshake(&mut request_rx))
        .await
        .map_err(|_| Error::PeerTimeout(read_timeout))??;
    info!(?remote_predicate, "peer handshake complete");

    let (notice_out_tx, notice_out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (request_out_tx, request_out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (piece_out_tx, piece_out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

    clearinghouse.register_peer(id, remote_predicate.clone(), notice_out_tx.clone());

    let peer_cancel = CancellationToken::new();
    let mut join_set = tokio::task::JoinSet::new();

    join_set.spawn(sender_task(notice_tx, notice_out_rx, peer_cancel.clone()));
    join_set.spawn(sender_task(request_tx, request_out_rx, peer_cancel.clone()));
    join_set.spawn(sender_task(data_tx, piece_out_rx, peer_cancel.clone()));

    join_set.spawn(request_receiver_task(
        request_rx,
        archive.clone(),
        piece_out_tx.clone(),
        read_timeout,
        peer_cancel.clone(),
    ));
    join_set.spawn(notice_receiver_task(
        notice_rx,
        clearinghouse.clone(),
        request_out_tx.clone(),
        id,
        read_timeout,
        peer_cancel.clone(),
    ));
    join_set.spawn(piece_receiver_task(
        data_rx,
        archive.clone(),
        clearinghouse.clone(),
        id,
        read_timeout,
        peer_cancel.clone(),
    ));

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            peer_cancel.cancel();
            Ok(())
        }
        Some(result) = join_set.join_next() => {
            // Any one task ending -- normally or by error -- ends the Peer:
            // cancel the rest and let them unwind out of blocking I/O.
            peer_cancel.cancel();
            result.map_err(|e| Error::ProtocolViolation(e.to_string())).and_then(|r| r)
        }
    };

    while join_set.join_next().await.is_some() {}
    clearinghouse.unregister_peer(id);
    debug!("peer terminated");
    outcome
}

/// Reads one message off `reader`, bounded by `SO_TIMEOUT` (spec.md §4.2):
/// an otherwise-idle socket that goes quiet this long is assumed dead.
async fn read_message_timed<R: AsyncRead + Unpin>(
    reader: &mut R,
    read_timeout: Duration,
) -> Result<Message, Error> {
    tokio::time::timeout(read_timeout, wire::read_message(reader))
        .await
        .map_err(|_| Error::PeerTimeout(read_timeout))?
}

async fn sender_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = rx.recv() => match msg {
                Some(msg) => wire::write_message(&mut writer, &msg).await?,
                None => return Ok(()),
            }
        }
    }
}

/// On inbound Request: fetch each piece from the archive; if present,
/// enqueue it on the DATA socket, otherwise silently drop the stale offer.
async fn request_receiver_task<R: AsyncRead + Unpin>(
    mut reader: R,
    archive: Arc<Archive>,
    piece_out_tx: mpsc::Sender<Message>,
    read_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = read_message_timed(&mut reader, read_timeout) => message?,
        };
        let Message::Request(specs) = message else {
            return Err(Error::ProtocolViolation("expected Request on request socket".into()));
        };
        for spec in specs.iter_specs() {
            match archive.get_piece(&spec).await {
                Ok(Some(piece)) => {
                    if piece_out_tx.send(Message::Piece(piece)).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    debug!(file = ?spec.info.id, index = spec.index, "dropping stale request, piece not held");
                }
                Err(e) => warn!(error = %e, "archive read failed while serving request"),
            }
        }
    }
}

/// On inbound Notice/AddendumSpec/Removal: enqueue Requests for anything
/// the `ClearingHouse` says is newly owed to this peer.
async fn notice_receiver_task<R: AsyncRead + Unpin>(
    mut reader: R,
    clearinghouse: Arc<ClearingHouse>,
    request_out_tx: mpsc::Sender<Message>,
    peer_id: PeerId,
    read_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = read_message_timed(&mut reader, read_timeout) => message?,
        };
        let specs = match message {
            Message::Notice(specs) => specs,
            Message::AddendumSpec(file_specs) => {
                let mut set = crate::model::PieceSpecSet::new();
                set.push(file_specs);
                set
            }
            Message::Removal(file_id) => {
                debug!(?file_id, "peer reports removal, no local action (informational only)");
                continue;
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected message {other:?} on notice socket"
                )));
            }
        };
        let to_request = clearinghouse.on_inbound_notice(peer_id, &specs).await;
        if to_request.is_empty() {
            continue;
        }
        let mut request_set = crate::model::PieceSpecSet::new();
        for spec in to_request {
            request_set.push(crate::model::FilePieceSpecs::single(spec.info, spec.index));
        }
        if request_out_tx.send(Message::Request(request_set)).await.is_err() {
            return Ok(());
        }
    }
}

/// On inbound Piece: hand it to the archive; on completion, update the
/// local predicate and broadcast the new data to other interested peers.
async fn piece_receiver_task<R: AsyncRead + Unpin>(
    mut reader: R,
    archive: Arc<Archive>,
    clearinghouse: Arc<ClearingHouse>,
    peer_id: PeerId,
    read_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = read_message_timed(&mut reader, read_timeout) => message?,
        };
        let Message::Piece(piece) = message else {
            return Err(Error::ProtocolViolation("expected Piece on data socket".into()));
        };
        let file_id = piece.info.id.clone();
        let index = piece.index;
        clearinghouse.on_piece_delivered(&file_id, index);
        match archive.put_piece(piece.clone()).await {
            Ok(true) => {
                clearinghouse.mark_local_satisfied(&file_id.path);
                let specs = crate::model::FilePieceSpecs::all_pieces(piece.info);
                clearinghouse.broadcast_new_data(specs, Some(peer_id)).await;
            }
            Ok(false) => {}
            Err(e) => warn!(?file_id, error = %e, "failed to store inbound piece"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_message_timed_errors_out_a_silent_socket() {
        let (mut idle, _other_end) = tokio::io::duplex(64);
        let err = read_message_timed(&mut idle, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerTimeout(_)));
    }
}
