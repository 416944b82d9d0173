//! End-to-end two-node-over-loopback harness (spec.md §8 scenarios): wires a
//! publisher-like `Archive`/`ClearingHouse` and a subscriber-like one over a
//! real loopback `Connection`, without a tracker -- peers are seeded
//! directly, the way spec.md §8's scenarios are phrased.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sruth_node::archive::Archive;
use sruth_node::clearinghouse::ClearingHouse;
use sruth_node::connection::Connection;
use sruth_node::model::{Predicate, PIECE_SIZE};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Node {
    _dir: TempDir,
    archive: Arc<Archive>,
    clearinghouse: Arc<ClearingHouse>,
}

impl Node {
    async fn new(predicate: Predicate) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path().to_path_buf(), 8).await.unwrap();
        let clearinghouse = ClearingHouse::new(archive.clone(), predicate);
        Self { _dir: dir, archive, clearinghouse }
    }

    /// Drops `bytes` straight onto disk at `path` and has the archive
    /// discover it the way a real `Publisher` does: the watcher (or, here,
    /// an explicit `rescan`) finds a file it didn't create via `put_piece`
    /// and registers it with an infinite TTL (`archive::ingest_external_file`),
    /// emitting the `ArchiveEvent::NewData` the `ClearingHouse` broadcasts.
    async fn publish(&self, path: &str, bytes: &[u8]) {
        let abs = self.archive.root().join(path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&abs, bytes).await.unwrap();
        self.archive.rescan().await.unwrap();
    }
}

/// Binds three consecutive listener ports starting at `base` (the "server"
/// side of one `Connection`, matching `Server::bind`'s port-triple layout)
/// and connects a client `Connection` to them (matching `Connection::connect`).
async fn connect_over_loopback(base: u16) -> (Connection, Connection) {
    let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut listeners = Vec::with_capacity(3);
    for offset in 0..3u16 {
        listeners.push(TcpListener::bind((ip, base + offset)).await.unwrap());
    }

    let client_addr = SocketAddr::new(ip, base);
    let (client, accepted) = tokio::join!(Connection::connect(client_addr), async {
        let (request, remote) = listeners[0].accept().await.unwrap();
        let (notice, _) = listeners[1].accept().await.unwrap();
        let (data, _) = listeners[2].accept().await.unwrap();
        (remote, request, notice, data)
    });
    let (remote, request, notice, data) = accepted;
    let server = Connection::from_triple(remote, request, notice, data);
    (client.unwrap(), server)
}

/// Process-wide counter so every `peer::run` call gets a distinct id, even
/// across multiple connections sharing one `ClearingHouse` (two subscribers
/// of the same publisher): `ClearingHouse::register_peer` keys on id alone,
/// so reusing one across connections would silently clobber a registration.
static NEXT_TEST_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Spawns `peer::run` for both ends of a freshly connected pair and waits
/// until each `ClearingHouse` has registered the other (handshake complete).
async fn wire_nodes(publisher: &Node, subscriber: &Node, base: u16) -> CancellationToken {
    let (pub_side, sub_side) = connect_over_loopback(base).await;
    let cancel = CancellationToken::new();

    let read_timeout = Duration::from_secs(10);

    let c = cancel.clone();
    let (ch, ar) = (publisher.clearinghouse.clone(), publisher.archive.clone());
    let id = NEXT_TEST_PEER_ID.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        let addr = pub_side.peer_addr;
        let _ = sruth_node::peer::run(id, addr, pub_side, ch, ar, read_timeout, c).await;
    });
    let c = cancel.clone();
    let (ch, ar) = (subscriber.clearinghouse.clone(), subscriber.archive.clone());
    let id = NEXT_TEST_PEER_ID.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        let addr = sub_side.peer_addr;
        let _ = sruth_node::peer::run(id, addr, sub_side, ch, ar, read_timeout, c).await;
    });

    let prev_pub_count = publisher.clearinghouse.peer_count();
    let prev_sub_count = subscriber.clearinghouse.peer_count();
    wait_for(|| publisher.clearinghouse.peer_count() == prev_pub_count + 1).await;
    wait_for(|| subscriber.clearinghouse.peer_count() == prev_sub_count + 1).await;
    cancel
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition did not become true within timeout");
}

/// Scenario 1 (spec.md §8): a single publisher, single subscriber, one small
/// file. The subscriber's copy ends up byte-identical.
#[tokio::test]
async fn single_file_replicates_to_subscriber() {
    let publisher = Node::new(Predicate::nothing()).await;
    let subscriber = Node::new(Predicate::everything()).await;
    let cancel = wire_nodes(&publisher, &subscriber, 19_240).await;

    let bytes: Vec<u8> = (0..=199_999u32).map(|i| (i % 256) as u8).collect();
    publisher.publish("a/b.txt", &bytes).await;

    let visible = subscriber.archive.root().join("a/b.txt");
    wait_for(|| visible.exists()).await;
    // Give the writer a moment past the rename to guarantee the full
    // contents are flushed -- `exists()` only proves the atomic rename ran.
    wait_for(|| {
        std::fs::metadata(&visible).map(|m| m.len()).unwrap_or(0) == bytes.len() as u64
    })
    .await;
    let got = tokio::fs::read(&visible).await.unwrap();
    assert_eq!(got, bytes);

    cancel.cancel();
}

/// Scenario (spec.md §8, multi-piece materialization): a file spanning two
/// pieces arrives whole and no hidden staging copy lingers afterward.
#[tokio::test]
async fn multi_piece_file_materializes_with_no_lingering_hidden_copy() {
    let publisher = Node::new(Predicate::nothing()).await;
    let subscriber = Node::new(Predicate::everything()).await;
    let cancel = wire_nodes(&publisher, &subscriber, 19_250).await;

    let size = (PIECE_SIZE * 2 + 10) as usize;
    let bytes: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    publisher.publish("big/file.bin", &bytes).await;

    let visible = subscriber.archive.root().join("big/file.bin");
    wait_for(|| {
        std::fs::metadata(&visible).map(|m| m.len()).unwrap_or(0) == bytes.len() as u64
    })
    .await;
    let got = tokio::fs::read(&visible).await.unwrap();
    assert_eq!(got, bytes);

    let hidden = subscriber.archive.root().join(".sruth/big/file.bin");
    assert!(!hidden.exists(), "no hidden staging copy should remain once complete");

    cancel.cancel();
}

/// Scenario 6 (spec.md §8): two sink nodes request the same new file from
/// one source. Each receives a correct complete copy and the source's
/// outstanding-request table is empty at quiescence.
#[tokio::test]
async fn two_subscribers_each_get_a_complete_copy() {
    let publisher = Node::new(Predicate::nothing()).await;
    let sub_a = Node::new(Predicate::everything()).await;
    let sub_b = Node::new(Predicate::everything()).await;
    let cancel_a = wire_nodes(&publisher, &sub_a, 19_260).await;
    let cancel_b = wire_nodes(&publisher, &sub_b, 19_270).await;
    wait_for(|| publisher.clearinghouse.peer_count() == 2).await;

    let bytes: Vec<u8> = (0..50_000u32).map(|i| (i % 255) as u8).collect();
    publisher.publish("shared.dat", &bytes).await;

    for node in [&sub_a, &sub_b] {
        let visible = node.archive.root().join("shared.dat");
        wait_for(|| {
            std::fs::metadata(&visible).map(|m| m.len()).unwrap_or(0) == bytes.len() as u64
        })
        .await;
        let got = tokio::fs::read(&visible).await.unwrap();
        assert_eq!(got, bytes);
    }

    wait_for(|| publisher.clearinghouse.outstanding_len() == 0).await;

    cancel_a.cancel();
    cancel_b.cancel();
}

/// Narrowing a satisfied filter must not retire it: a subscriber with a
/// broad predicate (spec.md: filters are "possibly narrowed" rather than
/// dropped on first match) keeps receiving other, later files published
/// under the same predicate.
#[tokio::test]
async fn second_distinct_file_under_same_broad_predicate_is_still_delivered() {
    let publisher = Node::new(Predicate::nothing()).await;
    let subscriber = Node::new(Predicate::everything()).await;
    let cancel = wire_nodes(&publisher, &subscriber, 19_290).await;

    let first: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    publisher.publish("a/first.dat", &first).await;
    let first_visible = subscriber.archive.root().join("a/first.dat");
    wait_for(|| {
        std::fs::metadata(&first_visible).map(|m| m.len()).unwrap_or(0) == first.len() as u64
    })
    .await;
    assert_eq!(tokio::fs::read(&first_visible).await.unwrap(), first);

    let second: Vec<u8> = (0..12_000u32).map(|i| ((i + 7) % 256) as u8).collect();
    publisher.publish("a/second.dat", &second).await;
    let second_visible = subscriber.archive.root().join("a/second.dat");
    wait_for(|| {
        std::fs::metadata(&second_visible).map(|m| m.len()).unwrap_or(0) == second.len() as u64
    })
    .await;
    assert_eq!(tokio::fs::read(&second_visible).await.unwrap(), second);

    cancel.cancel();
}

/// A peer whose predicate matches nothing (source-like) never issues a
/// request, even when offered data (spec.md §9 open question).
#[tokio::test]
async fn non_matching_subscriber_never_requests() {
    let publisher = Node::new(Predicate::nothing()).await;
    let indifferent = Node::new(Predicate::from_filters(vec![
        sruth_node::model::Filter::Prefix("only-this/".to_string()),
    ]))
    .await;
    let cancel = wire_nodes(&publisher, &indifferent, 19_280).await;

    publisher.publish("elsewhere/file.txt", b"hello").await;

    // Give the uninterested peer ample time to (not) request it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!indifferent.archive.root().join("elsewhere/file.txt").exists());
    assert_eq!(publisher.clearinghouse.outstanding_len(), 0);

    cancel.cancel();
}
