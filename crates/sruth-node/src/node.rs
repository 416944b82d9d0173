//! `Node`: the top-level orchestrator. A `SourceNode` publishes (Predicate
//! `NOTHING`); a `SinkNode` subscribes via one or more `ClientManager`s
//! against a user-supplied `Predicate`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::archive::Archive;
use crate::clearinghouse::ClearingHouse;
use crate::client_manager::ClientManager;
use crate::config::NodeConfig;
use crate::error::Error;
use crate::model::{Filter, Predicate};
use crate::server::Server;
use crate::tracker_proxy::TrackerProxy;

/// Archive + Server + Watcher, Predicate `NOTHING`: serves data but never
/// requests any.
pub struct SourceNode {
    pub archive: Arc<Archive>,
    pub clearinghouse: Arc<ClearingHouse>,
    pub ports: [u16; 3],
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl SourceNode {
    pub async fn start(config: NodeConfig) -> Result<Self, Error> {
        config.validate()?;
        let archive = Archive::open(config.root_dir.clone(), config.active_file_cache_size).await?;
        archive.rescan().await?;
        archive.watch();

        let clearinghouse = ClearingHouse::new(archive.clone(), Predicate::nothing());
        let (server, listeners) = Server::bind(config.start_port, config.port_range).await?;
        let ports = server.ports;

        let cancel = CancellationToken::new();
        clearinghouse.spawn_archive_event_router(cancel.child_token());
        let mut tasks = JoinSet::new();
        tasks.spawn(Server::run_accept_loop(
            listeners,
            clearinghouse.clone(),
            archive.clone(),
            config.socket_read_timeout,
            cancel.clone(),
        ));

        info!(?ports, "source node listening");
        Ok(Self { archive, clearinghouse, ports, cancel, tasks })
    }

    /// Runs until the accept loop ends abnormally or the node is cancelled.
    pub async fn run(&mut self) -> Result<(), Error> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            Some(result) = self.tasks.join_next() => {
                result.map_err(|e| Error::ProtocolViolation(e.to_string()))
            }
        }
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.archive.close();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Archive + Server + one or more `ClientManager`s (one per tracker) +
/// user-supplied Predicate.
pub struct SinkNode {
    pub archive: Arc<Archive>,
    pub clearinghouse: Arc<ClearingHouse>,
    pub ports: [u16; 3],
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl SinkNode {
    pub async fn start(
        config: NodeConfig,
        predicate: Predicate,
        subscription_filter: Filter,
        trackers: Vec<SocketAddr>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let archive = Archive::open(config.root_dir.clone(), config.active_file_cache_size).await?;
        archive.rescan().await?;
        archive.watch();

        let clearinghouse = ClearingHouse::new(archive.clone(), predicate);
        let (server, listeners) = Server::bind(config.start_port, config.port_range).await?;
        let ports = server.ports;
        let local_server = SocketAddr::new("0.0.0.0".parse().unwrap(), ports[0]);

        let cancel = CancellationToken::new();
        clearinghouse.spawn_archive_event_router(cancel.child_token());
        let mut tasks = JoinSet::new();
        tasks.spawn(Server::run_accept_loop(
            listeners,
            clearinghouse.clone(),
            archive.clone(),
            config.socket_read_timeout,
            cancel.clone(),
        ));

        for tracker_addr in trackers {
            let proxy = Arc::new(TrackerProxy::new(tracker_addr, archive.clone()));
            let manager = ClientManager::new(
                proxy,
                subscription_filter.clone(),
                local_server,
                config.max_outbound_peers,
                clearinghouse.clone(),
                archive.clone(),
                config.socket_read_timeout,
            );
            let cancel = cancel.clone();
            tasks.spawn(async move { manager.run(cancel).await });
        }

        info!(?ports, "sink node listening");
        Ok(Self { archive, clearinghouse, ports, cancel, tasks })
    }

    /// `call` submits each subtask to a bounded executor and returns as
    /// soon as any subtask terminates abnormally (spec.md §4.7).
    pub async fn run(&mut self) -> Result<(), Error> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            Some(result) = self.tasks.join_next() => {
                if let Err(e) = &result {
                    error!(error = %e, "sink node subtask panicked");
                }
                result.map_err(|e| Error::ProtocolViolation(e.to_string()))
            }
        }
    }

    /// Cancels all remaining tasks and joins, with the bounded-timeout
    /// discipline spec.md §5 asks for.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.archive.close();
        let drain = async { while self.tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
            self.tasks.abort_all();
        }
    }
}
