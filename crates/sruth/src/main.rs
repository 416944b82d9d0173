//! `sruth`: the `Publisher`/`Subscriber` command-line front-ends (spec.md
//! §6). `Publisher <root_dir>` prints its server's first port to stdout and
//! runs a `SourceNode`; `Subscriber <root_dir> <subscription.xml>` loads a
//! subscription file and runs a `SinkNode`. Exit code 0 on a clean shutdown,
//! non-zero on a fatal startup error (spec.md §7).

mod subscription;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sruth_node::config::{DEFAULT_ACTIVE_FILE_CACHE_SIZE, DEFAULT_SOCKET_READ_TIMEOUT, NodeConfig};
use sruth_node::model::Predicate;
use sruth_node::node::{SinkNode, SourceNode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use subscription::Subscription;

#[derive(Parser)]
#[command(author, version, about = "SRUTH peer-to-peer file distribution node")]
struct Opts {
    #[command(subcommand)]
    command: Command,

    /// First port the node's Server tries to bind; it and the following
    /// SOCKET_COUNT - 1 ports form the request/notice/data triple
    /// (spec.md §4.2).
    #[arg(long, default_value_t = 4240, env = "SRUTH_START_PORT")]
    start_port: u16,

    /// How many consecutive starting ports to try before giving up.
    #[arg(long, default_value_t = 64, env = "SRUTH_PORT_RANGE")]
    port_range: u16,

    /// Ceiling on simultaneously open DiskFiles (spec.md §4.1, §6). Must be
    /// a positive integer; startup aborts otherwise.
    #[arg(long, default_value_t = DEFAULT_ACTIVE_FILE_CACHE_SIZE, env = "SRUTH_CACHE_SIZE")]
    active_file_cache_size: usize,

    /// Maximum number of concurrent outbound peers per ClientManager
    /// (Subscriber only).
    #[arg(long, default_value_t = 16, env = "SRUTH_MAX_OUTBOUND_PEERS")]
    max_outbound_peers: usize,

    /// Soft read timeout, in seconds, shared by all three Connection
    /// sockets (spec.md §4.2 SO_TIMEOUT): a Peer whose socket goes this
    /// long without a message is assumed dead and torn down.
    #[arg(
        long,
        default_value_t = DEFAULT_SOCKET_READ_TIMEOUT.as_secs(),
        env = "SRUTH_SOCKET_READ_TIMEOUT_SECS"
    )]
    socket_read_timeout_secs: u64,

    /// The console loglevel, as a `tracing_subscriber::EnvFilter` directive.
    #[arg(long, default_value = "info", env = "SRUTH_LOG")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Watches `root_dir`, injecting files into the shared archive and
    /// serving pieces to subscribers. Advertises Predicate::NOTHING: it
    /// serves but never requests (spec.md §4.7, §9).
    Publisher { root_dir: PathBuf },
    /// Pulls files matching `subscription_xml`'s predicate into `root_dir`.
    Subscriber {
        root_dir: PathBuf,
        subscription_xml: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(opts.log_level.clone())),
        )
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error building tokio runtime")?;

    let result = rt.block_on(async_main(opts));
    if let Err(e) = result.as_ref() {
        error!("fatal error: {e:#}");
    }
    match result {
        Ok(()) => Ok(()),
        Err(e) => std::process::exit(exit_code_for(&e)),
    }
}

/// Fatal errors (root not writable, no port available) get a distinct exit
/// code from generic startup failures (spec.md §7).
fn exit_code_for(e: &anyhow::Error) -> i32 {
    if let Some(err) = e.downcast_ref::<sruth_node::Error>() {
        match err {
            sruth_node::Error::RootNotWritable(_) | sruth_node::Error::NoPortAvailable => return 2,
            _ => {}
        }
    }
    1
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, shutting down");
                cancel.cancel();
            }
        });
    }

    match opts.command {
        Command::Publisher { root_dir } => run_publisher(&opts, root_dir, cancel).await,
        Command::Subscriber { root_dir, subscription_xml } => {
            run_subscriber(&opts, root_dir, subscription_xml, cancel).await
        }
    }
}

fn base_config(opts: &Opts, root_dir: PathBuf) -> NodeConfig {
    NodeConfig {
        root_dir,
        start_port: opts.start_port,
        port_range: opts.port_range,
        active_file_cache_size: opts.active_file_cache_size,
        max_outbound_peers: opts.max_outbound_peers,
        socket_read_timeout: std::time::Duration::from_secs(opts.socket_read_timeout_secs),
    }
}

async fn run_publisher(
    opts: &Opts,
    root_dir: PathBuf,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let config = base_config(opts, root_dir);
    let mut node = SourceNode::start(config)
        .await
        .context("error starting publisher")?;

    // spec.md §6: "prints its server's first port to stdout".
    println!("{}", node.ports[0]);

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = node.run() => r,
    };
    node.shutdown().await;
    result.context("publisher node failed")
}

async fn run_subscriber(
    opts: &Opts,
    root_dir: PathBuf,
    subscription_xml: PathBuf,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let xml = tokio::fs::read_to_string(&subscription_xml)
        .await
        .with_context(|| format!("error reading subscription file {subscription_xml:?}"))?;
    let subscription = Subscription::parse(&xml)
        .with_context(|| format!("error parsing subscription file {subscription_xml:?}"))?;

    info!(tracker = %subscription.tracker, "loaded subscription");

    let config = base_config(opts, root_dir);
    let predicate = Predicate::from_filters(vec![subscription.filter.clone()]);

    let mut node = SinkNode::start(config, predicate, subscription.filter, vec![subscription.tracker])
        .await
        .context("error starting subscriber")?;

    println!("{}", node.ports[0]);

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = node.run() => r,
    };
    node.shutdown().await;
    result.context("subscriber node failed")
}
