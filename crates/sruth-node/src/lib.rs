//! Archive storage, piece-exchange protocol and node orchestration for a
//! SRUTH peer: publisher nodes inject files into a shared content archive
//! and subscriber nodes pull copies of files matching a declarative
//! filter, discovering each other through a lightweight tracker and
//! exchanging fixed-size pieces over long-lived multi-channel TCP
//! connections.
//!
//! # Quick usage example
//!
//! ```no_run
//! use sruth_node::config::NodeConfig;
//! use sruth_node::node::SourceNode;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = NodeConfig {
//!         root_dir: "/tmp/sruth-archive".into(),
//!         start_port: 7000,
//!         ..Default::default()
//!     };
//!     let mut node = SourceNode::start(config).await.unwrap();
//!     node.run().await.unwrap();
//! }
//! ```
//!
//! # Overview
//! [`archive::Archive`] owns all on-disk state. [`model`] is the shared,
//! serializable data model. [`connection::Connection`] and [`peer`] run the
//! piece-exchange protocol; [`clearinghouse::ClearingHouse`] brokers
//! between peers and the archive. [`server::Server`] and
//! [`client_manager::ClientManager`] handle inbound and outbound peer
//! discovery; [`tracker_proxy::TrackerProxy`] is the soft dependency on an
//! external tracker. [`node::SourceNode`] and [`node::SinkNode`] compose
//! all of the above.

pub mod archive;
pub mod clearinghouse;
pub mod client_manager;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod node;
pub mod peer;
pub mod server;
pub mod tracker_proxy;
pub mod wire;

pub use error::{Error, Result};
