//! One `thiserror` enum per failure kind — a flat enum with one variant per
//! failure site rather than a tree of nested error types.

use std::net::SocketAddr;

use crate::model::ArchivePath;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // --- programmer invariant: fail fast, descriptive ---
    #[error("invalid archive path: {0:?}")]
    InvalidPath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- transient I/O: logged, surfaces as peer disconnect / cache fallback ---
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("peer connection error: {0}")]
    PeerIo(#[source] std::io::Error),

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("no message received within {0:?}, assuming peer is dead")]
    PeerTimeout(std::time::Duration),

    #[error("tracker unreachable: {0}")]
    TrackerUnreachable(#[source] std::io::Error),

    // --- resource exhaustion ---
    #[error("too many open files and LRU eviction yielded nothing")]
    FileCacheExhausted,

    // --- data corruption ---
    #[error("failed to decode wire message: {0}")]
    Decode(String),

    #[error("declared length {declared} does not match available {available}")]
    LengthMismatch { declared: usize, available: usize },

    // --- protocol violation: drop silently, never penalize ---
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    // --- fatal: abort process ---
    #[error("root directory {0:?} is not writable")]
    RootNotWritable(std::path::PathBuf),

    #[error("could not bind any server port in configured range")]
    NoPortAvailable,

    #[error("file not found in archive: {0:?}")]
    NotFound(ArchivePath),

    #[error("cannot rename {from:?} to {to:?}: {source}")]
    Rename {
        from: std::path::PathBuf,
        to: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no connection available to {0}")]
    ConnectionFailed(SocketAddr),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
