//! Explicit configuration record populated by the CLI from flags and
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Default ceiling on simultaneously open `DiskFile`s.
pub const DEFAULT_ACTIVE_FILE_CACHE_SIZE: usize = 512;

/// Number of consecutive TCP sockets a `Connection` multiplexes over
/// (request, notice, data).
pub const SOCKET_COUNT: u16 = 3;

/// Default `SO_TIMEOUT` (spec.md §4.2): how long a Peer's reader tasks wait
/// for the next message on an otherwise-idle socket before concluding the
/// remote end is dead.
pub const DEFAULT_SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Archive root directory.
    pub root_dir: PathBuf,
    /// First port a `Server` tries to bind; it and the next `SOCKET_COUNT - 1`
    /// ports form the listen range.
    pub start_port: u16,
    /// How many consecutive starting ports `Server::bind` tries before
    /// giving up (spec.md §4.5).
    pub port_range: u16,
    /// Ceiling on simultaneously open `DiskFile`s.
    pub active_file_cache_size: usize,
    /// Maximum number of concurrent outbound peers a `ClientManager` keeps.
    pub max_outbound_peers: usize,
    /// Soft read timeout shared by all three sockets of a `Connection`
    /// (spec.md §4.2 `SO_TIMEOUT`): a reader task that waits this long for
    /// the next message errors out, ending the Peer.
    pub socket_read_timeout: Duration,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.active_file_cache_size == 0 {
            return Err(Error::InvalidConfig(
                "active file cache size must be a positive integer".to_string(),
            ));
        }
        if self.start_port == 0 {
            return Err(Error::InvalidConfig(
                "start_port must be nonzero".to_string(),
            ));
        }
        if self.socket_read_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "socket_read_timeout must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            start_port: 0,
            port_range: 64,
            active_file_cache_size: DEFAULT_ACTIVE_FILE_CACHE_SIZE,
            max_outbound_peers: 16,
            socket_read_timeout: DEFAULT_SOCKET_READ_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nonpositive_cache_size() {
        let mut cfg = NodeConfig {
            start_port: 9000,
            ..Default::default()
        };
        cfg.active_file_cache_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_socket_read_timeout() {
        let mut cfg = NodeConfig {
            start_port: 9000,
            ..Default::default()
        };
        cfg.socket_read_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
