use std::net::IpAddr;
use std::time::Duration;

use crate::handshake::VersionCompat;

/// Default first port probed when binding the server socket
pub const DEFAULT_START_PORT: u16 = 7800;

/// Default number of ports probed above the start port on bind conflicts
pub const DEFAULT_PORT_RANGE: u16 = 50;

/// Default timeout for an outbound TCP connect
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;

/// Default bound on each blocking read during the handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 2_000;

/// Configuration for a [`Server`](crate::Server) and its connection registry.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Address the server socket binds to
    pub bind_addr: IpAddr,
    /// First port probed when binding
    pub start_port: u16,
    /// Number of additional ports probed on bind conflicts; startup fails
    /// once `start_port + port_range` is exhausted
    pub port_range: u16,
    /// Timeout for outbound TCP connects
    pub connect_timeout: Duration,
    /// Bound on each read while waiting for the peer's handshake preamble
    pub handshake_timeout: Duration,
    /// Interval between reaper scans; zero disables the reaper
    pub reap_interval: Duration,
    /// Idle time after which the reaper closes a connection; zero means
    /// connections never expire
    pub conn_expiry: Duration,
    /// Capacity of the per-connection outbound queue; zero sends
    /// synchronously under the connection's write lock
    pub send_queue_capacity: usize,
    /// Send buffer size of each socket; `None` keeps the OS default
    pub send_buf_size: Option<u32>,
    /// Receive buffer size of each socket; `None` keeps the OS default
    pub recv_buf_size: Option<u32>,
    /// Disable Nagle's algorithm on every connection
    pub tcp_nodelay: bool,
    /// Maximum accepted frame payload length; zero disables the check
    pub max_frame_len: usize,
    /// Rule applied to the protocol version a peer announces
    pub version_compat: VersionCompat,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            start_port: DEFAULT_START_PORT,
            port_range: DEFAULT_PORT_RANGE,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            reap_interval: Duration::ZERO,
            conn_expiry: Duration::ZERO,
            send_queue_capacity: 0,
            send_buf_size: None,
            recv_buf_size: None,
            tcp_nodelay: true,
            max_frame_len: 0,
            version_compat: VersionCompat::Exact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();

        assert_eq!(config.bind_addr, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.start_port, DEFAULT_START_PORT);
        assert_eq!(config.port_range, DEFAULT_PORT_RANGE);
        assert_eq!(config.connect_timeout, Duration::from_millis(1_000));
        assert_eq!(config.handshake_timeout, Duration::from_millis(2_000));
        assert_eq!(config.reap_interval, Duration::ZERO);
        assert_eq!(config.conn_expiry, Duration::ZERO);
        assert_eq!(config.send_queue_capacity, 0);
        assert_eq!(config.send_buf_size, None);
        assert_eq!(config.recv_buf_size, None);
        assert!(config.tcp_nodelay);
        assert_eq!(config.max_frame_len, 0);
        assert_eq!(config.version_compat, VersionCompat::Exact);
    }

    #[test]
    fn test_custom_config() {
        let config = LinkConfig {
            start_port: 9000,
            reap_interval: Duration::from_secs(60),
            conn_expiry: Duration::from_secs(300),
            send_queue_capacity: 10_000,
            ..Default::default()
        };

        assert_eq!(config.start_port, 9000);
        assert_eq!(config.reap_interval, Duration::from_secs(60));
        assert_eq!(config.conn_expiry, Duration::from_secs(300));
        assert_eq!(config.send_queue_capacity, 10_000);
        // untouched fields keep their defaults
        assert_eq!(config.port_range, DEFAULT_PORT_RANGE);
        assert!(config.tcp_nodelay);
    }
}
