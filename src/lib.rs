//! Point-to-point TCP connection management for cluster nodes.
//!
//! `peerlink` keeps at most one usable TCP connection per peer, even when both
//! sides dial each other at the same instant. It owns connection establishment
//! (a cookie + version + identity handshake), a keyed registry of live
//! connections with listener notification and idle reaping, and a
//! task-per-connection send/receive model with an optional bounded send queue.
//!
//! Higher layers consume it through four points only: [`Server::send`],
//! the [`Receiver`] callback, and the opened/closed notifications of
//! [`ConnectionListener`].
//!
//! ```no_run
//! use peerlink::{LinkConfig, PeerAddr, Server};
//!
//! # async fn example() -> peerlink::Result<()> {
//! let server = Server::start(LinkConfig::default(), |sender: PeerAddr, frame: &[u8]| {
//!     println!("{} sent {} bytes", sender, frame.len());
//! })
//! .await?;
//!
//! let peer: PeerAddr = "10.0.0.2:7800".parse().unwrap();
//! server.send(peer, b"hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod framing;
pub mod handshake;
pub mod registry;
pub mod server;

use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

pub use config::LinkConfig;
pub use connection::{Connection, ConnectionState};
pub use handshake::VersionCompat;
pub use registry::{ConnectionListener, ConnectionRegistry, Receiver};
pub use server::Server;

/// Identity of a cluster node: the address its server socket is reachable on.
///
/// Doubles as the connection-table key and as the tie-break key for
/// simultaneous connection attempts; the tie-break relies on the derived
/// total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddr(SocketAddr);

impl PeerAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for PeerAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self)
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced by connection establishment and the send path.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("timed out connecting to peer")]
    ConnectTimeout,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake cookie mismatch")]
    CookieMismatch,

    #[error("incompatible protocol version: peer sent {peer}, local is {local}")]
    VersionMismatch { peer: u16, local: u16 },

    #[error("malformed peer identity in handshake")]
    MalformedIdentity,

    #[error("frame too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("no free port in range {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("connection to {0} is closed")]
    ConnectionClosed(PeerAddr),

    #[error("server not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_addr_total_order_by_ip_then_port() {
        let a: PeerAddr = "10.0.0.1:7800".parse().unwrap();
        let b: PeerAddr = "10.0.0.2:7800".parse().unwrap();
        let c: PeerAddr = "10.0.0.2:7801".parse().unwrap();

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, "10.0.0.1:7800".parse::<PeerAddr>().unwrap());
    }

    #[test]
    fn peer_addr_display_round_trips() {
        let addr: PeerAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
        assert_eq!(addr.to_string().parse::<PeerAddr>().unwrap(), addr);
    }

    #[test]
    fn link_error_display() {
        let err = LinkError::Network(io::Error::other("test error"));
        assert_eq!(err.to_string(), "network error: test error");

        let err = LinkError::VersionMismatch { peer: 2, local: 1 };
        assert_eq!(
            err.to_string(),
            "incompatible protocol version: peer sent 2, local is 1"
        );

        let err = LinkError::FrameTooLarge { len: 1000, max: 500 };
        assert_eq!(err.to_string(), "frame too large: 1000 bytes (max: 500)");

        let err = LinkError::NoFreePort { start: 7800, end: 7850 };
        assert_eq!(err.to_string(), "no free port in range 7800..=7850");

        let addr: PeerAddr = "127.0.0.1:8080".parse().unwrap();
        let err = LinkError::ConnectionClosed(addr);
        assert_eq!(err.to_string(), "connection to 127.0.0.1:8080 is closed");
    }

    #[test]
    fn io_error_converts_to_network() {
        let io_err = io::Error::other("io error");
        let err: LinkError = io_err.into();
        assert!(matches!(err, LinkError::Network(_)));
    }
}
