//! Connection-setup preamble: magic cookie, protocol version, peer identity.
//!
//! Both ends of a new connection send the same fixed preamble and validate the
//! one they receive; the initiator and acceptor differ only in which identity
//! they learn from it. Each side writes its full preamble before blocking on
//! the peer's, so two simultaneous handshakes cannot deadlock on writes.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::{LinkError, PeerAddr, Result};

/// First bytes on the wire; a cheap filter against non-protocol connections.
pub const COOKIE: [u8; 4] = *b"plnk";

/// Protocol version announced in the preamble.
pub const PROTOCOL_VERSION: u16 = 1;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Rule deciding whether a peer's announced protocol version is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCompat {
    /// Peer version must equal [`PROTOCOL_VERSION`]
    Exact,
    /// Peer version must be at least the given version (backward range)
    AtLeast(u16),
}

impl VersionCompat {
    pub fn accepts(&self, peer_version: u16) -> bool {
        match *self {
            VersionCompat::Exact => peer_version == PROTOCOL_VERSION,
            VersionCompat::AtLeast(min) => peer_version >= min && peer_version <= PROTOCOL_VERSION,
        }
    }
}

/// Encodes the local preamble: cookie, version, self-describing identity.
pub fn encode_preamble(local: PeerAddr) -> Vec<u8> {
    let addr = local.socket_addr();
    let mut buf = Vec::with_capacity(COOKIE.len() + 2 + 1 + 16 + 2);
    buf.extend_from_slice(&COOKIE);
    buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(FAMILY_V4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(FAMILY_V6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    buf
}

async fn read_exact_with_timeout<R>(reader: &mut R, buf: &mut [u8], limit: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut offset = 0;
    while offset < buf.len() {
        let slice = &mut buf[offset..];
        let n = match timeout(limit, reader.read(slice)).await {
            Ok(Ok(0)) => {
                return Err(LinkError::Network(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection during handshake",
                )))
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(LinkError::Network(err)),
            Err(_) => return Err(LinkError::HandshakeTimeout),
        };
        offset += n;
    }
    Ok(())
}

/// Reads and validates the peer's preamble, returning its announced identity.
pub async fn read_preamble<R>(
    reader: &mut R,
    limit: Duration,
    compat: VersionCompat,
) -> Result<PeerAddr>
where
    R: AsyncRead + Unpin,
{
    let mut cookie = [0u8; 4];
    read_exact_with_timeout(reader, &mut cookie, limit).await?;
    if cookie != COOKIE {
        return Err(LinkError::CookieMismatch);
    }

    let mut version = [0u8; 2];
    read_exact_with_timeout(reader, &mut version, limit).await?;
    let peer_version = u16::from_be_bytes(version);
    if !compat.accepts(peer_version) {
        return Err(LinkError::VersionMismatch {
            peer: peer_version,
            local: PROTOCOL_VERSION,
        });
    }

    let mut family = [0u8; 1];
    read_exact_with_timeout(reader, &mut family, limit).await?;
    let ip = match family[0] {
        FAMILY_V4 => {
            let mut octets = [0u8; 4];
            read_exact_with_timeout(reader, &mut octets, limit).await?;
            IpAddr::from(octets)
        }
        FAMILY_V6 => {
            let mut octets = [0u8; 16];
            read_exact_with_timeout(reader, &mut octets, limit).await?;
            IpAddr::from(octets)
        }
        _ => return Err(LinkError::MalformedIdentity),
    };

    let mut port = [0u8; 2];
    read_exact_with_timeout(reader, &mut port, limit).await?;
    let port = u16::from_be_bytes(port);

    Ok(PeerAddr::new(SocketAddr::new(ip, port)))
}

/// Runs the full symmetric exchange over a split stream: send the local
/// preamble, then read and validate the peer's. Returns the peer's identity.
pub async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: PeerAddr,
    limit: Duration,
    compat: VersionCompat,
) -> Result<PeerAddr>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let preamble = encode_preamble(local);
    writer.write_all(&preamble).await?;
    writer.flush().await?;

    let peer = read_preamble(reader, limit, compat).await?;
    debug!(local = %local, peer = %peer, "handshake complete");
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    const LIMIT: Duration = Duration::from_secs(1);

    #[test]
    fn preamble_layout_v4() {
        let buf = encode_preamble(addr("10.1.2.3:7800"));
        assert_eq!(&buf[..4], b"plnk");
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), PROTOCOL_VERSION);
        assert_eq!(buf[6], FAMILY_V4);
        assert_eq!(&buf[7..11], &[10, 1, 2, 3]);
        assert_eq!(u16::from_be_bytes([buf[11], buf[12]]), 7800);
        assert_eq!(buf.len(), 13);
    }

    #[tokio::test]
    async fn preamble_round_trips_v4_and_v6() {
        for s in ["192.168.0.7:9431", "[2001:db8::1]:7800"] {
            let local = addr(s);
            let mut reader = std::io::Cursor::new(encode_preamble(local));
            let peer = read_preamble(&mut reader, LIMIT, VersionCompat::Exact)
                .await
                .unwrap();
            assert_eq!(peer, local);
        }
    }

    #[tokio::test]
    async fn cookie_mismatch_rejected() {
        let mut buf = encode_preamble(addr("127.0.0.1:7800"));
        buf[2] ^= 0x01; // flip one cookie bit
        let mut reader = std::io::Cursor::new(buf);
        let err = read_preamble(&mut reader, LIMIT, VersionCompat::Exact)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::CookieMismatch));
    }

    #[tokio::test]
    async fn incompatible_version_rejected() {
        let mut buf = encode_preamble(addr("127.0.0.1:7800"));
        buf[4..6].copy_from_slice(&99u16.to_be_bytes());
        let mut reader = std::io::Cursor::new(buf);
        let err = read_preamble(&mut reader, LIMIT, VersionCompat::Exact)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::VersionMismatch { peer: 99, .. }));
    }

    #[tokio::test]
    async fn unknown_address_family_rejected() {
        let mut buf = encode_preamble(addr("127.0.0.1:7800"));
        buf[6] = 9;
        let mut reader = std::io::Cursor::new(buf);
        let err = read_preamble(&mut reader, LIMIT, VersionCompat::Exact)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::MalformedIdentity));
    }

    #[tokio::test]
    async fn truncated_preamble_is_an_error() {
        let buf = encode_preamble(addr("127.0.0.1:7800"));
        let mut reader = std::io::Cursor::new(buf[..6].to_vec());
        let err = read_preamble(&mut reader, LIMIT, VersionCompat::Exact)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Network(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut read_half, _write_half) = tokio::io::split(client);

        // server end never writes anything
        let err = read_preamble(&mut read_half, Duration::from_millis(50), VersionCompat::Exact)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::HandshakeTimeout));

        // still usable afterwards from the other end
        use tokio::io::AsyncWriteExt;
        let _ = server.shutdown().await;
    }

    #[tokio::test]
    async fn symmetric_exchange_learns_both_identities() {
        let (a, b) = tokio::io::duplex(256);
        let (mut a_r, mut a_w) = tokio::io::split(a);
        let (mut b_r, mut b_w) = tokio::io::split(b);

        let addr_a = addr("10.0.0.1:7800");
        let addr_b = addr("10.0.0.2:7800");

        let side_a = exchange(&mut a_r, &mut a_w, addr_a, LIMIT, VersionCompat::Exact);
        let side_b = exchange(&mut b_r, &mut b_w, addr_b, LIMIT, VersionCompat::Exact);
        let (got_a, got_b) = tokio::join!(side_a, side_b);

        assert_eq!(got_a.unwrap(), addr_b);
        assert_eq!(got_b.unwrap(), addr_a);
    }

    #[test]
    fn version_compat_ranges() {
        assert!(VersionCompat::Exact.accepts(PROTOCOL_VERSION));
        assert!(!VersionCompat::Exact.accepts(PROTOCOL_VERSION + 1));

        let range = VersionCompat::AtLeast(1);
        assert!(range.accepts(1));
        assert!(!range.accepts(0));
        assert!(!range.accepts(PROTOCOL_VERSION + 1));
    }
}
