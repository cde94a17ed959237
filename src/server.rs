//! TCP endpoint tying the pieces together: binds a listener within the
//! configured port range, runs the accept loop, and exposes the send API on
//! top of the connection registry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::connection::Connection;
use crate::registry::{ConnectionListener, ConnectionRegistry, Receiver};
use crate::{LinkError, PeerAddr, Result};

const LISTEN_BACKLOG: u32 = 20;

/// One node's endpoint. Start it with a [`LinkConfig`] and a [`Receiver`];
/// peers are connected to lazily on first send and transparently on accept.
pub struct Server {
    registry: Arc<ConnectionRegistry>,
    local: PeerAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Binds the first free port in the configured range, starts the accept
    /// loop and the idle reaper, and returns the running server.
    pub async fn start<R>(config: LinkConfig, receiver: R) -> Result<Self>
    where
        R: Receiver + 'static,
    {
        let listener = bind_in_range(&config)?;
        let local = PeerAddr::new(listener.local_addr()?);
        let registry = ConnectionRegistry::new(local, config, Arc::new(receiver));
        registry.start_reaper();

        let weak = Arc::downgrade(&registry);
        let accept_task = tokio::spawn(accept_loop(listener, weak));

        info!(%local, "server started");
        Ok(Self {
            registry,
            local,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The address this server is bound to and announces during handshakes.
    pub fn local_addr(&self) -> PeerAddr {
        self.local
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.registry.add_listener(listener);
    }

    /// Sends one frame to `dest`, connecting first if needed. A send to our
    /// own address is delivered directly to the receiver without touching
    /// the network. On a stopped server the frame is dropped silently, so
    /// callers racing shutdown don't error.
    pub async fn send(&self, dest: PeerAddr, payload: &[u8]) -> Result<()> {
        if !self.registry.is_running() {
            debug!(%dest, "server not running, discarding frame");
            return Ok(());
        }
        if dest == self.local {
            self.registry.receiver().receive(dest, payload);
            return Ok(());
        }
        let conn = self.registry.get_or_create(dest).await?;
        if let Err(err) = conn.send(payload).await {
            // the connection is unusable; drop it so the next send rebuilds
            self.registry.drop_connection(dest, &conn);
            return Err(err);
        }
        Ok(())
    }

    /// Sends one frame to every peer currently in the table. Failures are
    /// logged per peer and do not stop the fan-out.
    pub async fn send_to_all(&self, payload: &[u8]) {
        if !self.registry.is_running() {
            return;
        }
        for (addr, conn) in self.registry.snapshot() {
            if let Err(err) = conn.send(payload).await {
                warn!(peer = %addr, error = %err, "send failed, dropping connection");
                self.registry.drop_connection(addr, &conn);
            }
        }
    }

    /// Stops accepting, closes every connection and silences all listeners.
    /// Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
        self.registry.stop();
        info!(local = %self.local, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tries each port in `[start_port, start_port + port_range]` in order and
/// binds the first free one. Port 0 delegates the choice to the OS.
fn bind_in_range(config: &LinkConfig) -> Result<TcpListener> {
    let end = config.start_port.saturating_add(config.port_range);
    for port in config.start_port..=end {
        let addr = SocketAddr::new(config.bind_addr, port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(size) = config.recv_buf_size {
            socket.set_recv_buffer_size(size)?;
        }
        match socket.bind(addr) {
            Ok(()) => return Ok(socket.listen(LISTEN_BACKLOG)?),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(%addr, "port in use, trying next");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(LinkError::NoFreePort {
        start: config.start_port,
        end,
    })
}

async fn accept_loop(listener: TcpListener, registry: std::sync::Weak<ConnectionRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, raw_peer)) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                debug!(from = %raw_peer, "accepted inbound socket");
                tokio::spawn(admit(stream, registry));
            }
            Err(err) => {
                if registry.upgrade().is_none() {
                    break;
                }
                // transient accept errors (fd exhaustion etc) must not kill
                // the loop
                warn!(error = %err, "accept failed");
            }
        }
    }
}

/// Handshakes an accepted socket off the accept loop, then lets the registry
/// decide whether the connection survives the duplicate race.
async fn admit(stream: TcpStream, registry: Arc<ConnectionRegistry>) {
    match Connection::accept(stream, &registry).await {
        Ok(conn) => {
            if registry.admit_accepted(Arc::clone(&conn)) {
                conn.start(&registry);
            } else {
                debug!(peer = %conn.peer(), "dropped duplicate inbound connection");
            }
        }
        Err(err) => {
            debug!(error = %err, "inbound handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_on(port: u16, range: u16) -> LinkConfig {
        let mut config = LinkConfig::default();
        config.start_port = port;
        config.port_range = range;
        config
    }

    #[tokio::test]
    async fn bind_probes_past_occupied_ports() {
        // occupy a port, then ask for a range starting at it
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let listener = bind_in_range(&config_on(taken, 10)).unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert_ne!(bound, taken);
        assert!(bound > taken && bound <= taken + 10);
    }

    #[tokio::test]
    async fn bind_fails_when_range_exhausted() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let err = bind_in_range(&config_on(taken, 0)).unwrap_err();
        assert!(matches!(
            err,
            LinkError::NoFreePort { start, end } if start == taken && end == taken
        ));
    }

    #[tokio::test]
    async fn bind_port_zero_uses_ephemeral() {
        let listener = bind_in_range(&config_on(0, 0)).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
