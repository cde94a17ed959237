//! Connection table keyed by peer address, plus the policies that keep it
//! consistent: single construction of outbound connections, deterministic
//! resolution of the simultaneous-connect race, membership-driven pruning
//! and idle reaping.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::LinkConfig;
use crate::connection::Connection;
use crate::{PeerAddr, Result};

/// Callback for inbound frames. Invoked from the reader task of the
/// connection the frame arrived on; implementations that block stall only
/// that one connection.
pub trait Receiver: Send + Sync {
    fn receive(&self, sender: PeerAddr, frame: &[u8]);
}

impl<F> Receiver for F
where
    F: Fn(PeerAddr, &[u8]) + Send + Sync,
{
    fn receive(&self, sender: PeerAddr, frame: &[u8]) {
        self(sender, frame)
    }
}

/// Observer of connection lifecycle. Both methods default to no-ops so
/// implementations override only what they need.
pub trait ConnectionListener: Send + Sync {
    fn connection_opened(&self, _peer: PeerAddr) {}
    fn connection_closed(&self, _peer: PeerAddr) {}
}

/// The per-node connection table. One entry per peer; at most one live
/// connection serves each direction of traffic.
pub struct ConnectionRegistry {
    local: PeerAddr,
    config: LinkConfig,
    receiver: Arc<dyn Receiver>,
    conns: Mutex<HashMap<PeerAddr, Arc<Connection>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    /// Serializes outbound connection construction so concurrent sends to
    /// the same (or different) new peers build each connection once.
    connect_lock: AsyncMutex<()>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(local: PeerAddr, config: LinkConfig, receiver: Arc<dyn Receiver>) -> Arc<Self> {
        Arc::new(Self {
            local,
            config,
            receiver,
            conns: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            connect_lock: AsyncMutex::new(()),
            reaper_task: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.local
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub(crate) fn receiver(&self) -> Arc<dyn Receiver> {
        Arc::clone(&self.receiver)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the open connection to `addr`, establishing one first if the
    /// table has none (or only a dead one). Connection construction is
    /// serialized; the fast path for an existing connection takes only the
    /// table lock.
    pub async fn get_or_create(self: &Arc<Self>, addr: PeerAddr) -> Result<Arc<Connection>> {
        if !self.is_running() {
            return Err(crate::LinkError::NotRunning);
        }
        if let Some(conn) = self.lookup_open(addr) {
            return Ok(conn);
        }
        let _guard = self.connect_lock.lock().await;
        // re-check: another caller (or the acceptor) may have installed one
        // while we waited
        if let Some(conn) = self.lookup_open(addr) {
            return Ok(conn);
        }
        let conn = Connection::connect(addr, self).await?;
        let (conn, installed) = self.install_dialed(addr, conn);
        if installed {
            conn.start(self);
        }
        Ok(conn)
    }

    /// Installs a freshly dialed connection, unless the acceptor admitted
    /// the peer's inbound connection while we were dialing. In that race the
    /// admitted connection is the tie-break winner on both sides; the dialed
    /// one is closed and the winner returned, so a late dial can never
    /// displace it. Returns the connection to use and whether the dialed
    /// one was installed.
    fn install_dialed(&self, addr: PeerAddr, conn: Arc<Connection>) -> (Arc<Connection>, bool) {
        let decision = {
            let mut conns = self.conns.lock().unwrap();
            match conns.get(&addr) {
                Some(existing) if existing.is_open() => Err(Arc::clone(existing)),
                _ => Ok(conns.insert(addr, Arc::clone(&conn))),
            }
        };
        match decision {
            Err(existing) => {
                debug!(peer = %addr, "connection appeared while dialing, keeping it");
                conn.close();
                (existing, false)
            }
            Ok(displaced) => {
                // only a dead entry can be displaced here
                if let Some(old) = displaced {
                    old.close();
                }
                self.notify_opened(addr);
                (conn, true)
            }
        }
    }

    fn lookup_open(&self, addr: PeerAddr) -> Option<Arc<Connection>> {
        let conns = self.conns.lock().unwrap();
        conns.get(&addr).filter(|conn| conn.is_open()).cloned()
    }

    /// Installs `conn` under `addr`, closing whatever entry it displaces.
    /// The displaced connection gets no "closed" notification: from the
    /// listener's view the peer stayed connected throughout.
    pub(crate) fn insert(&self, addr: PeerAddr, conn: Arc<Connection>) {
        let displaced = { self.conns.lock().unwrap().insert(addr, conn) };
        if let Some(old) = displaced {
            debug!(peer = %addr, "replacing existing connection");
            old.close();
        }
        self.notify_opened(addr);
    }

    /// Decides the fate of an accepted connection under the table lock.
    ///
    /// With no live entry for the peer the connection is installed. With a
    /// live entry both nodes are dialing each other at once; the incoming
    /// connection wins only when the peer's address orders strictly above
    /// ours, so both sides keep the same socket. Returns whether the
    /// connection was admitted; a rejected connection is closed here.
    pub(crate) fn admit_accepted(&self, conn: Arc<Connection>) -> bool {
        let peer = conn.peer();
        let verdict = {
            let mut conns = self.conns.lock().unwrap();
            if !self.is_running() {
                // an admission task that finished its handshake after stop()
                // must not repopulate the drained table
                Err("registry stopped")
            } else {
                let keep_existing = conns
                    .get(&peer)
                    .map(|existing| existing.is_open() && peer <= self.local)
                    .unwrap_or(false);
                if keep_existing {
                    Err("keeping ours")
                } else {
                    Ok(conns.insert(peer, Arc::clone(&conn)))
                }
            }
        };
        match verdict {
            Err(reason) => {
                debug!(peer = %peer, reason, "rejecting incoming connection");
                conn.close();
                false
            }
            Ok(old) => {
                if let Some(old) = old {
                    debug!(peer = %peer, "incoming connection wins the race, replacing ours");
                    old.close();
                }
                self.notify_opened(peer);
                true
            }
        }
    }

    /// Removes the entry for `addr` only if it still is `conn`; an entry
    /// that was already replaced by a newer connection is left alone.
    pub(crate) fn remove_if_current(&self, addr: PeerAddr, conn: &Arc<Connection>) -> bool {
        let mut conns = self.conns.lock().unwrap();
        match conns.get(&addr) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                conns.remove(&addr);
                true
            }
            _ => false,
        }
    }

    /// Closes and removes every connection whose peer is not in `current`.
    /// Used after a membership change; the departures were already announced
    /// at that level, so no "closed" notifications fire here.
    pub fn retain(&self, current: &HashSet<PeerAddr>) {
        let removed: Vec<Arc<Connection>> = {
            let mut conns = self.conns.lock().unwrap();
            let gone: Vec<PeerAddr> = conns
                .keys()
                .filter(|addr| !current.contains(addr))
                .copied()
                .collect();
            gone.iter().filter_map(|addr| conns.remove(addr)).collect()
        };
        for conn in removed {
            debug!(peer = %conn.peer(), "pruning connection to departed member");
            conn.close();
        }
    }

    pub fn contains(&self, addr: PeerAddr) -> bool {
        self.conns.lock().unwrap().contains_key(&addr)
    }

    pub fn size(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn open_count(&self) -> usize {
        self.conns
            .lock()
            .unwrap()
            .values()
            .filter(|conn| conn.is_open())
            .count()
    }

    pub fn peers(&self) -> Vec<PeerAddr> {
        self.conns.lock().unwrap().keys().copied().collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<(PeerAddr, Arc<Connection>)> {
        self.conns
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, conn)| (*addr, Arc::clone(conn)))
            .collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    fn notify_opened(&self, peer: PeerAddr) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.connection_opened(peer);
        }
    }

    pub(crate) fn notify_closed(&self, peer: PeerAddr) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.connection_closed(peer);
        }
    }

    /// Closes and removes the entry for `addr` if it still is `conn`, firing
    /// the "closed" notification when it was. Used when a send on the
    /// connection failed.
    pub(crate) fn drop_connection(&self, addr: PeerAddr, conn: &Arc<Connection>) {
        conn.close();
        if self.remove_if_current(addr, conn) {
            self.notify_closed(addr);
        }
    }

    /// Spawns the periodic idle-connection reaper, if configured.
    pub(crate) fn start_reaper(self: &Arc<Self>) {
        if self.config.reap_interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.reap_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.reap(Instant::now());
            }
        });
        *self.reaper_task.lock().unwrap() = Some(handle);
    }

    /// One reaper sweep: closes and removes every expired connection.
    /// Notifications fire after the table lock is released.
    pub(crate) fn reap(&self, now: Instant) {
        let mut reaped = Vec::new();
        {
            let mut conns = self.conns.lock().unwrap();
            conns.retain(|addr, conn| {
                if conn.is_expired(now) {
                    debug!(peer = %addr, "reaping idle connection");
                    conn.close();
                    reaped.push(*addr);
                    false
                } else {
                    true
                }
            });
        }
        for addr in reaped {
            self.notify_closed(addr);
        }
    }

    /// Shuts the registry down: stops the reaper, then clears the listener
    /// list so teardown fires no notifications, then closes and drains every
    /// connection. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.reaper_task.lock().unwrap().take() {
            handle.abort();
        }
        self.listeners.lock().unwrap().clear();
        let drained: Vec<Arc<Connection>> = {
            self.conns.lock().unwrap().drain().map(|(_, c)| c).collect()
        };
        for conn in drained {
            conn.close();
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("local", &self.local)
            .field("size", &self.size())
            .field("running", &self.is_running())
            .finish()
    }
}
