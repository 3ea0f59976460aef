//! Physical links and the pool that spreads packets across them.
//!
//! An [`Upstream`] is one TCP or UDP link. It carries a liveness timestamp
//! (last connect or keepalive answer), a closed flag and the write half of the
//! current connection. The dial/read/keepalive loops that drive a link live in
//! [`crate::dialer`] and [`crate::listener`]; this module only owns the state.
//!
//! [`UpstreamPool`] groups links (one group per configured address range) and
//! implements outbound selection:
//!
//! - **data**: round-robin over live links, falling through to the next live
//!   link when a send fails
//! - **connect / close / closed**: sent on every live link; duplicates are
//!   absorbed by the receiving sequencer

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::proto::{now_nanos, Packet};
use crate::transport::{LinkWriter, Proto, TransportError};

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No alive upstream link")]
    NoAliveUpstream,

    #[error("Send on {addr} failed: {source}")]
    Send {
        addr: String,
        #[source]
        source: TransportError,
    },
}

/// One physical link
pub struct Upstream {
    proto: Proto,
    addr: String,
    group: usize,
    /// Unix nanos of the last connect or keepalive answer; 0 while down
    alive: AtomicI64,
    closed: AtomicBool,
    rtt_nanos: AtomicI64,
    writer: tokio::sync::Mutex<Option<LinkWriter>>,
    /// Cancelled when the current connection of this link ends
    session: Mutex<CancellationToken>,
}

impl Upstream {
    /// Create a link descriptor that is not connected yet
    pub fn new(proto: Proto, addr: impl Into<String>, group: usize) -> Self {
        let session = CancellationToken::new();
        session.cancel();
        Self {
            proto,
            addr: addr.into(),
            group,
            alive: AtomicI64::new(0),
            closed: AtomicBool::new(true),
            rtt_nanos: AtomicI64::new(0),
            writer: tokio::sync::Mutex::new(None),
            session: Mutex::new(session),
        }
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn group(&self) -> usize {
        self.group
    }

    /// Install the write half of a fresh connection and open the link.
    ///
    /// Returns the token that is cancelled when this connection is closed;
    /// read and keepalive loops stop on it. The previous session is cancelled
    /// before the new writer becomes visible, so its loops can never send on
    /// the new connection.
    pub async fn attach(&self, writer: LinkWriter) -> CancellationToken {
        let token = CancellationToken::new();
        let mut slot = self.writer.lock().await;
        {
            let mut session = self.session.lock();
            session.cancel();
            *session = token.clone();
        }
        *slot = Some(writer);
        self.closed.store(false, Ordering::SeqCst);
        token
    }

    /// Token of the current connection
    pub fn session(&self) -> CancellationToken {
        self.session.lock().clone()
    }

    /// Record a successful connect or keepalive exchange
    pub fn mark_alive(&self) {
        self.alive.store(now_nanos().max(1), Ordering::SeqCst);
    }

    /// Unix nanos of the last liveness signal, if the link is up
    pub fn alive_since(&self) -> Option<i64> {
        match self.alive.load(Ordering::SeqCst) {
            0 => None,
            t => Some(t),
        }
    }

    /// Open and seen alive at least once since it was (re)connected
    pub fn is_alive(&self) -> bool {
        !self.is_closed() && self.alive.load(Ordering::SeqCst) != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn record_rtt(&self, rtt: Duration) {
        self.rtt_nanos
            .store(rtt.as_nanos().min(i64::MAX as u128) as i64, Ordering::Relaxed);
    }

    /// Last measured keepalive round trip
    pub fn rtt(&self) -> Option<Duration> {
        match self.rtt_nanos.load(Ordering::Relaxed) {
            n if n > 0 => Some(Duration::from_nanos(n as u64)),
            _ => None,
        }
    }

    /// Send one packet on the current connection.
    ///
    /// A failed send closes the link, except for a packet too large for a
    /// datagram, which says nothing about the link itself.
    pub async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        self.send_in(None, packet).await
    }

    /// Send one packet only if `session` is still the current connection.
    pub async fn send_on(&self, session: &CancellationToken, packet: &Packet) -> Result<(), TransportError> {
        self.send_in(Some(session), packet).await
    }

    async fn send_in(
        &self,
        session: Option<&CancellationToken>,
        packet: &Packet,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let slot = self.writer.lock().await;
        let current = self.session();
        if current.is_cancelled() || session.is_some_and(CancellationToken::is_cancelled) {
            return Err(TransportError::Closed);
        }

        let mut flight = InFlight {
            link: self,
            slot,
            done: false,
        };
        let Some(writer) = (*flight.slot).as_mut() else {
            return Err(TransportError::Closed);
        };
        let result = tokio::select! {
            sent = writer.send(packet) => sent,
            _ = current.cancelled() => Err(TransportError::Closed),
        };
        flight.done = true;

        match result {
            Ok(()) => Ok(()),
            Err(e @ TransportError::DatagramTooLarge(_)) => Err(e),
            Err(e) => {
                flight.slot.take();
                drop(flight);
                self.shut();
                Err(e)
            }
        }
    }

    /// Mark the link closed and stop the loops of its current connection.
    ///
    /// A send in progress is aborted and drops the writer itself.
    pub fn close(&self) {
        self.shut();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn shut(&self) {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        self.alive.store(0, Ordering::SeqCst);
        self.session.lock().cancel();
        if was_open {
            tracing::debug!(proto = %self.proto, addr = %self.addr, "upstream closed");
        }
    }
}

/// Writer held for one packet. Abandoned halfway, a stream link would carry
/// a truncated frame, so the writer is dropped and the link closed.
struct InFlight<'a> {
    link: &'a Upstream,
    slot: tokio::sync::MutexGuard<'a, Option<LinkWriter>>,
    done: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.done || !(*self.slot).as_ref().is_some_and(LinkWriter::is_stream) {
            return;
        }
        self.slot.take();
        self.link.shut();
        tracing::debug!(addr = %self.link.addr, "send abandoned mid-frame, link dropped");
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("proto", &self.proto)
            .field("addr", &self.addr)
            .field("group", &self.group)
            .field("alive", &self.is_alive())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Grouped set of physical links
pub struct UpstreamPool {
    groups: RwLock<Vec<Vec<Arc<Upstream>>>>,
    /// Round-robin cursor for data packets
    next: AtomicUsize,
    /// Bumped whenever a link becomes alive
    liveness: watch::Sender<u64>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        let (liveness, _rx) = watch::channel(0);
        Self {
            groups: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            liveness,
        }
    }

    /// Register a link in its group before it is dialed
    pub fn append(&self, upstream: Arc<Upstream>) {
        let mut groups = self.groups.write();
        let group = upstream.group();
        if groups.len() <= group {
            groups.resize_with(group + 1, Vec::new);
        }
        if !groups[group].iter().any(|u| Arc::ptr_eq(u, &upstream)) {
            groups[group].push(upstream);
        }
    }

    /// Drop a link from the pool. Returns `false` if it was not registered.
    pub fn remove(&self, upstream: &Arc<Upstream>) -> bool {
        let mut groups = self.groups.write();
        let Some(group) = groups.get_mut(upstream.group()) else {
            return false;
        };
        let before = group.len();
        group.retain(|u| !Arc::ptr_eq(u, upstream));
        group.len() != before
    }

    /// Snapshot of every registered link
    pub fn links(&self) -> Vec<Arc<Upstream>> {
        self.groups.read().iter().flatten().cloned().collect()
    }

    /// Snapshot of the links currently usable
    pub fn alive_links(&self) -> Vec<Arc<Upstream>> {
        self.groups
            .read()
            .iter()
            .flatten()
            .filter(|u| u.is_alive())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.read().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    pub fn alive_count(&self) -> usize {
        self.groups
            .read()
            .iter()
            .flatten()
            .filter(|u| u.is_alive())
            .count()
    }

    /// Mark `upstream` alive and wake everyone in [`Self::wait_for_alive`].
    pub fn mark_alive(&self, upstream: &Upstream) {
        upstream.mark_alive();
        self.liveness.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    /// Wait until at least one link is alive.
    pub async fn wait_for_alive(&self) {
        let mut rx = self.liveness.subscribe();
        loop {
            if self.alive_count() > 0 {
                return;
            }
            // The sender lives as long as `self`, so this only returns on change.
            let _ = rx.changed().await;
        }
    }

    /// Transmit a packet: striped for data, on every live link for control.
    pub async fn write(&self, packet: &Packet) -> Result<(), PoolError> {
        if packet.cmd().is_control() {
            self.broadcast(packet).await
        } else {
            self.stripe(packet).await
        }
    }

    async fn stripe(&self, packet: &Packet) -> Result<(), PoolError> {
        let links = self.alive_links();
        if links.is_empty() {
            return Err(PoolError::NoAliveUpstream);
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for i in 0..links.len() {
            let link = &links[start.wrapping_add(i) % links.len()];
            match link.send(packet).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(addr = %link.addr(), error = %e, "upstream send failed, trying next link");
                    last_err = Some(PoolError::Send {
                        addr: link.addr().to_string(),
                        source: e,
                    });
                }
            }
        }
        Err(last_err.unwrap_or(PoolError::NoAliveUpstream))
    }

    async fn broadcast(&self, packet: &Packet) -> Result<(), PoolError> {
        let links = self.alive_links();
        let mut sent = false;
        let mut last_err = None;
        for link in &links {
            match link.send(packet).await {
                Ok(()) => sent = true,
                Err(e) => {
                    tracing::warn!(addr = %link.addr(), cmd = %packet.cmd(), error = %e, "upstream broadcast failed");
                    last_err = Some(PoolError::Send {
                        addr: link.addr().to_string(),
                        source: e,
                    });
                }
            }
        }
        if sent {
            Ok(())
        } else {
            Err(last_err.unwrap_or(PoolError::NoAliveUpstream))
        }
    }
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new()
    }
}
