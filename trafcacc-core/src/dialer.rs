//! Frontend side: dialing the links and opening virtual connections.
//!
//! [`Dialer::setup`] registers one upstream group per address range and
//! starts a connect loop per link. Each loop keeps its link connected:
//! dial, run the read and keepalive loops until the link fails, wait
//! `redial_delay`, dial again.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::conn::Conn;
use crate::control::EngineConfig;
use crate::endpoint::Endpoint;
use crate::node::Node;
use crate::proto::{now_nanos, Cmd, Packet};
use crate::sequencer::ConnKey;
use crate::transport::{self, LinkReader, Proto, TransportError};
use crate::upstream::{PoolError, Upstream, UpstreamPool};

/// Dial errors
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Timed out waiting for an alive upstream")]
    Timeout,

    #[error("Dialer is shut down")]
    Shutdown,

    #[error("Failed to send connect: {0}")]
    Connect(#[from] PoolError),
}

/// Opens virtual connections over a pool of dialed links
pub struct Dialer {
    node: Arc<Node>,
    pool: Arc<UpstreamPool>,
    next_conn: AtomicU32,
    next_group: AtomicUsize,
    cancel: CancellationToken,
}

impl Dialer {
    /// Create a dialer with a fresh random identity
    pub fn new(config: EngineConfig) -> Self {
        Self::with_identity(rand::random(), config)
    }

    pub fn with_identity(identity: u32, config: EngineConfig) -> Self {
        let pool = Arc::new(UpstreamPool::new());
        let node = Node::frontend(identity, config, Arc::clone(&pool));
        let cancel = node.cancel_token();
        tracing::debug!(identity = format_args!("{identity:08x}"), "dialer created");
        Self {
            node,
            pool,
            next_conn: AtomicU32::new(0),
            next_group: AtomicUsize::new(0),
            cancel,
        }
    }

    pub fn identity(&self) -> u32 {
        self.node.identity()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Register every address in `endpoints` and start dialing.
    ///
    /// Each endpoint becomes its own group. Returns the number of links
    /// registered. Must be called from within a Tokio runtime.
    pub fn setup(&self, endpoints: &[Endpoint]) -> usize {
        let mut registered = 0;
        for endpoint in endpoints {
            let group = self.next_group.fetch_add(1, Ordering::SeqCst);
            if endpoint.proto == Proto::Udp {
                self.node.use_datagram_links();
            }
            for addr in endpoint.addrs() {
                let upstream = Arc::new(Upstream::new(endpoint.proto, addr, group));
                self.pool.append(Arc::clone(&upstream));
                tokio::spawn(connect_loop(
                    Arc::clone(&self.node),
                    Arc::clone(&self.pool),
                    upstream,
                    self.cancel.clone(),
                ));
                registered += 1;
            }
            tracing::info!(endpoint = %endpoint, group, "upstream group registered");
        }
        registered
    }

    /// Open a connection, waiting for a live link as long as it takes.
    pub async fn dial(&self) -> Result<Conn, DialError> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(DialError::Shutdown),
            _ = self.pool.wait_for_alive() => {}
        }
        self.open().await
    }

    /// Open a connection, giving up if no link is alive within `timeout`.
    ///
    /// A zero timeout waits forever.
    pub async fn dial_timeout(&self, timeout: Duration) -> Result<Conn, DialError> {
        if timeout.is_zero() {
            return self.dial().await;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(DialError::Shutdown),
            ready = tokio::time::timeout(timeout, self.pool.wait_for_alive()) => {
                ready.map_err(|_| DialError::Timeout)?;
            }
        }
        self.open().await
    }

    async fn open(&self) -> Result<Conn, DialError> {
        let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let key = ConnKey::new(self.identity(), conn_id);
        let conn = self.node.open(key);

        let connect = Packet::control(Cmd::Connect, key.sender_id, key.conn_id, conn.next_seq());
        self.node.write(&connect).await?;
        tracing::debug!(conn = %key, "connection opened");
        Ok(conn)
    }

    /// Stop every link loop and wake every reader.
    pub fn shutdown(&self) {
        self.node.shutdown();
        for link in self.pool.links() {
            link.close();
        }
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn connect_loop(
    node: Arc<Node>,
    pool: Arc<UpstreamPool>,
    upstream: Arc<Upstream>,
    cancel: CancellationToken,
) {
    let redial_delay = node.config().redial_delay;
    let keepalive = node.config().keepalive_interval;

    while !cancel.is_cancelled() {
        match transport::dial(upstream.proto(), upstream.addr()).await {
            Ok((reader, writer)) => {
                let session = upstream.attach(writer).await;
                pool.mark_alive(&upstream);
                tracing::info!(proto = %upstream.proto(), addr = %upstream.addr(), "upstream connected");

                tokio::spawn(ping_loop(
                    node.identity(),
                    Arc::clone(&upstream),
                    keepalive,
                    session.clone(),
                ));

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = session.cancelled() => {}
                    _ = read_loop(&node, &pool, &upstream, reader) => {}
                }
                upstream.close();
            }
            Err(e) => {
                tracing::warn!(proto = %upstream.proto(), addr = %upstream.addr(), error = %e, "dial upstream failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(redial_delay) => {}
        }
    }
    upstream.close();
}

async fn read_loop(node: &Arc<Node>, pool: &UpstreamPool, upstream: &Upstream, mut reader: LinkReader) {
    loop {
        let packet = match reader.recv().await {
            Ok(packet) => packet,
            Err(TransportError::Protocol(e)) if reader.is_datagram() => {
                tracing::warn!(addr = %upstream.addr(), error = %e, "invalid packet");
                continue;
            }
            Err(e) => {
                tracing::warn!(addr = %upstream.addr(), error = %e, "upstream read failed");
                return;
            }
        };

        match packet.cmd() {
            Cmd::Ping => {
                pool.mark_alive(upstream);
                let rtt = now_nanos().saturating_sub(packet.timestamp());
                if rtt > 0 {
                    upstream.record_rtt(Duration::from_nanos(rtt as u64));
                }
                tracing::trace!(addr = %upstream.addr(), rtt_us = rtt / 1_000, "keepalive answered");
            }
            _ => node.proc(packet).await,
        }
    }
}

async fn ping_loop(
    identity: u32,
    upstream: Arc<Upstream>,
    interval: Duration,
    session: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = tick.tick() => {}
        }
        // A failed send has already closed the link if this session owned it.
        match upstream.send_on(&session, &Packet::ping(identity)).await {
            Ok(()) => {}
            Err(TransportError::Closed) => return,
            Err(e) => {
                tracing::warn!(addr = %upstream.addr(), error = %e, "keepalive failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UDP_RECV_BUF_SIZE;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_dial_timeout_without_links() {
        let dialer = Dialer::new(EngineConfig::default());
        let res = dialer.dial_timeout(Duration::from_millis(30)).await;
        assert!(matches!(res, Err(DialError::Timeout)));
    }

    #[tokio::test]
    async fn test_dial_after_shutdown() {
        let dialer = Dialer::new(EngineConfig::default());
        dialer.shutdown();
        assert!(matches!(dialer.dial().await, Err(DialError::Shutdown)));
    }

    #[tokio::test]
    async fn test_setup_groups_and_connect_packet() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let endpoints = vec![
            Endpoint {
                proto: Proto::Udp,
                host: "127.0.0.1".into(),
                port_begin: port,
                port_end: port,
            },
            Endpoint {
                proto: Proto::Tcp,
                host: "127.0.0.1".into(),
                port_begin: 1,
                port_end: 2,
            },
        ];

        let dialer = Dialer::with_identity(0x1234, EngineConfig::default());
        assert_eq!(dialer.setup(&endpoints), 3);
        assert_eq!(dialer.pool().group_count(), 2);

        let conn = dialer.dial_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(conn.key(), ConnKey::new(0x1234, 1));

        // The keepalive and the connect both arrive on the UDP link.
        let mut buf = [0u8; UDP_RECV_BUF_SIZE];
        let mut saw_connect = false;
        for _ in 0..4 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let packet = Packet::decode(&buf[..n]).unwrap();
            assert_eq!(packet.sender_id(), 0x1234);
            if packet.cmd() == Cmd::Connect {
                assert_eq!(packet.seq_id(), 1);
                saw_connect = true;
                break;
            }
        }
        assert!(saw_connect);
    }
}
