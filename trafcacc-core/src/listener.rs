//! Backend side: accepting links and the connections multiplexed on them.
//!
//! Every TCP connection is one link. A UDP port is shared by many links, one
//! per remote address. Keepalives are echoed straight back on the link they
//! came from; everything else goes to the [`Node`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conn::Conn;
use crate::control::EngineConfig;
use crate::endpoint::Endpoint;
use crate::node::Node;
use crate::proto::{now_nanos, Cmd, Packet};
use crate::transport::{LinkReader, LinkWriter, Proto, UDP_RECV_BUF_SIZE};
use crate::upstream::Upstream;

/// Connections waiting in [`Listener::accept`]
const ACCEPT_BACKLOG: usize = 128;

/// Listener errors
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("No listen address given")]
    NoEndpoints,

    #[error("Failed to bind {proto}://{addr}: {source}")]
    Bind {
        proto: Proto,
        addr: String,
        #[source]
        source: io::Error,
    },
}

enum Bound {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Accepts virtual connections opened by frontends
pub struct Listener {
    node: Arc<Node>,
    accepted: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    local_addrs: Vec<(Proto, SocketAddr)>,
    cancel: CancellationToken,
}

impl Listener {
    /// Bind every address in `endpoints` and start serving links.
    pub async fn bind(endpoints: &[Endpoint], config: EngineConfig) -> Result<Self, ListenError> {
        let mut bound = Vec::new();
        for endpoint in endpoints {
            for addr in endpoint.addrs() {
                let bind_err = |source| ListenError::Bind {
                    proto: endpoint.proto,
                    addr: addr.clone(),
                    source,
                };
                let socket = match endpoint.proto {
                    Proto::Tcp => Bound::Tcp(TcpListener::bind(&addr).await.map_err(bind_err)?),
                    Proto::Udp => Bound::Udp(UdpSocket::bind(&addr).await.map_err(bind_err)?),
                };
                bound.push(socket);
            }
        }
        if bound.is_empty() {
            return Err(ListenError::NoEndpoints);
        }

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let node = Node::backend(rand::random(), config, tx);
        let cancel = node.cancel_token();
        let mut local_addrs = Vec::with_capacity(bound.len());

        for socket in bound {
            match socket {
                Bound::Tcp(listener) => {
                    if let Ok(addr) = listener.local_addr() {
                        tracing::info!(%addr, "listening on tcp");
                        local_addrs.push((Proto::Tcp, addr));
                    }
                    tokio::spawn(accept_loop(Arc::clone(&node), listener, cancel.clone()));
                }
                Bound::Udp(socket) => {
                    node.use_datagram_links();
                    if let Ok(addr) = socket.local_addr() {
                        tracing::info!(%addr, "listening on udp");
                        local_addrs.push((Proto::Udp, addr));
                    }
                    tokio::spawn(serve_udp(Arc::clone(&node), Arc::new(socket), cancel.clone()));
                }
            }
        }

        Ok(Self {
            node,
            accepted: tokio::sync::Mutex::new(rx),
            local_addrs,
            cancel,
        })
    }

    /// Wait for the next connection opened by a frontend.
    ///
    /// Returns `None` once the listener is shut down.
    pub async fn accept(&self) -> Option<Conn> {
        let mut accepted = self.accepted.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            conn = accepted.recv() => conn,
        }
    }

    /// Addresses actually bound, in configuration order
    pub fn local_addrs(&self) -> &[(Proto, SocketAddr)] {
        &self.local_addrs
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Stop serving links and wake every reader.
    pub fn shutdown(&self) {
        self.node.shutdown();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(node: Arc<Node>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(serve_tcp(Arc::clone(&node), stream, peer, cancel.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_tcp(node: Arc<Node>, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let link = Arc::new(Upstream::new(Proto::Tcp, peer.to_string(), 0));
    let session = link.attach(LinkWriter::Tcp(writer)).await;
    let mut reader = LinkReader::Tcp(reader);
    let mut owner = None;
    tracing::debug!(%peer, "tcp link accepted");

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = session.cancelled() => break,
            received = reader.recv() => received,
        };
        match received {
            Ok(packet) => on_packet(&node, &link, &mut owner, packet).await,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "tcp link ended");
                break;
            }
        }
    }

    link.close();
    node.unregister_link(&link);
}

struct UdpPeer {
    link: Arc<Upstream>,
    owner: Option<u32>,
}

async fn serve_udp(node: Arc<Node>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let link_timeout = node.config().link_timeout;
    let mut peers: HashMap<SocketAddr, UdpPeer> = HashMap::new();
    let mut buf = [0u8; UDP_RECV_BUF_SIZE];
    let mut sweep = tokio::time::interval(link_timeout.max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let cutoff = now_nanos().saturating_sub(link_timeout.as_nanos() as i64);
                peers.retain(|addr, peer| {
                    let idle = peer.link.alive_since().map_or(true, |t| t < cutoff);
                    if idle || peer.link.is_closed() {
                        tracing::debug!(%addr, "udp link idle, dropping");
                        peer.link.close();
                        node.unregister_link(&peer.link);
                        false
                    } else {
                        true
                    }
                });
            }
            recv = socket.recv_from(&mut buf) => {
                let (n, addr) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(error = %e, "udp receive failed");
                        continue;
                    }
                };
                let packet = match Packet::decode(&buf[..n]) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(%addr, error = %e, "invalid packet");
                        continue;
                    }
                };

                if peers.get(&addr).map_or(true, |p| p.link.is_closed()) {
                    let link = Arc::new(Upstream::new(Proto::Udp, addr.to_string(), 0));
                    link.attach(LinkWriter::UdpTo { socket: Arc::clone(&socket), peer: addr }).await;
                    tracing::debug!(%addr, "udp link accepted");
                    if let Some(old) = peers.insert(addr, UdpPeer { link, owner: None }) {
                        node.unregister_link(&old.link);
                    }
                }
                if let Some(peer) = peers.get_mut(&addr) {
                    let link = Arc::clone(&peer.link);
                    on_packet(&node, &link, &mut peer.owner, packet).await;
                }
            }
        }
    }

    for peer in peers.into_values() {
        peer.link.close();
        node.unregister_link(&peer.link);
    }
}

/// Route one packet received on an accepted link.
async fn on_packet(node: &Arc<Node>, link: &Arc<Upstream>, owner: &mut Option<u32>, packet: Packet) {
    let sender = packet.sender_id();
    if *owner != Some(sender) {
        node.register_link(sender, link);
        *owner = Some(sender);
    } else {
        link.mark_alive();
    }

    if packet.cmd() == Cmd::Ping {
        if let Err(e) = link.send(&packet).await {
            tracing::warn!(addr = %link.addr(), error = %e, "keepalive echo failed");
        }
        return;
    }
    node.proc(packet).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{read_packet, write_packet};

    fn endpoint(proto: Proto) -> Endpoint {
        Endpoint {
            proto,
            host: "127.0.0.1".into(),
            port_begin: 0,
            port_end: 0,
        }
    }

    #[tokio::test]
    async fn test_bind_reports_local_addrs() {
        let listener = Listener::bind(&[endpoint(Proto::Tcp), endpoint(Proto::Udp)], EngineConfig::default())
            .await
            .unwrap();
        let addrs = listener.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].0, Proto::Tcp);
        assert_eq!(addrs[1].0, Proto::Udp);
        assert_ne!(addrs[0].1.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_empty() {
        let res = Listener::bind(&[], EngineConfig::default()).await;
        assert!(matches!(res, Err(ListenError::NoEndpoints)));
    }

    #[tokio::test]
    async fn test_tcp_ping_is_echoed() {
        let listener = Listener::bind(&[endpoint(Proto::Tcp)], EngineConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addrs()[0].1;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let ping = Packet::ping(42);
        write_packet(&mut stream, &ping).await.unwrap();
        let echo = tokio::time::timeout(Duration::from_secs(1), read_packet(&mut stream))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echo.cmd(), Cmd::Ping);
        assert_eq!(echo.timestamp(), ping.timestamp());

        assert_eq!(listener.node().pool_for(42).unwrap().alive_count(), 1);
    }

    #[tokio::test]
    async fn test_udp_connect_is_accepted() {
        let listener = Listener::bind(&[endpoint(Proto::Udp)], EngineConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addrs()[0].1;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::control(Cmd::Connect, 9, 1, 1);
        client.send_to(&connect.encode(), addr).await.unwrap();

        let conn = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.key().sender_id, 9);

        // Replies flow back over the link the connect came from.
        conn.write(b"pong").await.unwrap();
        let mut buf = [0u8; UDP_RECV_BUF_SIZE];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(reply.cmd(), Cmd::Data);
        assert_eq!(reply.seq_id(), 1);
        assert_eq!(&reply.payload[..], b"pong");
    }

    #[tokio::test]
    async fn test_accept_after_shutdown() {
        let listener = Listener::bind(&[endpoint(Proto::Tcp)], EngineConfig::default())
            .await
            .unwrap();
        listener.shutdown();
        assert!(listener.accept().await.is_none());
    }
}
