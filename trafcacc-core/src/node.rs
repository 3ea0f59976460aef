//! State shared by every link of one frontend or backend process.
//!
//! A [`Node`] owns the sequencer, the packet queues and the outbound routing.
//! Link read loops hand every sequenced packet to [`Node::proc`]; virtual
//! connections write through [`Node::write`].
//!
//! Packets that are next in line (or already delivered) are admitted on the
//! read loop itself. A packet that is ahead of a gap is parked in its own task
//! so that one stalled connection never holds up the other connections
//! sharing the link. Parking is bounded: at most `max_parked_packets` wait at
//! once (further read loops block until a slot frees up), and a packet more
//! than `reorder_window` ahead tears its connection down instead.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::conn::Conn;
use crate::control::{EngineConfig, Role};
use crate::proto::{Cmd, Packet, MAX_PAYLOAD_SIZE};
use crate::queue::{PacketQueue, PacketQueues};
use crate::sequencer::{Admission, ConnKey, Sequencer, SequencerError, Verdict};
use crate::transport::MAX_DATAGRAM_PAYLOAD;
use crate::upstream::{PoolError, Upstream, UpstreamPool};

/// Where outbound packets go
enum Outbound {
    /// Frontend: one pool of dialed links
    Pool(Arc<UpstreamPool>),
    /// Backend: the links each frontend (by sender id) reached us on
    PerSender(RwLock<HashMap<u32, Arc<UpstreamPool>>>),
}

/// Shared engine state of one process
pub struct Node {
    role: Role,
    identity: u32,
    config: EngineConfig,
    sequencer: Sequencer,
    queues: PacketQueues,
    outbound: Outbound,
    accepted: Option<mpsc::Sender<Conn>>,
    /// Slots for packets waiting on a gap
    parked: Arc<Semaphore>,
    /// Set once any link is UDP; payloads then fit one datagram
    datagram_links: AtomicBool,
    cancel: CancellationToken,
}

impl Node {
    /// Node of a frontend that dials the links in `pool`
    pub fn frontend(identity: u32, config: EngineConfig, pool: Arc<UpstreamPool>) -> Arc<Self> {
        Arc::new(Self::new(Role::Frontend, identity, config, Outbound::Pool(pool), None))
    }

    /// Node of a backend; connections opened by peers are sent on `accepted`
    pub fn backend(identity: u32, config: EngineConfig, accepted: mpsc::Sender<Conn>) -> Arc<Self> {
        Arc::new(Self::new(
            Role::Backend,
            identity,
            config,
            Outbound::PerSender(RwLock::new(HashMap::new())),
            Some(accepted),
        ))
    }

    fn new(
        role: Role,
        identity: u32,
        mut config: EngineConfig,
        outbound: Outbound,
        accepted: Option<mpsc::Sender<Conn>>,
    ) -> Self {
        config.mtu = config.mtu.clamp(1, MAX_PAYLOAD_SIZE);
        config.max_parked_packets = config.max_parked_packets.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            role,
            identity,
            sequencer: Sequencer::new(config.sequencer_capacity),
            parked: Arc::new(Semaphore::new(config.max_parked_packets)),
            config,
            queues: PacketQueues::new(),
            outbound,
            accepted,
            datagram_links: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Random identity of this process
    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Payload bytes per data packet
    pub fn mtu(&self) -> usize {
        if self.datagram_links.load(Ordering::Relaxed) {
            self.config.mtu.min(MAX_DATAGRAM_PAYLOAD)
        } else {
            self.config.mtu
        }
    }

    /// Record that packets may travel as UDP datagrams.
    pub fn use_datagram_links(&self) {
        if !self.datagram_links.swap(true, Ordering::Relaxed) && self.config.mtu > MAX_DATAGRAM_PAYLOAD {
            tracing::warn!(
                mtu = self.config.mtu,
                max = MAX_DATAGRAM_PAYLOAD,
                "mtu does not fit a UDP datagram, clamping"
            );
        }
    }

    /// Out-of-order packets currently waiting for their gap
    pub fn parked(&self) -> usize {
        self.config.max_parked_packets - self.parked.available_permits()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn queues(&self) -> &PacketQueues {
        &self.queues
    }

    /// Cancelled on [`Node::shutdown`]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pool carrying packets to `sender_id`.
    ///
    /// A frontend has a single pool whatever the sender.
    pub fn pool_for(&self, sender_id: u32) -> Option<Arc<UpstreamPool>> {
        match &self.outbound {
            Outbound::Pool(pool) => Some(Arc::clone(pool)),
            Outbound::PerSender(pools) => pools.read().get(&sender_id).cloned(),
        }
    }

    /// Backend: remember that `link` reaches frontend `sender_id`.
    pub fn register_link(&self, sender_id: u32, link: &Arc<Upstream>) {
        let Outbound::PerSender(pools) = &self.outbound else {
            return;
        };
        let pool = {
            let mut pools = pools.write();
            Arc::clone(
                pools
                    .entry(sender_id)
                    .or_insert_with(|| Arc::new(UpstreamPool::new())),
            )
        };
        pool.append(Arc::clone(link));
        pool.mark_alive(link);
        tracing::debug!(sender = format_args!("{sender_id:08x}"), addr = %link.addr(), links = pool.len(), "link registered");
    }

    /// Backend: forget `link`; senders left without links are dropped.
    pub fn unregister_link(&self, link: &Arc<Upstream>) {
        let Outbound::PerSender(pools) = &self.outbound else {
            return;
        };
        pools.write().retain(|_, pool| {
            pool.remove(link);
            !pool.is_empty()
        });
    }

    /// Send a packet of a virtual connection toward its peer.
    pub async fn write(&self, packet: &Packet) -> Result<(), PoolError> {
        let pool = self
            .pool_for(packet.sender_id())
            .ok_or(PoolError::NoAliveUpstream)?;
        pool.write(packet).await
    }

    /// Register a queue for `key` and wrap it in a connection handle.
    pub(crate) fn open(self: &Arc<Self>, key: ConnKey) -> Conn {
        let queue = self.queues.create(key);
        Conn::new(Arc::clone(self), key, queue)
    }

    /// Drop the queue and sequencer slot of a finished connection.
    pub fn release(&self, key: ConnKey) {
        let queue = self.queues.remove(key);
        let slot = self.sequencer.evict(key);
        if queue.is_some() || slot {
            tracing::debug!(conn = %key, "connection released");
        }
    }

    /// Handle one inbound packet of a virtual connection.
    ///
    /// Keepalives are answered by the link loops and never reach here.
    pub async fn proc(self: &Arc<Self>, packet: Packet) {
        let cmd = packet.cmd();
        if !cmd.is_sequenced() {
            return;
        }
        let key = ConnKey::new(packet.sender_id(), packet.conn_id());

        if self.role == Role::Frontend {
            if key.sender_id != self.identity {
                tracing::debug!(conn = %key, "dropping packet for another frontend");
                return;
            }
            if cmd == Cmd::Connect || self.queues.get(key).is_none() {
                tracing::trace!(conn = %key, %cmd, "dropping packet for unknown connection");
                return;
            }
        }

        let seq = packet.seq_id();
        match self.sequencer.peek(key, seq) {
            Verdict::MustWait => {
                let ahead = seq.wrapping_sub(self.sequencer.last(key).unwrap_or(0));
                if ahead > self.config.reorder_window {
                    tracing::warn!(conn = %key, seq, ahead, "packet beyond reorder window, tearing down connection");
                    self.release(key);
                    return;
                }
                let permit = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    permit = Arc::clone(&self.parked).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    node.admit(key, packet).await;
                    drop(permit);
                });
            }
            Verdict::Deliver | Verdict::Duplicate => self.admit(key, packet).await,
        }
    }

    async fn admit(self: &Arc<Self>, key: ConnKey, packet: Packet) {
        let cmd = packet.cmd();
        let seq = packet.seq_id();
        let payload = packet.payload;
        let mut accepted = None;

        let result = self
            .sequencer
            .admit(key, seq, &self.cancel, Some(self.config.stall_timeout), || {
                match cmd {
                    Cmd::Data => match self.queues.get(key) {
                        Some(queue) => {
                            if let Err(e) = queue.push(payload) {
                                tracing::debug!(error = %e, seq, "dropping data");
                            }
                        }
                        None => tracing::debug!(conn = %key, seq, "data for unknown connection"),
                    },
                    Cmd::Connect => {
                        if self.role == Role::Backend && self.queues.get(key).is_none() {
                            accepted = Some(self.open(key));
                        }
                    }
                    Cmd::Close | Cmd::Closed => {
                        if let Some(queue) = self.queues.get(key) {
                            queue.close();
                        }
                    }
                    Cmd::Ping => {}
                }
            })
            .await;

        match result {
            Ok(Admission::Delivered) => match cmd {
                Cmd::Close | Cmd::Closed => {
                    tracing::debug!(conn = %key, %cmd, "peer closed connection");
                    self.release(key);
                }
                Cmd::Connect => {
                    if let Some(conn) = accepted {
                        self.hand_over(conn);
                    }
                }
                _ => {}
            },
            Ok(Admission::Duplicate) => {
                tracing::trace!(conn = %key, seq, %cmd, "duplicate dropped");
            }
            Err(SequencerError::Stalled(seq)) => {
                tracing::warn!(conn = %key, seq, "sequence gap never closed, tearing down connection");
                self.release(key);
            }
            Err(SequencerError::TableFull { capacity }) => {
                tracing::warn!(conn = %key, capacity, %cmd, "sequencer full, dropping packet");
            }
            Err(e @ (SequencerError::Evicted | SequencerError::Cancelled)) => {
                tracing::trace!(conn = %key, seq, error = %e, "packet discarded");
            }
        }
    }

    /// Queue an opened connection for `accept` without blocking the link.
    fn hand_over(&self, conn: Conn) {
        let key = conn.key();
        let Some(accepted) = &self.accepted else {
            return;
        };
        match accepted.try_send(conn) {
            Ok(()) => tracing::debug!(conn = %key, "connection accepted"),
            Err(TrySendError::Full(conn)) => {
                tracing::warn!(conn = %key, "accept backlog full, refusing connection");
                tokio::spawn(async move {
                    let _ = conn.close().await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(conn = %key, "no one accepting, dropping connection");
            }
        }
    }

    /// Queue of a live connection
    pub fn queue(&self, key: ConnKey) -> Option<Arc<PacketQueue>> {
        self.queues.get(key)
    }

    /// Stop pending admissions and wake every reader.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.queues.close_all();
    }
}
