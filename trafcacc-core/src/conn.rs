//! Virtual connections: ordered byte streams multiplexed over the links.
//!
//! Writes are cut into MTU sized data packets, each with the next sequence
//! number of the connection. Reads return bytes in sequence order, drained
//! from the connection's packet queue into a local buffer.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;

use crate::control::Role;
use crate::node::Node;
use crate::proto::{Cmd, Packet, ProtocolError};
use crate::queue::PacketQueue;
use crate::sequencer::ConnKey;
use crate::upstream::PoolError;

/// Connection errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnError {
    #[error("Connection closed")]
    Closed,

    #[error("I/O timeout")]
    Timeout,

    #[error("Write failed: {0}")]
    Write(Arc<PoolError>),

    #[error("Invalid packet: {0}")]
    Packet(#[from] ProtocolError),
}

impl From<ConnError> for io::Error {
    fn from(e: ConnError) -> Self {
        let kind = match &e {
            ConnError::Closed => io::ErrorKind::BrokenPipe,
            ConnError::Timeout => io::ErrorKind::TimedOut,
            ConnError::Write(_) => io::ErrorKind::Other,
            ConnError::Packet(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

/// Lifecycle of a connection as seen locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// One side has closed; buffered data may still be read
    Closing,
    /// Closed locally or by the peer, and fully drained
    Closed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

/// One virtual connection
pub struct Conn {
    node: Arc<Node>,
    key: ConnKey,
    queue: Arc<PacketQueue>,
    seq: AtomicU32,
    reader: tokio::sync::Mutex<BytesMut>,
    eof_reported: AtomicBool,
    /// Held across a whole write so chunks of two writes never interleave
    writer: tokio::sync::Mutex<()>,
    werr: OnceLock<ConnError>,
    local_closed: AtomicBool,
    deadlines: Mutex<Deadlines>,
}

impl Conn {
    pub(crate) fn new(node: Arc<Node>, key: ConnKey, queue: Arc<PacketQueue>) -> Self {
        Self {
            node,
            key,
            queue,
            seq: AtomicU32::new(0),
            reader: tokio::sync::Mutex::new(BytesMut::new()),
            eof_reported: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(()),
            werr: OnceLock::new(),
            local_closed: AtomicBool::new(false),
            deadlines: Mutex::new(Deadlines::default()),
        }
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    /// Allocate the next outbound sequence number
    pub(crate) fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub fn state(&self) -> ConnState {
        let local_closed = self.local_closed.load(Ordering::SeqCst);
        if self.queue.is_finished() && (local_closed || self.eof_reported.load(Ordering::SeqCst)) {
            ConnState::Closed
        } else if local_closed || self.queue.is_closed() {
            ConnState::Closing
        } else {
            ConnState::Open
        }
    }

    /// Set both deadlines; `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut d = self.deadlines.lock();
        d.read = deadline;
        d.write = deadline;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().read = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().write = deadline;
    }

    /// Read bytes in sequence order.
    ///
    /// Blocks until data is available. Returns `Ok(0)` once, when the
    /// connection is closed and everything buffered has been read; later
    /// reads fail with [`ConnError::Closed`].
    pub async fn read(&self, out: &mut [u8]) -> Result<usize, ConnError> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut buf = self.reader.lock().await;

        loop {
            if !buf.is_empty() {
                let n = out.len().min(buf.len());
                out[..n].copy_from_slice(&buf[..n]);
                buf.advance(n);
                return Ok(n);
            }

            if self.drain(&mut buf) > 0 {
                continue;
            }

            if self.queue.is_finished() {
                if self.eof_reported.swap(true, Ordering::SeqCst) {
                    return Err(ConnError::Closed);
                }
                return Ok(0);
            }

            let deadline = self.deadlines.lock().read;
            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, self.queue.wait_for_arrived())
                        .await
                        .map_err(|_| ConnError::Timeout)?;
                }
                None => self.queue.wait_for_arrived().await,
            }
        }
    }

    /// Move queued payloads into `buf` until it passes the read threshold.
    fn drain(&self, buf: &mut BytesMut) -> usize {
        let threshold = self.node.config().read_buffer_threshold;
        let mut moved = 0;
        while buf.len() < threshold.max(1) {
            let Some(chunk) = self.queue.pop() else {
                break;
            };
            moved += chunk.len();
            buf.extend_from_slice(&chunk);
        }
        moved
    }

    /// Write all of `data`, split into MTU sized packets.
    ///
    /// Any failure is sticky: once a packet may be missing from the stream,
    /// every later write returns the same error.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ConnError> {
        let _guard = self.writer.lock().await;
        if let Some(e) = self.werr.get() {
            return Err(e.clone());
        }
        if self.local_closed.load(Ordering::SeqCst) {
            return Err(ConnError::Closed);
        }

        let deadline = self.deadlines.lock().write;
        for chunk in data.chunks(self.node.mtu()) {
            if let Err(e) = self.send_chunk(chunk, deadline).await {
                let _ = self.werr.set(e);
                return Err(self.werr.get().cloned().unwrap_or(ConnError::Closed));
            }
        }
        Ok(data.len())
    }

    async fn send_chunk(&self, chunk: &[u8], deadline: Option<Instant>) -> Result<(), ConnError> {
        let packet = Packet::new(
            Cmd::Data,
            self.key.sender_id,
            self.key.conn_id,
            self.next_seq(),
            Bytes::copy_from_slice(chunk),
        )?;
        let sent = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.node.write(&packet))
                .await
                .map_err(|_| ConnError::Timeout)?,
            None => self.node.write(&packet).await,
        };
        sent.map_err(|e| ConnError::Write(Arc::new(e)))
    }

    /// Tell the peer the connection is finished and stop accepting data.
    ///
    /// Pending readers drain what is buffered and then see end of stream.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), ConnError> {
        let _guard = self.writer.lock().await;
        if self.local_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let packet = self.close_packet();
        let sent = self.node.write(&packet).await;
        self.node.release(self.key);
        tracing::debug!(conn = %self.key, "connection closed");
        sent.map_err(|e| ConnError::Write(Arc::new(e)))
    }

    fn close_packet(&self) -> Packet {
        let cmd = match self.node.role() {
            Role::Frontend => Cmd::Close,
            Role::Backend => Cmd::Closed,
        };
        Packet::control(cmd, self.key.sender_id, self.key.conn_id, self.next_seq())
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if self.local_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.node.release(self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let packet = self.close_packet();
            let node = Arc::clone(&self.node);
            handle.spawn(async move {
                let _ = node.write(&packet).await;
            });
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("key", &self.key)
            .field("role", &self.node.role())
            .field("state", &self.state())
            .finish()
    }
}
