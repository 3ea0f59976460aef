//! Protocol definitions for the trafcacc packet multiplexer.
//!
//! This module defines the wire format of every packet exchanged over a
//! physical link, in either direction. The format is versioned and uses
//! network byte order (big-endian) for all multi-byte fields.
//!
//! # Packet Format
//!
//! - Magic number (4 bytes): Protocol identifier
//! - Version (1 byte): Protocol version
//! - Command (1 byte): data, connect, close, closed or ping
//! - Sender ID (4 bytes): Random per-process identity of the connection initiator
//! - Connection ID (4 bytes): Virtual connection, assigned by its initiator
//! - Sequence ID (4 bytes): Per-direction counter of the virtual connection
//! - Timestamp (8 bytes): Unix nanoseconds at send time
//! - Payload length (2 bytes): Length of the payload
//! - Payload (variable)
//!
//! Total header size: 28 bytes + variable payload

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic number identifying trafcacc packets (ASCII: "TRAF")
pub const PROTOCOL_MAGIC: u32 = 0x5452_4146;

/// Current protocol version
pub const CURRENT_VERSION: u8 = 1;

/// Default maximum payload carried by one packet
pub const DEFAULT_MTU: usize = 1400;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Protocol version information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u8);

impl ProtocolVersion {
    /// Get the current protocol version
    pub fn current() -> Self {
        Self(CURRENT_VERSION)
    }

    /// Check if this version is supported
    pub fn is_supported(&self) -> bool {
        self.0 == CURRENT_VERSION
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Packet command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    /// Payload-carrying packet
    Data = 0,
    /// Open a new virtual connection
    Connect = 1,
    /// Graceful shutdown sent by the initiator
    Close = 2,
    /// Graceful shutdown sent by the acceptor
    Closed = 3,
    /// Keepalive (echoed by the backend)
    Ping = 4,
}

impl Cmd {
    /// Commands that travel through the sequencer.
    pub fn is_sequenced(self) -> bool {
        matches!(self, Cmd::Data | Cmd::Connect | Cmd::Close | Cmd::Closed)
    }

    /// Commands the pool broadcasts to every live link instead of striping.
    pub fn is_control(self) -> bool {
        matches!(self, Cmd::Connect | Cmd::Close | Cmd::Closed)
    }
}

impl TryFrom<u8> for Cmd {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Cmd::Data),
            1 => Ok(Cmd::Connect),
            2 => Ok(Cmd::Close),
            3 => Ok(Cmd::Closed),
            4 => Ok(Cmd::Ping),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cmd::Data => "data",
            Cmd::Connect => "connect",
            Cmd::Close => "close",
            Cmd::Closed => "closed",
            Cmd::Ping => "ping",
        };
        f.write_str(name)
    }
}

/// Current wall clock as unix nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Packet header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Magic number for protocol identification
    pub magic: u32,
    /// Protocol version
    pub version: ProtocolVersion,
    /// Command
    pub cmd: Cmd,
    /// Identity of the endpoint that opened the virtual connection
    pub sender_id: u32,
    /// Virtual connection identifier
    pub conn_id: u32,
    /// Sequence number within the connection
    pub seq_id: u32,
    /// Send time (unix nanoseconds)
    pub timestamp: i64,
    /// Payload length
    pub payload_len: u16,
}

impl PacketHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 28;

    /// Create a new packet header
    pub fn new(cmd: Cmd, sender_id: u32, conn_id: u32, seq_id: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: ProtocolVersion::current(),
            cmd,
            sender_id,
            conn_id,
            seq_id,
            timestamp: 0,
            payload_len: 0,
        }
    }

    /// Encode header to bytes (network byte order)
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version.0;
        buf[5] = self.cmd as u8;
        buf[6..10].copy_from_slice(&self.sender_id.to_be_bytes());
        buf[10..14].copy_from_slice(&self.conn_id.to_be_bytes());
        buf[14..18].copy_from_slice(&self.seq_id.to_be_bytes());
        buf[18..26].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[26..28].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode header from bytes (network byte order)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = ProtocolVersion(buf[4]);
        if !version.is_supported() {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let cmd = Cmd::try_from(buf[5])?;
        let sender_id = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let conn_id = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let seq_id = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);
        let timestamp = i64::from_be_bytes([
            buf[18], buf[19], buf[20], buf[21], buf[22], buf[23], buf[24], buf[25],
        ]);
        let payload_len = u16::from_be_bytes([buf[26], buf[27]]);

        Ok(Self {
            magic,
            version,
            cmd,
            sender_id,
            conn_id,
            seq_id,
            timestamp,
            payload_len,
        })
    }
}

/// Complete packet with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,
    /// Payload bytes (empty for everything but `data`)
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet stamped with the current time.
    ///
    /// Fails if the payload does not fit the 16-bit length field.
    pub fn new(
        cmd: Cmd,
        sender_id: u32,
        conn_id: u32,
        seq_id: u32,
        payload: Bytes,
    ) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        let mut header = PacketHeader::new(cmd, sender_id, conn_id, seq_id);
        header.payload_len = payload.len() as u16;
        header.timestamp = now_nanos();
        Ok(Self { header, payload })
    }

    /// Create a payload-less packet (connect, close, closed)
    pub fn control(cmd: Cmd, sender_id: u32, conn_id: u32, seq_id: u32) -> Self {
        let mut header = PacketHeader::new(cmd, sender_id, conn_id, seq_id);
        header.timestamp = now_nanos();
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Create a keepalive packet
    pub fn ping(sender_id: u32) -> Self {
        Self::control(Cmd::Ping, sender_id, 0, 0)
    }

    pub fn cmd(&self) -> Cmd {
        self.header.cmd
    }

    pub fn sender_id(&self) -> u32 {
        self.header.sender_id
    }

    pub fn conn_id(&self) -> u32 {
        self.header.conn_id
    }

    pub fn seq_id(&self) -> u32 {
        self.header.seq_id
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    /// Total size of the packet in bytes
    pub fn total_size(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Bytes after the declared payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = PacketHeader::decode(buf)?;

        let expected_len = PacketHeader::SIZE + header.payload_len as usize;
        if buf.len() < expected_len {
            return Err(ProtocolError::InvalidLength {
                expected: expected_len,
                actual: buf.len(),
            });
        }

        let payload = Bytes::copy_from_slice(&buf[PacketHeader::SIZE..expected_len]);
        Ok(Self { header, payload })
    }
}

/// Protocol-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid magic number: 0x{0:08X} (expected 0x{expected:08X})", expected = PROTOCOL_MAGIC)]
    InvalidMagic(u32),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(ProtocolVersion),

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("Invalid packet length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}
