//! Transport layer for TCP and UDP links.
//!
//! This module handles:
//! - Framing packets on a TCP byte stream (header, then exactly `payload_len` bytes)
//! - One packet per UDP datagram, bounded by [`MAX_DATAGRAM_SIZE`]
//! - The two halves of a physical link ([`LinkReader`], [`LinkWriter`])
//! - Dialing a link ([`dial`])

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};

use crate::proto::{Packet, PacketHeader, ProtocolError};

/// Largest encoded packet sent as one UDP datagram (1500 MTU - IP/UDP headers)
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Largest payload that still fits in one datagram
pub const MAX_DATAGRAM_PAYLOAD: usize = MAX_DATAGRAM_SIZE - PacketHeader::SIZE;

/// Receive buffer for UDP datagrams
pub const UDP_RECV_BUF_SIZE: usize = 2048;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Datagram too large: {0} bytes (max {MAX_DATAGRAM_SIZE})")]
    DatagramTooLarge(usize),

    #[error("Link is closed")]
    Closed,
}

/// Physical link protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => f.write_str("tcp"),
            Proto::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Proto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(other.to_string()),
        }
    }
}

/// Read exactly one packet from a TCP byte stream.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; PacketHeader::SIZE];
    reader.read_exact(&mut head).await?;
    let header = PacketHeader::decode(&head)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Packet {
        header,
        payload: payload.into(),
    })
}

/// Write one packet to a TCP byte stream.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    Ok(())
}

/// Encode a packet for a datagram link, rejecting oversized packets.
pub fn encode_datagram(packet: &Packet) -> Result<Vec<u8>, TransportError> {
    let wire = packet.encode();
    if wire.len() > MAX_DATAGRAM_SIZE {
        return Err(TransportError::DatagramTooLarge(wire.len()));
    }
    Ok(wire)
}

/// Dial one link: a TCP connection or a connected UDP socket.
pub async fn dial(proto: Proto, addr: &str) -> Result<(LinkReader, LinkWriter), TransportError> {
    match proto {
        Proto::Tcp => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((LinkReader::Tcp(reader), LinkWriter::Tcp(writer)))
        }
        Proto::Udp => {
            let target = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}"))
            })?;
            let local = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(target).await?;
            let socket = Arc::new(socket);
            Ok((
                LinkReader::Udp(Arc::clone(&socket)),
                LinkWriter::Udp(socket),
            ))
        }
    }
}

/// Read side of one dialed link
pub enum LinkReader {
    Tcp(OwnedReadHalf),
    Udp(Arc<UdpSocket>),
}

impl LinkReader {
    /// Receive the next packet
    pub async fn recv(&mut self) -> Result<Packet, TransportError> {
        match self {
            LinkReader::Tcp(stream) => read_packet(stream).await,
            LinkReader::Udp(socket) => {
                let mut buf = [0u8; UDP_RECV_BUF_SIZE];
                let n = socket.recv(&mut buf).await?;
                Ok(Packet::decode(&buf[..n])?)
            }
        }
    }

    /// Whether a decode error leaves the link usable
    pub fn is_datagram(&self) -> bool {
        matches!(self, LinkReader::Udp(_))
    }
}

/// Write side of one physical link
pub enum LinkWriter {
    /// Outbound half of a TCP stream
    Tcp(OwnedWriteHalf),
    /// Connected UDP socket (frontend side)
    Udp(Arc<UdpSocket>),
    /// Shared listening UDP socket addressing one peer (backend side)
    UdpTo {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

impl LinkWriter {
    /// Send one packet on this link
    pub async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        match self {
            LinkWriter::Tcp(stream) => write_packet(stream, packet).await,
            LinkWriter::Udp(socket) => {
                let wire = encode_datagram(packet)?;
                socket.send(&wire).await?;
                Ok(())
            }
            LinkWriter::UdpTo { socket, peer } => {
                let wire = encode_datagram(packet)?;
                socket.send_to(&wire, *peer).await?;
                Ok(())
            }
        }
    }

    /// Whether packets are framed on a byte stream, so an interrupted send
    /// leaves the link unusable
    pub fn is_stream(&self) -> bool {
        matches!(self, LinkWriter::Tcp(_))
    }

    /// Flush and half-close where the transport supports it
    pub async fn shutdown(&mut self) {
        if let LinkWriter::Tcp(stream) = self {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Cmd;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_stream_framing_back_to_back() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let first = Packet::new(Cmd::Data, 1, 2, 3, Bytes::from_static(b"one")).unwrap();
        let second = Packet::control(Cmd::Close, 1, 2, 4);

        write_packet(&mut a, &first).await.unwrap();
        write_packet(&mut a, &second).await.unwrap();

        let got_first = read_packet(&mut b).await.unwrap();
        let got_second = read_packet(&mut b).await.unwrap();
        assert_eq!(got_first, first);
        assert_eq!(got_second, second);
    }

    #[tokio::test]
    async fn test_stream_eof_is_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let result = read_packet(&mut b).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_datagram_size_limit() {
        let ok = Packet::new(Cmd::Data, 1, 1, 1, Bytes::from(vec![0u8; 1400])).unwrap();
        assert!(encode_datagram(&ok).is_ok());

        let full = Packet::new(Cmd::Data, 1, 1, 1, Bytes::from(vec![0u8; MAX_DATAGRAM_PAYLOAD])).unwrap();
        assert_eq!(encode_datagram(&full).unwrap().len(), MAX_DATAGRAM_SIZE);

        let big = Packet::new(Cmd::Data, 1, 1, 1, Bytes::from(vec![0u8; MAX_DATAGRAM_PAYLOAD + 1])).unwrap();
        assert!(matches!(
            encode_datagram(&big),
            Err(TransportError::DatagramTooLarge(1473))
        ));
    }

    #[tokio::test]
    async fn test_dial_tcp_and_udp() {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = tcp.local_addr().unwrap().to_string();
        let (mut reader, _writer) = {
            let (dialed, accepted) = tokio::join!(dial(Proto::Tcp, &tcp_addr), tcp.accept());
            let (mut stream, _) = accepted.unwrap();
            write_packet(&mut stream, &Packet::ping(5)).await.unwrap();
            dialed.unwrap()
        };
        assert!(!reader.is_datagram());
        assert_eq!(reader.recv().await.unwrap().sender_id(), 5);

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap().to_string();
        let (mut reader, mut writer) = dial(Proto::Udp, &udp_addr).await.unwrap();
        assert!(reader.is_datagram());
        writer.send(&Packet::ping(6)).await.unwrap();

        let mut buf = [0u8; UDP_RECV_BUF_SIZE];
        let (n, from) = udp.recv_from(&mut buf).await.unwrap();
        udp.send_to(&buf[..n], from).await.unwrap();
        assert_eq!(reader.recv().await.unwrap().sender_id(), 6);
    }

    #[test]
    fn test_proto_parse() {
        assert_eq!("tcp".parse::<Proto>().unwrap(), Proto::Tcp);
        assert_eq!("UDP".parse::<Proto>().unwrap(), Proto::Udp);
        assert!("sctp".parse::<Proto>().is_err());
        assert_eq!(Proto::Udp.to_string(), "udp");
    }

    #[tokio::test]
    async fn test_udp_link_writer() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let mut writer = LinkWriter::UdpTo {
            socket: tx,
            peer: rx.local_addr().unwrap(),
        };
        let packet = Packet::ping(77);
        writer.send(&packet).await.unwrap();

        let mut buf = [0u8; UDP_RECV_BUF_SIZE];
        let (n, _) = rx.recv_from(&mut buf).await.unwrap();
        let got = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(got.cmd(), Cmd::Ping);
        assert_eq!(got.sender_id(), 77);
    }
}
