//! Datagram transports beneath the packet codec.
//!
//! UDP maps one packet to one datagram. TCP prefixes each packet with a
//! big-endian u16 length; the TCP variant exists for the framing layer but
//! the handshake driver is only driven over UDP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::info;

use crate::config::{Options, Proto};
use crate::error::{Error, Result};
use crate::protocol::MAX_PACKET_SIZE;

/// Reading half of the transport; owned by the ingress demultiplexer.
pub enum TransportReader {
    Udp(Arc<UdpSocket>),
    Tcp(OwnedReadHalf),
}

/// Writing half of the transport; owned by the egress task.
pub enum TransportWriter {
    Udp(Arc<UdpSocket>),
    Tcp(OwnedWriteHalf),
}

impl TransportReader {
    /// Read one whole packet's bytes from the wire.
    pub async fn read_packet_bytes(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Udp(socket) => {
                let mut buf = vec![0u8; MAX_PACKET_SIZE];
                let n = socket.recv(&mut buf).await?;
                if n == 0 {
                    return Err(Error::protocol("empty datagram"));
                }
                buf.truncate(n);
                Ok(buf)
            }
            Self::Tcp(stream) => {
                let len = stream.read_u16().await? as usize;
                let mut buf = vec![0u8; len];
                stream.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

impl TransportWriter {
    /// Write one whole packet's bytes to the wire.
    pub async fn write_packet_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Udp(socket) => {
                socket.send(bytes).await?;
                Ok(())
            }
            Self::Tcp(stream) => {
                let len = u16::try_from(bytes.len())
                    .map_err(|_| Error::protocol("packet exceeds TCP frame size"))?;
                stream.write_all(&len.to_be_bytes()).await?;
                stream.write_all(bytes).await?;
                stream.flush().await?;
                Ok(())
            }
        }
    }
}

/// Resolve the remote address and connect, returning both halves.
pub async fn connect(options: &Options) -> Result<(TransportReader, TransportWriter)> {
    let addr = resolve_address(&options.remote, options.port).await?;
    info!("Connecting to {} ({}) over {}", options.remote, addr, options.proto.name());

    match options.proto {
        Proto::Udp => {
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().map_err(|_| Error::config("bad bind address"))?
            } else {
                "[::]:0".parse().map_err(|_| Error::config("bad bind address"))?
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            let socket = Arc::new(socket);
            Ok((
                TransportReader::Udp(socket.clone()),
                TransportWriter::Udp(socket),
            ))
        }
        Proto::Tcp => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            Ok((
                TransportReader::Tcp(read_half),
                TransportWriter::Tcp(write_half),
            ))
        }
    }
}

/// Resolve hostname to socket address.
async fn resolve_address(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(format!("{}:{}", host, port))
        .await?
        .collect();
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| Error::config(format!("no addresses found for {}", host)))
}
