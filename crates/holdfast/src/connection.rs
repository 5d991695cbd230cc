use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};

/// Abstracts the transport under a single DNS exchange, so the resolver
/// doesn't care whether a query arrived over UDP or TCP. TCP messages carry
/// a two-byte big-endian length prefix; a UDP exchange is born out of one
/// datagram, which travels inside the connection value.
pub enum Connection<U: AsyncUdpSocket> {
    Tcp(TcpStream),
    Udp {
        socket: U,
        peer: SocketAddr,
        packet: Vec<u8>,
    },
}

/// The slice of UDP socket behavior the resolver relies on, so tests can
/// substitute their own.
pub trait AsyncUdpSocket {
    fn send_to<A: ToSocketAddrs>(
        &self,
        buf: &[u8],
        target: A,
    ) -> impl std::future::Future<Output = std::io::Result<usize>>;
}

impl AsyncUdpSocket for UdpSocket {
    async fn send_to<A: ToSocketAddrs>(&self, buf: &[u8], target: A) -> std::io::Result<usize> {
        self.send_to(buf, target).await
    }
}

impl AsyncUdpSocket for Arc<UdpSocket> {
    async fn send_to<A: ToSocketAddrs>(&self, buf: &[u8], target: A) -> std::io::Result<usize> {
        self.as_ref().send_to(buf, target).await
    }
}

impl<U: AsyncUdpSocket> Connection<U> {
    /// Produces the query bytes: the datagram that opened a UDP exchange,
    /// or one length-prefixed message read off the TCP stream.
    pub async fn read_query(&mut self) -> anyhow::Result<Vec<u8>> {
        match self {
            Connection::Tcp(socket) => {
                let length = socket
                    .read_u16()
                    .await
                    .context("TCP: error while reading packet's length")? as usize;
                let mut query = vec![0; length];
                socket
                    .read_exact(&mut query)
                    .await
                    .context("TCP: error while reading a packet")?;
                Ok(query)
            }
            Connection::Udp { packet, .. } => Ok(std::mem::take(packet)),
        }
    }

    /// Sends one DNS message back to the client.
    pub async fn send_response(&mut self, src: &[u8]) -> anyhow::Result<()> {
        match self {
            Connection::Tcp(socket) => {
                let length = (src.len() as u16).to_be_bytes();
                socket
                    .write_all(&length)
                    .await
                    .context("TCP: error while sending packet's length")?;
                socket
                    .write_all(src)
                    .await
                    .context("TCP: error while sending a DNS packet")?;
            }
            Connection::Udp { socket, peer, .. } => {
                socket
                    .send_to(src, &*peer)
                    .await
                    .with_context(|| format!("UDP: error while sending a DNS packet to {}", peer))?;
            }
        };

        Ok(())
    }

    pub fn client_ip(&self) -> anyhow::Result<IpAddr> {
        match self {
            Connection::Tcp(socket) => socket
                .peer_addr()
                .map(|socket_addr| socket_addr.ip())
                .context("bug: TCP socket is not connected?"),
            Connection::Udp { peer, .. } => Ok(peer.ip()),
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Connection::Tcp(_))
    }
}
