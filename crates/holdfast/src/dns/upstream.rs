use std::net::SocketAddr;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpStream, UdpSocket};

use crate::{FORWARDER_TIMEOUT, MAX_PACKET_SIZE};

/// Forwards the exact query bytes to the upstream resolver over the same
/// protocol the client used, and returns the upstream's response verbatim.
/// The whole round trip is bounded by [`FORWARDER_TIMEOUT`].
pub(super) async fn forward_query(raw_query: &[u8], forwarder: SocketAddr, use_tcp: bool) -> anyhow::Result<Vec<u8>> {
    let exchange = async {
        if use_tcp {
            forward_over_tcp(raw_query, forwarder).await
        } else {
            forward_over_udp(raw_query, forwarder).await
        }
    };

    tokio::time::timeout(FORWARDER_TIMEOUT, exchange)
        .await
        .with_context(|| format!("forwarder {} timed out", forwarder))?
}

async fn forward_over_udp(raw_query: &[u8], forwarder: SocketAddr) -> anyhow::Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.context("UDP: unable to bind a socket")?;
    socket
        .connect(forwarder)
        .await
        .context("UDP: error while connecting to the forwarder")?;
    socket.send(raw_query).await.context("UDP: error while forwarding the query")?;

    let mut response = vec![0; MAX_PACKET_SIZE];
    let length = socket
        .recv(&mut response)
        .await
        .context("UDP: error while reading the response")?;
    response.truncate(length);
    Ok(response)
}

async fn forward_over_tcp(raw_query: &[u8], forwarder: SocketAddr) -> anyhow::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(forwarder)
        .await
        .context("TCP: error while connecting to the forwarder")?;

    stream
        .write_all(&(raw_query.len() as u16).to_be_bytes())
        .await
        .context("TCP: error while sending the query length")?;
    stream.write_all(raw_query).await.context("TCP: error while forwarding the query")?;

    let length = stream.read_u16().await.context("TCP: error while reading the response length")? as usize;
    let mut response = vec![0; length];
    stream
        .read_exact(&mut response)
        .await
        .context("TCP: error while reading the response")?;
    Ok(response)
}
