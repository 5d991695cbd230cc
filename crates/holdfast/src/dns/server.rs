use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument as _;

use super::{AllowedSources, Resolver};
use crate::command::CommandProcessor;
use crate::{Connection, RateLimiter, MAX_PACKET_SIZE, RATE_LIMIT_INTERVAL};

pub struct DnsServerConfig {
    pub bind_ip: IpAddr,
    /// None disables the UDP listener; Some(0) binds an ephemeral port
    pub udp_port: Option<u16>,
    /// None disables the TCP listener; Some(0) binds an ephemeral port
    pub tcp_port: Option<u16>,
    pub forwarders: Vec<SocketAddr>,
    pub allow_query_prefixes: Vec<String>,
    pub per_ip_limit: usize,
}

/// The DNS forwarder daemon: a UDP socket and a TCP listener served by a
/// small pool of workers, every inbound query dispatched through the shared
/// [`Resolver`] pipeline.
pub struct DnsServer<P> {
    udp_socket: Option<Arc<UdpSocket>>,
    tcp_listener: Option<Arc<TcpListener>>,
    resolver: Arc<Resolver<P>>,
    limiter: Arc<RateLimiter>,
    workers: JoinSet<anyhow::Result<()>>,
    stop_rx: watch::Receiver<bool>,
}

impl<P: CommandProcessor> DnsServer<P> {
    pub async fn new(
        config: DnsServerConfig,
        blacklist: Arc<crate::blacklist::Blacklist>,
        processor: Option<Arc<P>>,
        stop_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            config.udp_port.is_some() || config.tcp_port.is_some(),
            "at least one of the UDP and TCP listeners must be enabled"
        );

        let udp_socket = match config.udp_port {
            Some(port) => Some(Arc::new(
                UdpSocket::bind((config.bind_ip, port))
                    .await
                    .context("error while creating a UDP socket")?,
            )),
            None => None,
        };
        let tcp_listener = match config.tcp_port {
            Some(port) => Some(Arc::new(
                TcpListener::bind((config.bind_ip, port))
                    .await
                    .context("error while creating a TcpListener")?,
            )),
            None => None,
        };

        let resolver = Arc::new(Resolver::new(
            blacklist,
            AllowedSources::new(config.allow_query_prefixes),
            config.forwarders,
            processor,
        ));

        Ok(DnsServer {
            udp_socket,
            tcp_listener,
            resolver,
            limiter: Arc::new(RateLimiter::new(config.per_ip_limit, RATE_LIMIT_INTERVAL)),
            workers: JoinSet::new(),
            stop_rx,
        })
    }

    /// Address of the bound UDP socket, if the UDP listener is enabled.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Address of the bound TCP listener, if it is enabled.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    pub fn add_workers(&mut self, n: u8) {
        for idx in 0..n {
            self.workers.spawn(
                serve(
                    self.udp_socket.clone(),
                    self.tcp_listener.clone(),
                    self.resolver.clone(),
                    self.limiter.clone(),
                    self.stop_rx.clone(),
                )
                .instrument(tracing::trace_span!("", worker = idx)),
            );
        }
    }

    /// Blocks until every worker has observed the stop signal and exited.
    pub async fn block_until_completion(mut self) -> anyhow::Result<()> {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result.context("worker task failed to execute")? {
                tracing::debug!("error in a worker: {:#}", e);
            }
        }
        Ok(())
    }
}

async fn recv_udp(socket: &Option<Arc<UdpSocket>>, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn accept_tcp(listener: &Option<Arc<TcpListener>>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn serve<P: CommandProcessor>(
    udp_socket: Option<Arc<UdpSocket>>,
    tcp_listener: Option<Arc<TcpListener>>,
    resolver: Arc<Resolver<P>>,
    limiter: Arc<RateLimiter>,
    mut stop_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut recv = vec![0u8; MAX_PACKET_SIZE];
    let mut handlers: JoinSet<anyhow::Result<()>> = JoinSet::new();
    loop {
        tokio::select! {
            result = recv_udp(&udp_socket, &mut recv) => match result {
                Ok((length, from)) => {
                    tracing::trace!(%from, "new UDP query");
                    if !limiter.admit(from.ip()) {
                        continue;
                    }
                    let socket = udp_socket.clone().context("bug: UDP datagram without a socket?")?;
                    let connection = Connection::Udp {
                        socket,
                        peer: from,
                        packet: recv[..length].to_vec(),
                    };
                    handlers.spawn(resolver.clone().handle_query(connection).in_current_span());
                }
                Err(err) => tracing::debug!("UDP receive error: {}", err),
            },
            result = accept_tcp(&tcp_listener) => match result {
                Ok((conn, from)) => {
                    tracing::trace!(%from, "new TCP connection");
                    if !limiter.admit(from.ip()) {
                        continue;
                    }
                    handlers.spawn(resolver.clone().handle_query(Connection::Tcp(conn)).in_current_span());
                }
                Err(err) => tracing::debug!("TCP accept error: {}", err),
            },
            Some(result) = handlers.join_next() => {
                // A panicking or failing handler must never tear down the
                // listener
                match result {
                    Ok(Err(e)) => tracing::debug!("error while handling a query: {:#}", e),
                    Err(e) => tracing::warn!("a query handler died: {}", e),
                    Ok(Ok(())) => {}
                }
            }
            result = stop_rx.changed() => {
                // A dropped sender means nobody can ask us to stop later
                if result.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        };
    }

    // New accepts stop here; queries already in flight run to completion
    while let Some(result) = handlers.join_next().await {
        if let Ok(Err(e)) = result {
            tracing::debug!("error while handling a query during shutdown: {:#}", e);
        }
    }
    Ok(())
}
