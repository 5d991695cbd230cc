mod addr;
mod cipher;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;
use rand::RngCore as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

pub use addr::{is_reserved_addr, DestHost, ProxyRequest};
pub use cipher::{CipherKey, CipherReader, CipherStream, CipherWriter, IV_LENGTH};

use crate::blacklist::Blacklist;
use crate::{is_lockdown, RateLimiter, IO_TIMEOUT, MAX_PACKET_SIZE, RATE_LIMIT_INTERVAL};

/// Read/write helpers give up after this many deadline misses.
const MAX_IO_ATTEMPTS: u32 = 5;

/// The encrypted TCP relay. Each accepted connection carries one encrypted
/// destination request followed by arbitrary application bytes, which are
/// piped to the destination in both directions.
pub struct CipherProxy {
    listener: TcpListener,
    key: CipherKey,
    blacklist: Arc<Blacklist>,
    limiter: Arc<RateLimiter>,
    stop_rx: watch::Receiver<bool>,
}

impl CipherProxy {
    pub async fn new(
        bind_addr: SocketAddr,
        password: &str,
        per_ip_limit: usize,
        blacklist: Arc<Blacklist>,
        stop_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("error while binding the relay listener to {}", bind_addr))?;
        Ok(CipherProxy {
            listener,
            key: CipherKey::derive(password),
            blacklist,
            limiter: Arc::new(RateLimiter::new(per_ip_limit, RATE_LIMIT_INTERVAL)),
            stop_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("relay listener has no local addr")
    }

    /// Accept loop; returns once the stop signal fires. Connections already
    /// being relayed run on to their own deadlines.
    pub async fn start_and_block(mut self) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "cipher relay is listening");
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (client, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::debug!("accept error: {}", err);
                            continue;
                        }
                    };
                    if !self.limiter.admit(peer.ip()) {
                        continue;
                    }
                    let key = self.key.clone();
                    let blacklist = self.blacklist.clone();
                    handlers.spawn(async move {
                        handle_connection(client, peer.ip(), key, blacklist).await;
                    });
                }
                Some(result) = handlers.join_next() => {
                    if let Err(err) = result {
                        tracing::warn!("a relay handler died: {}", err);
                    }
                }
                result = self.stop_rx.changed() => {
                    if result.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        while handlers.join_next().await.is_some() {}
        Ok(())
    }
}

async fn handle_connection(client: TcpStream, peer: IpAddr, key: CipherKey, blacklist: Arc<Blacklist>) {
    tweak_socket(&client);
    let (mut client_r, client_w) = CipherStream::new(client, key).split();
    let client_w = Arc::new(Mutex::new(client_w));

    let request = match tokio::time::timeout(IO_TIMEOUT, ProxyRequest::read_from(&mut client_r)).await {
        Ok(Ok(request)) => request,
        Ok(Err(err)) => {
            tracing::warn!(%peer, "failed to get the destination address: {:#}", err);
            write_rand_and_close(&client_w).await;
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, "client sent no destination request in time");
            write_rand_and_close(&client_w).await;
            return;
        }
    };

    // Policy rejections close at once, without the padding used against
    // protocol probing
    if let Some(ip) = request.ip() {
        if is_reserved_addr(ip) {
            tracing::info!(%peer, dest = %request.host_text(), "will not serve a reserved address");
            shutdown_client(&client_w).await;
            return;
        }
    }
    if blacklist.contains(&request.host_text()) {
        tracing::info!(%peer, dest = %request.host_text(), "will not serve a black listed address");
        shutdown_client(&client_w).await;
        return;
    }

    let dest = match tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(request.dial_text())).await {
        Ok(Ok(dest)) => dest,
        Ok(Err(err)) => {
            tracing::warn!(%peer, dest = %request.dial_text(), "failed to connect to the destination: {}", err);
            shutdown_client(&client_w).await;
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, dest = %request.dial_text(), "timed out connecting to the destination");
            shutdown_client(&client_w).await;
            return;
        }
    };
    tweak_socket(&dest);
    let (dest_r, dest_w) = tokio::io::split(dest);

    // One pipe per direction; the client-facing pipe masks its closing with
    // random trailing bytes
    let upstream = tokio::spawn(pipe_client_to_dest(client_r, dest_w, client_w.clone()));
    pipe_dest_to_client(dest_r, client_w).await;
    upstream.abort();
}

/// One read attempt on a relay leg, encrypted or plain. Both directions go
/// through the same retry envelope, so the helpers are written against this
/// seam rather than a concrete stream type.
trait RelayRead {
    fn read_once(&mut self, buf: &mut [u8]) -> impl std::future::Future<Output = std::io::Result<usize>>;
}

impl<R: AsyncRead + Unpin> RelayRead for CipherReader<R> {
    async fn read_once(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read(buf).await
    }
}

impl<R: AsyncRead> RelayRead for tokio::io::ReadHalf<R> {
    async fn read_once(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }
}

/// One write attempt on a relay leg. The cipher side always consumes the
/// whole buffer (its ciphertext survives a cancelled flush); the plain side
/// may report partial progress.
trait RelayWrite {
    fn write_once(&mut self, buf: &[u8]) -> impl std::future::Future<Output = std::io::Result<usize>>;
}

impl<W: AsyncWrite + Unpin> RelayWrite for CipherWriter<W> {
    async fn write_once(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write(buf).await
    }
}

impl<W: AsyncWrite> RelayWrite for tokio::io::WriteHalf<W> {
    async fn write_once(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        AsyncWriteExt::write(self, buf).await
    }
}

/// client → destination. On a client-side read failure the client is fed
/// random trailing bytes before everything closes, so the stream's end looks
/// like traffic rather than a protocol boundary.
async fn pipe_client_to_dest<R, W, CW>(
    mut client_r: CipherReader<R>,
    mut dest_w: tokio::io::WriteHalf<W>,
    client_w: Arc<Mutex<CipherWriter<CW>>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite,
    CW: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        if is_lockdown() {
            tracing::warn!("emergency lockdown, dropping the relayed connection");
            break;
        }
        match read_with_retry(&mut client_r, &mut buf).await {
            Ok(length) if length > 0 => {
                if write_with_retry(&mut dest_w, &buf[..length]).await.is_err() {
                    break;
                }
            }
            // EOF and errors both end the session with trailing noise
            _ => {
                write_rand(&client_w).await;
                break;
            }
        }
    }
    let _ = dest_w.shutdown().await;
}

/// destination → client, under the same retry envelope as the other leg.
async fn pipe_dest_to_client<R, CW>(mut dest_r: R, client_w: Arc<Mutex<CipherWriter<CW>>>)
where
    R: RelayRead,
    CW: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        if is_lockdown() {
            tracing::warn!("emergency lockdown, dropping the relayed connection");
            break;
        }
        let length = match read_with_retry(&mut dest_r, &mut buf).await {
            Ok(length) if length > 0 => length,
            _ => break,
        };
        if write_with_retry(&mut *client_w.lock().await, &buf[..length]).await.is_err() {
            break;
        }
    }
    shutdown_client(&client_w).await;
}

/// Reads with up to [`MAX_IO_ATTEMPTS`] deadline misses and a linearly
/// growing pause between attempts.
async fn read_with_retry<R: RelayRead>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    for attempt in 0..MAX_IO_ATTEMPTS {
        match tokio::time::timeout(IO_TIMEOUT, reader.read_once(buf)).await {
            Ok(result) => return result,
            Err(_) => tokio::time::sleep(Duration::from_secs(attempt as u64)).await,
        }
    }
    Err(std::io::ErrorKind::TimedOut.into())
}

/// Writes the whole buffer, retrying deadline misses only while nothing has
/// been transferred; a partial write aborts at once because the stream can
/// no longer be trusted.
async fn write_with_retry<W: RelayWrite>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    let mut written = 0usize;
    let mut attempts = 0u32;
    while written < buf.len() {
        match tokio::time::timeout(IO_TIMEOUT, writer.write_once(&buf[written..])).await {
            Ok(Ok(0)) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => written += n,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                attempts += 1;
                if written > 0 || attempts >= MAX_IO_ATTEMPTS {
                    return Err(std::io::ErrorKind::TimedOut.into());
                }
                tokio::time::sleep(Duration::from_secs(attempts as u64)).await;
            }
        }
    }
    Ok(())
}

/// Picks from [min, max] with extra weight around the midpoint.
fn rand_num(min: u64, mid: u64, max: u64) -> u64 {
    let mut rng = rand::thread_rng();
    if rng.gen_bool(0.5) {
        rng.gen_range(min..=mid)
    } else {
        rng.gen_range(mid..=max)
    }
}

/// Feeds the client a few packets of random bytes under tight per-write
/// deadlines, making the tail of a failed session look like payload.
async fn write_rand<W: AsyncWrite + Unpin>(client_w: &Arc<Mutex<CipherWriter<W>>>) {
    let mut written = 0usize;
    for _ in 0..rand_num(1, 2, 5) {
        let mut noise = vec![0u8; rand_num(80, 210, 550) as usize];
        rand::thread_rng().fill_bytes(&mut noise);
        let deadline = Duration::from_millis(rand_num(890, 1440, 2330));
        let mut client_w = client_w.lock().await;
        match tokio::time::timeout(deadline, client_w.write(&noise)).await {
            Ok(Ok(n)) => written += n,
            _ => break,
        }
    }
    tracing::debug!("wrote {} random bytes", written);
}

/// Padding used when a connection never even produced a parseable request:
/// one random burst, then the connection closes.
async fn write_rand_and_close<W: AsyncWrite + Unpin>(client_w: &Arc<Mutex<CipherWriter<W>>>) {
    let mut noise = vec![0u8; rand_num(20, 70, 200) as usize];
    rand::thread_rng().fill_bytes(&mut noise);
    {
        let mut client_w = client_w.lock().await;
        match tokio::time::timeout(IO_TIMEOUT, client_w.write(&noise)).await {
            Ok(Err(err)) => tracing::debug!("failed to write random bytes: {}", err),
            Err(_) => tracing::debug!("timed out writing random bytes"),
            Ok(Ok(_)) => {}
        }
    }
    shutdown_client(client_w).await;
}

async fn shutdown_client<W: AsyncWrite + Unpin>(client_w: &Arc<Mutex<CipherWriter<W>>>) {
    let mut client_w = client_w.lock().await;
    let _ = client_w.shutdown().await;
}

/// NODELAY, an hourly-scale keepalive and a short linger keep relayed
/// sessions responsive without leaking sockets.
fn tweak_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_linger(Some(Duration::from_secs(5)));
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    let _ = socket.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An echo server that reports whether anything ever connected.
    async fn spawn_echo_server() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local addr");
        let connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, connections)
    }

    async fn spawn_proxy(blacklist: Arc<Blacklist>) -> (SocketAddr, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let proxy = CipherProxy::new("127.0.0.1:0".parse().unwrap(), "relay password", 1000, blacklist, stop_rx)
            .await
            .expect("proxy should start");
        let addr = proxy.local_addr().expect("local addr");
        tokio::spawn(proxy.start_and_block());
        (addr, stop_tx)
    }

    fn domain_request(host: &str, port: u16) -> Vec<u8> {
        let mut request = vec![addr::ADDRESS_TYPE_DOMAIN, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    #[tokio::test]
    async fn relays_bytes_in_both_directions() {
        let (echo_addr, _connections) = spawn_echo_server().await;
        let (proxy_addr, _stop_tx) = spawn_proxy(Arc::new(Blacklist::new())).await;

        let client = TcpStream::connect(proxy_addr).await.expect("connect failed");
        let key = CipherKey::derive("relay password");
        let (mut client_r, mut client_w) = CipherStream::new(client, key).split();

        let mut payload = domain_request("localhost", echo_addr.port());
        payload.extend_from_slice(b"ping across the relay");
        client_w.write(&payload).await.expect("write failed");

        let mut reply = [0u8; 21];
        tokio::time::timeout(Duration::from_secs(10), client_r.read_exact(&mut reply))
            .await
            .expect("timed out waiting for the echo")
            .expect("read failed");
        assert_eq!(&reply, b"ping across the relay");
    }

    #[tokio::test]
    async fn reserved_destinations_are_refused_without_a_dial() {
        let (echo_addr, connections) = spawn_echo_server().await;
        let (proxy_addr, _stop_tx) = spawn_proxy(Arc::new(Blacklist::new())).await;

        let client = TcpStream::connect(proxy_addr).await.expect("connect failed");
        let key = CipherKey::derive("relay password");
        let (mut client_r, mut client_w) = CipherStream::new(client, key).split();

        // A literal loopback IP is reserved, even though the port is real
        let mut request = vec![addr::ADDRESS_TYPE_IPV4, 127, 0, 0, 1];
        request.extend_from_slice(&echo_addr.port().to_be_bytes());
        client_w.write(&request).await.expect("write failed");

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(10), client_r.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap_or(0);
        assert_eq!(n, 0, "the connection should close without data");
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 0, "no dial should be observed");
    }

    #[tokio::test]
    async fn private_ipv4_destination_is_refused() {
        let (_echo_addr, _) = spawn_echo_server().await;
        let (proxy_addr, _stop_tx) = spawn_proxy(Arc::new(Blacklist::new())).await;

        let client = TcpStream::connect(proxy_addr).await.expect("connect failed");
        let key = CipherKey::derive("relay password");
        let (mut client_r, mut client_w) = CipherStream::new(client, key).split();

        let mut request = vec![addr::ADDRESS_TYPE_IPV4, 10, 0, 0, 5];
        request.extend_from_slice(&80u16.to_be_bytes());
        client_w.write(&request).await.expect("write failed");

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(10), client_r.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn blacklisted_destinations_are_refused() {
        let (echo_addr, connections) = spawn_echo_server().await;
        let blacklist = Arc::new(Blacklist::new());
        blacklist.insert("evil.example.com");
        let (proxy_addr, _stop_tx) = spawn_proxy(blacklist).await;

        let client = TcpStream::connect(proxy_addr).await.expect("connect failed");
        let key = CipherKey::derive("relay password");
        let (mut client_r, mut client_w) = CipherStream::new(client, key).split();

        let request = domain_request("evil.example.com", echo_addr.port());
        client_w.write(&request).await.expect("write failed");

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(10), client_r.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn garbage_gets_padding_then_close() {
        let (proxy_addr, _stop_tx) = spawn_proxy(Arc::new(Blacklist::new())).await;

        // Not encrypted with the right key, so the parsed request is noise;
        // with overwhelming probability the type nibble is invalid or the
        // domain read runs past the payload
        let mut client = TcpStream::connect(proxy_addr).await.expect("connect failed");
        client.write_all(&[0u8; 64]).await.expect("write failed");
        client.shutdown().await.expect("shutdown failed");

        // The server either pads (bytes arrive) or closes outright; it must
        // not hang
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(15), client.read_to_end(&mut buf)).await;
    }

    #[test]
    fn rand_num_respects_bounds() {
        for _ in 0..1000 {
            let n = rand_num(80, 210, 550);
            assert!((80..=550).contains(&n));
        }
    }
}
