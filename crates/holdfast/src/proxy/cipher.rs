use ctr::cipher::{KeyIvInit as _, StreamCipher as _};
use hkdf::Hkdf;
use rand::RngCore as _;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadHalf, WriteHalf};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Length of the per-direction IV emitted at the head of each stream.
pub const IV_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;

/// The symmetric key both ends derive from the preshared password. There is
/// no handshake; agreeing on the password is the whole protocol.
#[derive(Clone)]
pub struct CipherKey([u8; KEY_LENGTH]);

impl CipherKey {
    pub fn derive(password: &str) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(b"holdfast-relay"), password.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        // expand only fails for absurd output lengths
        if hkdf.expand(b"stream key", &mut key).is_err() {
            unreachable!("HKDF output length is fixed and valid");
        }
        CipherKey(key)
    }

    fn keystream(&self, iv: &[u8; IV_LENGTH]) -> Aes256Ctr {
        Aes256Ctr::new(&self.0.into(), iv.into())
    }
}

/// Wraps a bidirectional stream in password-derived stream-cipher framing:
/// each direction is `IV || keystream ⊕ payload`, with the IV emitted
/// exactly once, lazily, by whichever side writes first.
pub struct CipherStream<S> {
    inner: S,
    key: CipherKey,
}

impl<S: AsyncRead + AsyncWrite> CipherStream<S> {
    pub fn new(inner: S, key: CipherKey) -> Self {
        CipherStream { inner, key }
    }

    /// Splits into independently owned halves, one per relay direction.
    /// Decryption and encryption keep separate cipher states, so the halves
    /// never need to synchronise.
    pub fn split(self) -> (CipherReader<ReadHalf<S>>, CipherWriter<WriteHalf<S>>)
    where
        S: Sized,
    {
        let (read_half, write_half) = tokio::io::split(self.inner);
        (
            CipherReader {
                inner: read_half,
                key: self.key.clone(),
                keystream: None,
            },
            CipherWriter {
                inner: write_half,
                key: self.key,
                keystream: None,
                pending: Vec::new(),
                flushed: 0,
            },
        )
    }
}

/// The decrypting half. The keystream is initialised from the first
/// [`IV_LENGTH`] bytes read off the wire; once initialised, bytes decrypt in
/// order and the position never resets.
pub struct CipherReader<R> {
    inner: R,
    key: CipherKey,
    keystream: Option<Aes256Ctr>,
}

impl<R: AsyncRead + Unpin> CipherReader<R> {
    /// Reads and decrypts into `buf`, faithfully returning short reads. A
    /// short read of the IV itself is terminal for the connection.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.keystream.is_none() {
            let mut iv = [0u8; IV_LENGTH];
            self.inner.read_exact(&mut iv).await?;
            self.keystream = Some(self.key.keystream(&iv));
        }

        let n = self.inner.read(buf).await?;
        if n > 0 {
            if let Some(keystream) = self.keystream.as_mut() {
                keystream.apply_keystream(&mut buf[..n]);
            }
        }
        Ok(n)
    }

    /// Reads and decrypts exactly `buf.len()` bytes.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        Ok(())
    }
}

/// The encrypting half. The first write emits `IV || ciphertext` as one
/// unit against the underlying stream, so a peer never observes a bare or
/// partial IV.
pub struct CipherWriter<W> {
    inner: W,
    key: CipherKey,
    keystream: Option<Aes256Ctr>,
    // Ciphertext encrypted but not yet fully flushed. Plaintext is consumed
    // by the keystream exactly once; a cancelled flush resumes from here.
    pending: Vec<u8>,
    flushed: usize,
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    /// Encrypts and writes the whole buffer, returning the number of
    /// plaintext bytes consumed. A write cancelled by a deadline must be
    /// repeated with the same buffer: the ciphertext already produced is
    /// flushed first and the keystream position never rewinds.
    pub async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            self.flushed = 0;
            match self.keystream.as_mut() {
                Some(keystream) => {
                    self.pending.extend_from_slice(buf);
                    keystream.apply_keystream(&mut self.pending);
                }
                None => {
                    let mut iv = [0u8; IV_LENGTH];
                    rand::thread_rng().fill_bytes(&mut iv);
                    let mut keystream = self.key.keystream(&iv);

                    self.pending.reserve(IV_LENGTH + buf.len());
                    self.pending.extend_from_slice(&iv);
                    self.pending.extend_from_slice(buf);
                    keystream.apply_keystream(&mut self.pending[IV_LENGTH..]);
                    self.keystream = Some(keystream);
                }
            }
        }

        while self.flushed < self.pending.len() {
            let n = self.inner.write(&self.pending[self.flushed..]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            self.flushed += n;
        }
        self.pending.clear();
        self.flushed = 0;
        Ok(buf.len())
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_both_directions() {
        let key = CipherKey::derive("correct horse battery staple");
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_r, mut client_w) = CipherStream::new(client, key.clone()).split();
        let (mut server_r, mut server_w) = CipherStream::new(server, key).split();

        client_w.write(b"hello").await.expect("write failed");
        client_w.write(b" world").await.expect("write failed");
        let mut buf = [0u8; 11];
        server_r.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"hello world");

        server_w.write(b"reply").await.expect("write failed");
        let mut buf = [0u8; 5];
        client_r.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn wire_form_starts_with_the_iv_and_hides_the_payload() {
        let key = CipherKey::derive("pw");
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_w) = CipherStream::new(client, key).split();

        let payload = b"attack at dawn";
        client_w.write(payload).await.expect("write failed");
        drop(client_w);

        let (mut raw, _) = tokio::io::split(server);
        let mut wire = vec![0u8; IV_LENGTH + payload.len()];
        raw.read_exact(&mut wire).await.expect("read failed");
        // Ciphertext must not leak the plaintext
        assert_ne!(&wire[IV_LENGTH..], payload);
    }

    #[tokio::test]
    async fn each_connection_gets_a_fresh_iv() {
        let key = CipherKey::derive("pw");

        let mut ivs = Vec::new();
        for _ in 0..2 {
            let (client, server) = tokio::io::duplex(4096);
            let (_, mut client_w) = CipherStream::new(client, key.clone()).split();
            client_w.write(b"x").await.expect("write failed");
            drop(client_w);

            let (mut raw, _) = tokio::io::split(server);
            let mut iv = [0u8; IV_LENGTH];
            raw.read_exact(&mut iv).await.expect("read failed");
            ivs.push(iv);
        }
        assert_ne!(ivs[0], ivs[1]);
    }

    #[tokio::test]
    async fn mismatched_passwords_produce_garbage() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_w) = CipherStream::new(client, CipherKey::derive("right")).split();
        let (mut server_r, _) = CipherStream::new(server, CipherKey::derive("wrong")).split();

        client_w.write(b"payload").await.expect("write failed");
        let mut buf = [0u8; 7];
        server_r.read_exact(&mut buf).await.expect("read failed");
        assert_ne!(&buf, b"payload");
    }

    #[tokio::test]
    async fn truncated_iv_is_a_terminal_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut raw_w, _raw_r) = {
            let (r, w) = tokio::io::split(client);
            (w, r)
        };
        // Fewer bytes than one IV, then EOF
        raw_w.write_all(&[0u8; IV_LENGTH - 1]).await.expect("write failed");
        raw_w.shutdown().await.expect("shutdown failed");
        drop(raw_w);

        let (mut server_r, _) = CipherStream::new(server, CipherKey::derive("pw")).split();
        let mut buf = [0u8; 4];
        assert!(server_r.read(&mut buf).await.is_err());
    }
}
