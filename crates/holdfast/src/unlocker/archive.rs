use std::path::Path;
use std::time::Duration;

use aes_gcm::aead::Aead as _;
use aes_gcm::{Aes256Gcm, KeyInit as _, Nonce};
use anyhow::Context as _;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::exec::invoke_program;

/// The encrypted archive is `nonce || AES-256-GCM(tar archive)`.
const NONCE_LENGTH: usize = 12;
const UNPACK_TIMEOUT: Duration = Duration::from_secs(300);

fn derive_key(password: &str) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(Some(b"holdfast-archive"), password.as_bytes());
    let mut key = [0u8; 32];
    if hkdf.expand(b"archive key", &mut key).is_err() {
        unreachable!("HKDF output length is fixed and valid");
    }
    key
}

/// Encrypts archive bytes for storage. The inverse of
/// [`decrypt_archive_bytes`]; the daemon itself only ever decrypts, this is
/// for operators preparing an archive.
pub fn encrypt_archive_bytes(plain: &[u8], password: &str) -> anyhow::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(&derive_key(password).into());
    let mut nonce = [0u8; NONCE_LENGTH];
    use rand::RngCore as _;
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| anyhow::anyhow!("archive encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LENGTH + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypts archive bytes. A wrong password fails authentication and yields
/// nothing at all.
pub fn decrypt_archive_bytes(sealed: &[u8], password: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(sealed.len() > NONCE_LENGTH, "archive is too short to be valid");
    let (nonce, body) = sealed.split_at(NONCE_LENGTH);

    let cipher = Aes256Gcm::new(&derive_key(password).into());
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| anyhow::anyhow!("wrong password or corrupted archive"))
}

/// Decrypts the archive into a temporary file inside the ramdisk and
/// unpacks it there. The temporary file is removed before returning; the
/// caller owns the ramdisk's fate on failure.
pub async fn extract(archive_path: &Path, tmp_path: &Path, dest_dir: &Path, password: &str) -> anyhow::Result<()> {
    let sealed = tokio::fs::read(archive_path)
        .await
        .with_context(|| format!("failed to read the archive at {}", archive_path.display()))?;
    let plain = decrypt_archive_bytes(&sealed, password)?;

    tokio::fs::write(tmp_path, &plain)
        .await
        .context("failed to write the decrypted archive")?;
    drop(plain);

    let result = invoke_program(
        "tar",
        &[
            "-x",
            "-f",
            tmp_path.to_str().context("temp path is not valid UTF-8")?,
            "-C",
            dest_dir.to_str().context("destination path is not valid UTF-8")?,
        ],
        UNPACK_TIMEOUT,
    )
    .await
    .context("failed to unpack the decrypted archive");

    // The plaintext tar must not outlive extraction either way
    let _ = tokio::fs::remove_file(tmp_path).await;
    result.map(|_| ())
}
