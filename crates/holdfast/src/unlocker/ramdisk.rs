use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;

use crate::exec::invoke_program;

/// Directory-name prefix of every ramdisk this program ever mounts, so a
/// later process can recognise and clean up after a killed predecessor.
const RAMDISK_PREFIX: &str = "holdfast-ram";
const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);

/// A tmpfs mount holding the decrypted program data. It exists only while
/// the unlocked program runs and must be destroyed on every exit path.
pub struct Ramdisk {
    mount_dir: PathBuf,
}

impl Ramdisk {
    /// Mounts a tmpfs of the given size under the system temp directory.
    pub async fn create(size_mb: u64) -> anyhow::Result<Ramdisk> {
        let mount_dir = std::env::temp_dir().join(format!("{}-{}", RAMDISK_PREFIX, std::process::id()));
        tokio::fs::create_dir_all(&mount_dir)
            .await
            .with_context(|| format!("failed to create the mount point {}", mount_dir.display()))?;

        let mount_dir_text = mount_dir.to_str().context("mount point path is not valid UTF-8")?;
        invoke_program(
            "mount",
            &["-t", "tmpfs", "-o", &format!("size={}m", size_mb), "tmpfs", mount_dir_text],
            MOUNT_TIMEOUT,
        )
        .await
        .context("failed to mount a ramdisk")?;

        tracing::info!(dir = %mount_dir.display(), size_mb, "ramdisk is mounted");
        Ok(Ramdisk { mount_dir })
    }

    pub fn path(&self) -> &Path {
        &self.mount_dir
    }

    /// Unmounts and removes the ramdisk. Safe to call on an already
    /// destroyed mount.
    pub async fn destroy(&self) {
        destroy_mount(&self.mount_dir).await;
    }

    /// Sweeps up ramdisks left behind by an earlier process of this program
    /// that was killed before it could clean up after itself.
    pub async fn destroy_all_stale() {
        let own_suffix = format!("{}-{}", RAMDISK_PREFIX, std::process::id());
        let Ok(mut entries) = tokio::fs::read_dir(std::env::temp_dir()).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(RAMDISK_PREFIX) && name != own_suffix {
                tracing::info!(dir = %entry.path().display(), "destroying a stale ramdisk");
                destroy_mount(&entry.path()).await;
            }
        }
    }
}

async fn destroy_mount(mount_dir: &Path) {
    let Some(mount_dir_text) = mount_dir.to_str() else {
        return;
    };
    // Lazy + force, so a busy mount still goes away when its users exit
    if let Err(err) = invoke_program("umount", &["-lf", mount_dir_text], MOUNT_TIMEOUT).await {
        tracing::warn!(dir = %mount_dir.display(), "umount failed: {:#}", err);
    }
    if let Err(err) = tokio::fs::remove_dir_all(mount_dir).await {
        tracing::warn!(dir = %mount_dir.display(), "failed to remove the mount point: {}", err);
    }
}
