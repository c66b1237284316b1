//! Sticky disk lifecycle.
//!
//! The disk holds the build daemon's cache. It is mounted during setup and,
//! at the end of the job, released in a fixed order: stop the daemon, unmount,
//! then write the commit marker that tells the fleet the cache was flushed.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::config::{
    BUILD_DAEMON_NAME, STICKY_DISK_COMMIT_MARKER, STICKY_DISK_DEVICE, STICKY_DISK_FS_TYPE,
    STICKY_DISK_MOUNT_POINT,
};

const DAEMON_STOP_GRACE: Duration = Duration::from_secs(30);
const DAEMON_KILL_GRACE: Duration = Duration::from_secs(5);
const DAEMON_EXIT_POLL: Duration = Duration::from_millis(100);

/// Host operations the manager sequences. Split out so the ordering can be
/// checked without root.
#[async_trait::async_trait]
pub trait DiskHost: Send + Sync {
    async fn probe(&self, device: &Path) -> Result<bool>;

    /// Creates `mount_point` if needed and attaches `device` to it.
    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<()>;

    /// Returns once the build daemon has exited.
    async fn stop_daemon(&self) -> Result<()>;

    async fn unmount(&self, mount_point: &Path) -> Result<()>;

    async fn write_commit_marker(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyDiskMount {
    pub device_path: PathBuf,
    pub mount_point: PathBuf,
    pub mounted: bool,
    pub commit_marker_path: PathBuf,
}

impl Default for StickyDiskMount {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(STICKY_DISK_DEVICE),
            mount_point: PathBuf::from(STICKY_DISK_MOUNT_POINT),
            mounted: false,
            commit_marker_path: PathBuf::from(STICKY_DISK_COMMIT_MARKER),
        }
    }
}

/// What happened during [`StickyDiskManager::unmount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    /// Nothing was mounted, so nothing was touched.
    NotMounted,
    /// Daemon stopped, disk unmounted, marker written.
    Committed,
    DaemonStillRunning,
    UnmountFailed,
    /// Unmounted, but the marker could not be written.
    MarkerFailed,
}

pub struct StickyDiskManager<H> {
    host: H,
    disk: StickyDiskMount,
}

impl<H: DiskHost> StickyDiskManager<H> {
    pub fn new(host: H) -> Self {
        Self::with_mount(host, StickyDiskMount::default())
    }

    pub fn with_mount(host: H, disk: StickyDiskMount) -> Self {
        Self { host, disk }
    }

    /// Rebuilds the manager in the post phase from what setup recorded.
    pub fn restore(host: H, mounted: bool) -> Self {
        Self::with_mount(
            host,
            StickyDiskMount {
                mounted,
                ..Default::default()
            },
        )
    }

    pub fn disk(&self) -> &StickyDiskMount {
        &self.disk
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub async fn detect(&self) -> bool {
        match self.host.probe(&self.disk.device_path).await {
            Ok(present) => present,
            Err(e) => {
                tracing::debug!(
                    "Probing {} failed, treating it as absent: {e:#}",
                    self.disk.device_path.display()
                );
                false
            }
        }
    }

    /// Mounts the disk when the backend enabled the feature and the device is
    /// present. Returns whether the disk is now mounted.
    pub async fn mount_if_enabled(&mut self, enabled: bool) -> bool {
        if self.disk.mounted {
            return true;
        }
        if !enabled {
            tracing::debug!("Sticky disks are disabled for this task");
            return false;
        }
        if !self.detect().await {
            tracing::info!(
                "Sticky disk {} not present, continuing without it",
                self.disk.device_path.display()
            );
            return false;
        }

        match self
            .host
            .mount(&self.disk.device_path, &self.disk.mount_point)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "Mounted sticky disk {} at {}",
                    self.disk.device_path.display(),
                    self.disk.mount_point.display()
                );
                self.disk.mounted = true;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to mount sticky disk, continuing without it: {e:#}");
                false
            }
        }
    }

    /// Stops the daemon, unmounts and writes the commit marker, in that order.
    /// A failed step skips the steps that depend on it; nothing is propagated.
    pub async fn unmount(&mut self) -> UnmountOutcome {
        if !self.disk.mounted {
            tracing::debug!("Sticky disk was never mounted, skipping unmount");
            return UnmountOutcome::NotMounted;
        }

        if let Err(e) = self.host.stop_daemon().await {
            tracing::warn!("Build daemon did not stop, leaving sticky disk mounted: {e:#}");
            return UnmountOutcome::DaemonStillRunning;
        }

        if let Err(e) = self.host.unmount(&self.disk.mount_point).await {
            tracing::warn!(
                "Failed to unmount sticky disk at {}: {e:#}",
                self.disk.mount_point.display()
            );
            return UnmountOutcome::UnmountFailed;
        }
        self.disk.mounted = false;

        if let Err(e) = self
            .host
            .write_commit_marker(&self.disk.commit_marker_path)
            .await
        {
            tracing::warn!("Failed to write sticky disk commit marker: {e:#}");
            return UnmountOutcome::MarkerFailed;
        }

        tracing::info!("Sticky disk flushed and committed");
        UnmountOutcome::Committed
    }
}

/// Real host: nix mount calls and signals to the daemon process.
#[derive(Debug, Clone)]
pub struct LinuxDiskHost {
    daemon_name: String,
}

impl Default for LinuxDiskHost {
    fn default() -> Self {
        Self {
            daemon_name: BUILD_DAEMON_NAME.to_string(),
        }
    }
}

impl LinuxDiskHost {
    async fn wait_for_exit(pids: &[Pid], grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if pids.iter().all(|pid| !is_process_alive(*pid)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DAEMON_EXIT_POLL).await;
        }
    }
}

#[async_trait::async_trait]
impl DiskHost for LinuxDiskHost {
    async fn probe(&self, device: &Path) -> Result<bool> {
        let metadata = tokio::fs::metadata(device)
            .await
            .with_context(|| format!("Failed to stat {}", device.display()))?;
        Ok(metadata.file_type().is_block_device())
    }

    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<()> {
        tokio::fs::create_dir_all(mount_point)
            .await
            .with_context(|| format!("Failed to create mount point {}", mount_point.display()))?;
        mount::<Path, Path, str, str>(
            Some(device),
            mount_point,
            Some(STICKY_DISK_FS_TYPE),
            MsFlags::empty(),
            None,
        )
        .with_context(|| {
            format!(
                "Failed to mount {} at {}",
                device.display(),
                mount_point.display()
            )
        })
    }

    async fn stop_daemon(&self) -> Result<()> {
        let pids = find_processes(&self.daemon_name)?;
        if pids.is_empty() {
            tracing::debug!("No {} process running", self.daemon_name);
            return Ok(());
        }

        for pid in &pids {
            tracing::info!("Sending SIGTERM to {} ({pid})", self.daemon_name);
            if let Err(e) = kill(*pid, Signal::SIGTERM) {
                tracing::debug!("SIGTERM to {pid} failed: {e}");
            }
        }
        if Self::wait_for_exit(&pids, DAEMON_STOP_GRACE).await {
            return Ok(());
        }

        tracing::warn!(
            "{} did not exit within {DAEMON_STOP_GRACE:?}, sending SIGKILL",
            self.daemon_name
        );
        for pid in &pids {
            if let Err(e) = kill(*pid, Signal::SIGKILL) {
                tracing::debug!("SIGKILL to {pid} failed: {e}");
            }
        }
        if Self::wait_for_exit(&pids, DAEMON_KILL_GRACE).await {
            return Ok(());
        }
        bail!("{} is still running after SIGKILL", self.daemon_name)
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        nix::unistd::sync();
        umount2(mount_point, MntFlags::empty())
            .with_context(|| format!("Failed to unmount {}", mount_point.display()))
    }

    async fn write_commit_marker(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let stamp = chrono::Utc::now().to_rfc3339();
        tokio::fs::write(path, format!("{stamp}\n"))
            .await
            .with_context(|| format!("Failed to write commit marker {}", path.display()))
    }
}

fn is_process_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Scans `/proc/<pid>/comm` for processes named `name`.
fn find_processes(name: &str) -> Result<Vec<Pid>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc").context("Failed to read /proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        // processes can exit between read_dir and read
        let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim_end() == name {
            pids.push(Pid::from_raw(pid));
        }
    }
    Ok(pids)
}
