//! Mount liveness monitoring and recovery.
//!
//! A FUSE mount whose daemon thread has wedged turns every syscall on
//! the mountpoint into an indefinite hang ("ghost mount"). The monitor
//! probes the mountpoint with a bounded-timeout stat every ~15 s; on
//! failure it escalates through unmount stages and re-mounts, up to a
//! small number of attempts, after which the mount stays in `Error`
//! until an explicit restart.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cadence of liveness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Deadline for one probe; a hung stat means a dead mount.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-mount attempts before giving up.
pub const MAX_REMOUNT_ATTEMPTS: u32 = 3;

/// Base backoff between re-mount attempts.
const REMOUNT_BACKOFF: Duration = Duration::from_secs(2);

/// Observable mount health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Probes pass.
    Healthy,
    /// Probes fail; recovery in progress or exhausted.
    Error,
}

/// Callback that re-establishes the mount.
pub type RemountFn = dyn Fn() -> Result<()> + Send + Sync;

/// Background mountpoint watchdog.
pub struct MountMonitor {
    mountpoint: PathBuf,
    state: Mutex<MountState>,
    /// Only one probe may touch the (possibly hung) mountpoint at a
    /// time; concurrent callers get the cached verdict.
    probing: tokio::sync::Mutex<()>,
    last_healthy: AtomicBool,
    attempts: AtomicU32,
    remount: Box<RemountFn>,
}

impl MountMonitor {
    /// Monitor for `mountpoint`, recovering via `remount`.
    pub fn new(mountpoint: impl Into<PathBuf>, remount: Box<RemountFn>) -> Arc<Self> {
        Arc::new(Self {
            mountpoint: mountpoint.into(),
            state: Mutex::new(MountState::Healthy),
            probing: tokio::sync::Mutex::new(()),
            last_healthy: AtomicBool::new(true),
            attempts: AtomicU32::new(0),
            remount,
        })
    }

    /// Current state.
    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    /// Probe the mountpoint with a bounded timeout.
    ///
    /// Returns the cached verdict when a probe is already in flight.
    pub async fn probe(&self) -> bool {
        let Ok(_guard) = self.probing.try_lock() else {
            return self.last_healthy.load(Ordering::Acquire);
        };
        let mountpoint = self.mountpoint.clone();
        // spawn_blocking: a stat on a ghost mount blocks in the kernel
        // and cannot be aborted, only abandoned past the timeout.
        let alive = tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::task::spawn_blocking(move || std::fs::metadata(&mountpoint).is_ok()),
        )
        .await
        .map(|joined| joined.unwrap_or(false))
        .unwrap_or(false);
        self.last_healthy.store(alive, Ordering::Release);
        alive
    }

    /// Run probes until cancelled.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROBE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = tick.tick() => monitor.probe_and_recover().await,
                }
            }
        })
    }

    async fn probe_and_recover(&self) {
        if self.probe().await {
            if std::mem::replace(&mut *self.state.lock(), MountState::Healthy)
                == MountState::Error
            {
                info!(mountpoint = %self.mountpoint.display(), "mount recovered");
            }
            self.attempts.store(0, Ordering::Release);
            return;
        }

        *self.state.lock() = MountState::Error;
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > MAX_REMOUNT_ATTEMPTS {
            error!(
                mountpoint = %self.mountpoint.display(),
                "mount unhealthy and recovery attempts exhausted; manual restart required"
            );
            return;
        }
        warn!(
            mountpoint = %self.mountpoint.display(),
            attempt,
            max = MAX_REMOUNT_ATTEMPTS,
            "mount probe failed, attempting recovery"
        );

        // Clear whatever stale kernel state is still attached, then
        // re-mount and re-probe.
        unmount_escalate(&self.mountpoint);
        tokio::time::sleep(REMOUNT_BACKOFF * attempt).await;
        match (self.remount)() {
            Ok(()) => {
                if self.probe().await {
                    info!(mountpoint = %self.mountpoint.display(), "re-mount succeeded");
                    *self.state.lock() = MountState::Healthy;
                    self.attempts.store(0, Ordering::Release);
                }
            }
            Err(e) => {
                warn!(error = %e, "re-mount failed");
            }
        }
    }
}

/// Graceful unmount (`fusermount -u` on Linux, `umount` on macOS).
pub fn graceful_unmount(mountpoint: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    let output = Command::new("fusermount")
        .arg("-u")
        .arg(mountpoint)
        .output()
        .context("failed to run fusermount")?;

    #[cfg(not(target_os = "linux"))]
    let output = Command::new("umount")
        .arg(mountpoint)
        .output()
        .context("failed to run umount")?;

    if output.status.success() {
        return Ok(());
    }
    bail!(
        "graceful unmount of {} failed: {}",
        mountpoint.display(),
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

/// Lazy unmount: detach from the namespace, let open handles drain.
pub fn lazy_unmount(mountpoint: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let output = Command::new("fusermount")
            .args(["-uz"])
            .arg(mountpoint)
            .output();
        if let Ok(output) = output {
            if output.status.success() {
                return Ok(());
            }
        }
        let output = Command::new("umount")
            .arg("-l")
            .arg(mountpoint)
            .output()
            .context("failed to run umount -l")?;
        if output.status.success() {
            return Ok(());
        }
        bail!(
            "lazy unmount of {} failed: {}",
            mountpoint.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    #[cfg(not(target_os = "linux"))]
    {
        // No true lazy unmount outside Linux.
        force_unmount(mountpoint)
    }
}

/// Force unmount via platform helpers. Last resort.
pub fn force_unmount(mountpoint: &Path) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("diskutil")
            .args(["unmount", "force"])
            .arg(mountpoint)
            .output();
        if let Ok(output) = output {
            if output.status.success() {
                return Ok(());
            }
        }
    }

    let output = Command::new("umount")
        .arg("-f")
        .arg(mountpoint)
        .output()
        .context("failed to run umount -f")?;
    if output.status.success() {
        return Ok(());
    }
    bail!(
        "force unmount of {} failed: {}",
        mountpoint.display(),
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

/// Escalate graceful → lazy → force, logging each stage. Failures are
/// swallowed; the subsequent re-mount decides whether recovery worked.
pub fn unmount_escalate(mountpoint: &Path) {
    for (stage, unmount) in [
        ("graceful", graceful_unmount as fn(&Path) -> Result<()>),
        ("lazy", lazy_unmount),
        ("force", force_unmount),
    ] {
        match unmount(mountpoint) {
            Ok(()) => {
                debug!(stage, mountpoint = %mountpoint.display(), "unmount succeeded");
                return;
            }
            Err(e) => {
                debug!(stage, error = %e, "unmount stage failed");
            }
        }
    }
    warn!(
        mountpoint = %mountpoint.display(),
        "all unmount stages failed; stale kernel state may remain"
    );
}
