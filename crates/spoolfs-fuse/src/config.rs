//! Mount configuration for the FUSE frontend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default kernel attribute cache TTL.
pub const DEFAULT_ATTR_TIMEOUT: Duration = Duration::from_secs(30);

/// Default dentry cache TTL.
pub const DEFAULT_ENTRY_TIMEOUT: Duration = Duration::from_secs(1);

/// Default per-operation timeout at the kernel boundary. Generous
/// because a cold read may wait on several backend fetches.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(120);

/// Kernel-layer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Kernel attribute cache TTL. Size changes made by ingestion become
    /// visible within this bound.
    #[serde(with = "humantime_serde")]
    pub attr_timeout: Duration,

    /// Kernel dentry cache TTL.
    #[serde(with = "humantime_serde")]
    pub entry_timeout: Duration,

    /// Kernel read-ahead buffer in bytes; 0 keeps the kernel default.
    pub max_read_ahead: u32,

    /// Allow access by users other than the mounting one.
    pub allow_other: bool,

    /// Enable FUSE debug output.
    pub debug: bool,

    /// Reported file owner; `None` uses the mounting user.
    pub uid: Option<u32>,

    /// Reported file group; `None` uses the mounting group.
    pub gid: Option<u32>,

    /// Upper bound for one kernel operation end to end.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_timeout: DEFAULT_ATTR_TIMEOUT,
            entry_timeout: DEFAULT_ENTRY_TIMEOUT,
            max_read_ahead: 0,
            allow_other: false,
            debug: false,
            uid: None,
            gid: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl MountConfig {
    /// Sets the attribute cache TTL.
    #[must_use]
    pub fn attr_timeout(mut self, ttl: Duration) -> Self {
        self.attr_timeout = ttl;
        self
    }

    /// Sets the dentry cache TTL.
    #[must_use]
    pub fn entry_timeout(mut self, ttl: Duration) -> Self {
        self.entry_timeout = ttl;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Allows access by other users (`allow_other`).
    #[must_use]
    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }
}
