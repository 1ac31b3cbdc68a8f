//! Range-cache and session-tracker configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default aligned fetch granularity.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default prefetch window depth, in chunks.
pub const DEFAULT_READ_AHEAD_CHUNKS: u64 = 4;

/// Default in-flight fetches per prefetch window.
pub const DEFAULT_PREFETCH_CONCURRENCY: usize = 3;

/// Fetch bodies larger than this are split into sub-fetches.
pub const MAX_FETCH_BYTES: u64 = 8 * 1024 * 1024;

/// Size of each sub-fetch after splitting.
pub const SUB_FETCH_BYTES: u64 = 4 * 1024 * 1024;

/// Interval between cleanup passes (expiry + size cap).
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval between dirty-sidecar flushes.
pub const SIDECAR_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Range cache configuration.
///
/// `max_size_bytes == 0` disables the size cap; a zero `expiry`
/// disables TTL expiry. Both cleanups only ever touch items with no
/// open handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When false, reads bypass the cache entirely.
    pub enabled: bool,

    /// Directory holding data files and sidecars.
    pub path: PathBuf,

    /// Total on-disk budget across all items; 0 disables eviction.
    pub max_size_bytes: u64,

    /// Inactive-item TTL; 0 disables expiry.
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,

    /// Aligned fetch granularity.
    pub chunk_size: u64,

    /// Prefetch window depth in chunks.
    pub read_ahead_chunks: u64,

    /// Concurrent fetches per prefetch window.
    pub prefetch_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/cache/spoolfs"),
            max_size_bytes: 0,
            expiry: Duration::ZERO,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_ahead_chunks: DEFAULT_READ_AHEAD_CHUNKS,
            prefetch_concurrency: DEFAULT_PREFETCH_CONCURRENCY,
        }
    }
}

impl CacheConfig {
    /// Round `off` down to its chunk boundary.
    pub fn align_down(&self, off: u64) -> u64 {
        (off / self.chunk_size) * self.chunk_size
    }

    /// Round `off` up to the next chunk boundary.
    pub fn align_up(&self, off: u64) -> u64 {
        off.div_ceil(self.chunk_size) * self.chunk_size
    }
}

/// Session tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Absolute session age before reaping.
    #[serde(with = "humantime_serde")]
    pub stale_timeout: Duration,

    /// Reap sessions whose outgoing byte count has not advanced for this
    /// long.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Completed sessions retained for inspection.
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(4 * 3600),
            idle_timeout: Duration::from_secs(30 * 60),
            history_limit: 50,
        }
    }
}
