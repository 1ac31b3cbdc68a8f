//! Lock-free transfer statistics.
//!
//! Shared by the cache (hit/miss accounting), the fetch path (download
//! accounting) and the session tracker (served-byte accounting). All
//! counters are atomics with relaxed ordering; readers take snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate transfer counters for one store.
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Bytes handed to consumers (kernel reads).
    pub bytes_served: AtomicU64,
    /// Bytes fetched from the backend.
    pub bytes_downloaded: AtomicU64,
    /// Reads fully satisfied from disk.
    pub cache_hits: AtomicU64,
    /// Reads that required at least one backend fetch.
    pub cache_misses: AtomicU64,
}

impl TransferStats {
    /// New zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes served to a consumer.
    #[inline]
    pub fn record_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes pulled from the backend.
    #[inline]
    pub fn record_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a read served entirely from disk.
    #[inline]
    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read that needed the backend.
    #[inline]
    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit fraction in `[0, 1]`; 0 when nothing was recorded.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data snapshot of [`TransferStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    /// Bytes handed to consumers.
    pub bytes_served: u64,
    /// Bytes fetched from the backend.
    pub bytes_downloaded: u64,
    /// Reads fully satisfied from disk.
    pub cache_hits: u64,
    /// Reads that required a backend fetch.
    pub cache_misses: u64,
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
