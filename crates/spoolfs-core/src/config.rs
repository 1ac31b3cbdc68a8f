//! Reader tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-fetch timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default pipeline depth: segments fetched ahead of the consumer per
/// open reader.
pub const DEFAULT_MAX_PREFETCH_SEGMENTS: usize = 6;

/// Default upper bound on the tail shortfall the patch heuristic will
/// cover (roughly one segment).
pub const DEFAULT_MAX_TAIL_PATCH_BYTES: u64 = 800 * 1024;

/// Configuration for segmented readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Max segments fetched speculatively ahead of the consumer per open
    /// reader. Bounds per-reader memory to roughly this many bodies.
    pub max_prefetch_segments: usize,

    /// Timeout applied to each individual segment fetch (connect + body).
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Largest tail shortfall the patch heuristic will synthesize.
    /// Shortfalls beyond this fail the read with a missing-data error.
    pub max_tail_patch_bytes: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_prefetch_segments: DEFAULT_MAX_PREFETCH_SEGMENTS,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_tail_patch_bytes: DEFAULT_MAX_TAIL_PATCH_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ReaderConfig::default();
        assert_eq!(cfg.max_prefetch_segments, 6);
        assert_eq!(cfg.read_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_tail_patch_bytes, 800 * 1024);
    }

    #[test]
    fn test_humantime_round_trip() {
        let cfg = ReaderConfig {
            read_timeout: Duration::from_secs(90),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("1m 30s"));
        let back: ReaderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.read_timeout, Duration::from_secs(90));
    }
}
