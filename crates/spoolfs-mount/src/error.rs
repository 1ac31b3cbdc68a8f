//! Cache-layer errors.

use thiserror::Error;

/// Errors raised by the range cache itself (as opposed to errors the
/// backend read path propagates through it).
#[derive(Debug, Error)]
pub enum CacheError {
    /// A sidecar exists but cannot be parsed. The item is dropped and
    /// refetched; this only surfaces if that also fails.
    #[error("corrupt sidecar for {path}: {reason}")]
    CorruptSidecar {
        /// Logical path of the item.
        path: String,
        /// Parse failure description.
        reason: String,
    },

    /// Data expected on disk was not there on re-read, which indicates a
    /// concurrent eviction.
    #[error("cached range vanished for {path} at [{start}, {end})")]
    Evicted {
        /// Logical path of the item.
        path: String,
        /// Start of the vanished range.
        start: u64,
        /// End of the vanished range.
        end: u64,
    },

    /// The store is shutting down.
    #[error("cache store stopped")]
    Stopped,

    /// Disk failure under the cache directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
