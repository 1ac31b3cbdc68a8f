//! Read-path error taxonomy.
//!
//! Everything the segmented reader can fail with collapses into
//! [`ReadError`]. The kernel frontend maps these onto POSIX errno values
//! exactly once, at the FUSE boundary; nothing below that layer deals in
//! errno.

use std::time::Duration;

use thiserror::Error;

use crate::metadata::RecordError;
use crate::pool::PoolError;

/// Errors produced by the segmented read path.
#[derive(Debug, Error)]
pub enum ReadError {
    /// A required segment is absent from all providers.
    #[error("missing segment: article {article_id} not found on any provider")]
    MissingSegment {
        /// The unlocatable article.
        article_id: String,
    },

    /// The stream is short by more than the tail-patch threshold, or a
    /// nested source cannot supply its declared byte count.
    #[error("missing data: {0}")]
    MissingData(String),

    /// The caller's cancellation token fired mid-read.
    #[error("read cancelled")]
    Cancelled,

    /// A single backend fetch exceeded the configured read timeout.
    #[error("backend fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Backend failure that survived the pool's retry budget.
    #[error("backend error: {0}")]
    Backend(String),

    /// The file record violates a structural invariant.
    #[error("invalid file record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// CBC decryption failed (bad block alignment or corrupt ciphertext).
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Local I/O failure (disk cache, sidecars).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReadError {
    /// Whether this error is a cancellation rather than a fault.
    ///
    /// Cancellations map to `EINTR` and are not logged as errors: a
    /// player closing its connection is not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReadError::Cancelled)
    }
}

impl From<PoolError> for ReadError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Missing { article_id } => ReadError::MissingSegment { article_id },
            PoolError::Transient { article_id, reason } => {
                ReadError::Backend(format!("{article_id}: {reason}"))
            }
            PoolError::Cancelled => ReadError::Cancelled,
        }
    }
}
