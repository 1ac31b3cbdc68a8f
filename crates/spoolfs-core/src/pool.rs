//! Segment pool contract.
//!
//! The pool is the pluggable network layer: given an article id and its
//! groups it yields the segment's body as a byte stream. Connection
//! pooling, provider failover, pipelining and retries all live behind
//! this trait; the read path only sees the classified outcome.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// A segment body being streamed from the backend.
///
/// Dropping the stream releases the underlying connection.
pub type SegmentBody = Box<dyn AsyncRead + Send + Unpin>;

/// Errors surfaced by a segment pool.
///
/// Transient conditions are retried *inside* the pool; by the time an
/// error reaches the reader the pool's retry budget is spent.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The article is absent from every configured provider.
    /// Non-retryable from the reader's point of view.
    #[error("article {article_id} not found on any provider")]
    Missing {
        /// The article that could not be located.
        article_id: String,
    },

    /// Connection or protocol failure after the pool's own retries.
    #[error("backend failure for {article_id}: {reason}")]
    Transient {
        /// The article being fetched.
        article_id: String,
        /// Short failure description.
        reason: String,
    },

    /// The fetch was cancelled via its token.
    #[error("fetch cancelled")]
    Cancelled,
}

/// Read-only pool counters, surfaced for observability.
///
/// These are not part of the read-path correctness contract.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Total bytes pulled from providers.
    pub bytes_downloaded: AtomicU64,
    /// Fetches that ended in an error after retries.
    pub fetch_errors: AtomicU64,
    /// Fetches satisfied successfully.
    pub fetch_ok: AtomicU64,
}

impl PoolMetrics {
    /// Record a completed fetch of `bytes` body bytes.
    pub fn record_fetch(&self, bytes: u64) {
        self.fetch_ok.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed fetch.
    pub fn record_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// The pluggable client that retrieves single segment bodies.
///
/// Implementations must honor the cancellation token: an aborted fetch
/// returns [`PoolError::Cancelled`] within roughly one network round trip.
#[async_trait]
pub trait SegmentPool: Send + Sync {
    /// Fetch the body of one segment.
    async fn fetch(
        &self,
        article_id: &str,
        groups: &[String],
        token: &CancellationToken,
    ) -> Result<SegmentBody, PoolError>;

    /// Current pool counters.
    fn metrics(&self) -> &PoolMetrics;
}
