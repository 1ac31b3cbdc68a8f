//! Backend fetch abstraction consumed by the cache.
//!
//! The cache only needs "give me logical bytes `[start, end)` of this
//! file"; [`RangeFetcher`] is that seam. The production implementation is
//! [`spoolfs_core::FileReader`]; tests substitute counting mocks.

use async_trait::async_trait;
use bytes::Bytes;

use spoolfs_core::{FileReader, ReadError};

/// Fetch a contiguous logical byte range from the backend.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Read `[start, end)`, clamped to the file size by the implementor.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, ReadError>;
}

#[async_trait]
impl RangeFetcher for FileReader {
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, ReadError> {
        self.read_range(start..end).await
    }
}
