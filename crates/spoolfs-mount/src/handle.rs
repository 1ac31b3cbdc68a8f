//! The per-open view onto a cached file.
//!
//! A [`CacheHandle`] is what the kernel adapter holds for each open: it
//! serves `read_at` from the sparse data file when coverage allows,
//! otherwise fetches the missing aligned chunks through the dedup
//! barrier, writes them to disk, and retries the disk read. Closing is
//! idempotent and cancels any fetch issued on the handle's behalf.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use spoolfs_core::ReadError;

use crate::config::{MAX_FETCH_BYTES, SUB_FETCH_BYTES};
use crate::error::CacheError;
use crate::fetcher::RangeFetcher;
use crate::item::CacheItem;
use crate::prefetch::AccessContext;
use crate::store::{fetch_range_into, CacheStore};

/// One open of a cached path.
pub struct CacheHandle {
    store: Arc<CacheStore>,
    item: Arc<CacheItem>,
    fetcher: Arc<dyn RangeFetcher>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl CacheHandle {
    pub(crate) fn new(
        store: Arc<CacheStore>,
        item: Arc<CacheItem>,
        fetcher: Arc<dyn RangeFetcher>,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            item,
            fetcher,
            token,
            closed: AtomicBool::new(false),
        }
    }

    /// Logical path of the cached file.
    pub fn path(&self) -> &str {
        self.item.path()
    }

    /// Logical file size.
    pub fn size(&self) -> u64 {
        self.item.size()
    }

    /// Token cancelled when this handle closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Read up to `buf.len()` bytes at `off`.
    ///
    /// Returns the byte count written into `buf`; short counts only at
    /// end of file. Within the body the read either completes fully or
    /// fails.
    pub async fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, ReadError> {
        if self.closed.load(Ordering::Acquire) || self.token.is_cancelled() {
            return Err(ReadError::Cancelled);
        }
        let size = self.item.size();
        if off >= size {
            return Ok(0);
        }
        let end = (off + buf.len() as u64).min(size);
        let want = (end - off) as usize;
        let stats = self.store.stats();

        // Fast path: full coverage, serve from disk.
        if self.item.present(off, end) {
            self.item.read_at(&mut buf[..want], off)?;
            self.item.touch();
            stats.record_hit();
            stats.record_served(want as u64);
            self.notify_prefetch(off);
            return Ok(want);
        }
        stats.record_miss();

        // Fetch the missing aligned chunks.
        let cfg = self.store.config();
        let aligned_start = cfg.align_down(off);
        let aligned_end = cfg.align_up(end).min(size);
        for gap in self.item.find_missing(aligned_start, aligned_end) {
            trace!(
                path = %self.item.path(),
                gap_start = gap.start,
                gap_end = gap.end,
                "fetching missing range"
            );
            // Oversized bodies split into fixed-size sub-fetches, each
            // deduplicated under its own key.
            let step = if gap.end - gap.start > MAX_FETCH_BYTES {
                SUB_FETCH_BYTES
            } else {
                gap.end - gap.start
            };
            let mut s = gap.start;
            while s < gap.end {
                let e = (s + step).min(gap.end);
                fetch_range_into(
                    self.store.flight(),
                    &self.item,
                    &self.fetcher,
                    stats,
                    s,
                    e,
                    &self.token,
                )
                .await?;
                s = e;
            }
        }

        // Re-issue the disk read. Absence now means the item was evicted
        // underneath us, which the refcount makes practically impossible.
        if !self.item.present(off, end) {
            warn!(path = %self.item.path(), off, end, "cached range vanished after fetch");
            return Err(ReadError::Io(io::Error::other(CacheError::Evicted {
                path: self.item.path().to_string(),
                start: off,
                end,
            })));
        }
        self.item.read_at(&mut buf[..want], off)?;
        self.item.touch();
        stats.record_served(want as u64);
        self.notify_prefetch(off);
        Ok(want)
    }

    fn notify_prefetch(&self, off: u64) {
        self.store.prefetcher().record_access(
            AccessContext {
                item: Arc::clone(&self.item),
                fetcher: Arc::clone(&self.fetcher),
                flight: Arc::clone(self.store.flight()),
                parent: self.token.clone(),
            },
            off,
        );
    }

    /// Close the handle: cancel in-flight fetches and drop the item
    /// reference. Safe to call more than once; only the first call acts.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        self.store.release_item(&self.item);
        trace!(path = %self.item.path(), "cache handle closed");
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::testing::StaticFetcher;
    use tempfile::TempDir;

    fn store_with(dir: &TempDir, chunk_size: u64) -> Arc<CacheStore> {
        let store = CacheStore::new(CacheConfig {
            path: dir.path().to_path_buf(),
            chunk_size,
            ..CacheConfig::default()
        });
        store.start().unwrap();
        store
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_read_fetches_aligned_chunk_then_hits() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, 1024);
        let data = payload(10_000);
        let fetcher = Arc::new(StaticFetcher::new(data.clone()));
        let handle = store
            .open("f", 10_000, Arc::clone(&fetcher) as Arc<dyn RangeFetcher>, &CancellationToken::new())
            .unwrap();

        let mut buf = [0u8; 100];
        let n = handle.read_at(&mut buf, 1500).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..], &data[1500..1600]);
        // One aligned chunk [1024, 2048).
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(fetcher.ranges(), vec![(1024, 2048)]);

        // Repeat read inside the chunk: no new fetch.
        let n = handle.read_at(&mut buf, 1024).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(fetcher.calls(), 1);
        drop(handle);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_read_straddling_chunks_fetches_both_once() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, 1024);
        let data = payload(4096);
        let fetcher = Arc::new(StaticFetcher::new(data.clone()));
        let handle = store
            .open("f", 4096, Arc::clone(&fetcher) as Arc<dyn RangeFetcher>, &CancellationToken::new())
            .unwrap();

        let mut buf = [0u8; 200];
        handle.read_at(&mut buf, 1000).await.unwrap();
        assert_eq!(&buf[..], &data[1000..1200]);
        // The straddling read covers [1024*0 .. 2048): gap is one run,
        // fetched as one contiguous range through the barrier.
        assert_eq!(fetcher.total_bytes(), 2048);

        let mut again = [0u8; 200];
        handle.read_at(&mut again, 1000).await.unwrap();
        assert_eq!(fetcher.total_bytes(), 2048);
        drop(handle);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_tail_read_is_short() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, 1024);
        let data = payload(1500);
        let fetcher = Arc::new(StaticFetcher::new(data.clone()));
        let handle = store
            .open("f", 1500, fetcher, &CancellationToken::new())
            .unwrap();

        let mut buf = [0u8; 100];
        let n = handle.read_at(&mut buf, 1499).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], data[1499]);

        assert_eq!(handle.read_at(&mut buf, 1500).await.unwrap(), 0);
        assert_eq!(handle.read_at(&mut buf, 9999).await.unwrap(), 0);
        drop(handle);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_same_chunk_dedups() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, 1024);
        let data = payload(8192);
        let fetcher = Arc::new(StaticFetcher::with_latency(
            data.clone(),
            std::time::Duration::from_millis(20),
        ));
        let handle = Arc::new(
            store
                .open("f", 8192, Arc::clone(&fetcher) as Arc<dyn RangeFetcher>, &CancellationToken::new())
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = Arc::clone(&handle);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096 - 1024];
                let n = handle.read_at(&mut buf, 5 * 1024).await.unwrap();
                (n, buf)
            }));
        }
        for task in tasks {
            let (n, buf) = task.await.unwrap();
            assert_eq!(n, 3072);
            assert_eq!(&buf[..], &data[5120..8192]);
        }
        // All eight reads collapsed onto one fetch of the shared range.
        assert_eq!(fetcher.calls(), 1);
        drop(handle);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, 1024);
        let fetcher = Arc::new(StaticFetcher::new(payload(2048)));
        let handle = store
            .open("f", 2048, fetcher, &CancellationToken::new())
            .unwrap();

        handle.close();
        handle.close();
        assert!(handle.cancellation().is_cancelled());

        let mut buf = [0u8; 10];
        let err = handle.read_at(&mut buf, 0).await.unwrap_err();
        assert!(err.is_cancelled());
        store.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_gap_splits_into_subfetches() {
        let dir = TempDir::new().unwrap();
        // Chunk size of 16 MiB makes a single read produce a >8 MiB gap.
        let store = store_with(&dir, 16 * 1024 * 1024);
        let len = 16 * 1024 * 1024usize;
        let fetcher = Arc::new(StaticFetcher::new(vec![5u8; len]));
        let handle = store
            .open("big", len as u64, Arc::clone(&fetcher) as Arc<dyn RangeFetcher>, &CancellationToken::new())
            .unwrap();

        let mut buf = [0u8; 64];
        handle.read_at(&mut buf, 0).await.unwrap();
        // 16 MiB gap split into 4 MiB sub-fetches.
        assert_eq!(fetcher.calls(), 4);
        for (s, e) in fetcher.ranges() {
            assert_eq!(e - s, 4 * 1024 * 1024);
        }
        drop(handle);
        store.stop().await;
    }
}
