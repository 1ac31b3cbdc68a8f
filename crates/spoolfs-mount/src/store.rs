//! The range-cache store: item ownership, rehydration, eviction.
//!
//! One store per process. Items are owned by a membership map keyed by
//! logical path; handles and background tasks reference items through
//! `Arc` but never form ownership cycles: every background task is
//! bound to the store's cancellation token and joined by
//! [`stop`](CacheStore::stop).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use spoolfs_core::ReadError;

use crate::config::{CacheConfig, CLEANUP_INTERVAL, SIDECAR_FLUSH_INTERVAL};
use crate::error::CacheError;
use crate::fetcher::RangeFetcher;
use crate::handle::CacheHandle;
use crate::item::{load_sidecar, CacheItem};
use crate::path_codec::SIDECAR_SUFFIX;
use crate::prefetch::Prefetcher;
use crate::single_flight::{FetchGroup, FetchKey};
use crate::stats::TransferStats;

/// Fetch `[start, end)` through the dedup barrier into the item's data
/// file, publishing the range on success.
///
/// A waiter whose leader was cancelled retries once as the new leader,
/// so a prefetch window dying mid-flight cannot fail an unrelated
/// synchronous read that happened to share its key.
pub(crate) async fn fetch_range_into(
    flight: &FetchGroup,
    item: &Arc<CacheItem>,
    fetcher: &Arc<dyn RangeFetcher>,
    stats: &TransferStats,
    start: u64,
    end: u64,
    token: &CancellationToken,
) -> Result<u64, ReadError> {
    for attempt in 0..2 {
        let key = FetchKey::new(item.path(), start, end);
        let result = flight
            .run(key, async {
                if token.is_cancelled() {
                    return Err(ReadError::Cancelled);
                }
                let bytes = tokio::select! {
                    () = token.cancelled() => return Err(ReadError::Cancelled),
                    res = fetcher.fetch_range(start, end) => res?,
                };
                item.write_range(&bytes, start)?;
                stats.record_downloaded(bytes.len() as u64);
                Ok(bytes.len() as u64)
            })
            .await;
        match result {
            Err(ReadError::Cancelled) if !token.is_cancelled() && attempt == 0 => {
                trace!(start, end, "leader cancelled, retrying fetch");
            }
            other => return other,
        }
    }
    Err(ReadError::Cancelled)
}

/// Process-lifetime owner of all cache items.
pub struct CacheStore {
    cfg: CacheConfig,
    items: Mutex<HashMap<Arc<str>, Arc<CacheItem>>>,
    flight: Arc<FetchGroup>,
    prefetcher: Arc<Prefetcher>,
    stats: Arc<TransferStats>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CacheStore {
    /// Build a store for `cfg`. Call [`start`](Self::start) before use.
    pub fn new(cfg: CacheConfig) -> Arc<Self> {
        let stats = Arc::new(TransferStats::new());
        let prefetcher = Arc::new(Prefetcher::new(cfg.clone(), Arc::clone(&stats)));
        Arc::new(Self {
            cfg,
            items: Mutex::new(HashMap::new()),
            flight: Arc::new(FetchGroup::new()),
            prefetcher,
            stats,
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Store configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    /// Aggregate transfer counters.
    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// The fetch dedup barrier shared by sync reads and prefetch.
    pub fn flight(&self) -> &Arc<FetchGroup> {
        &self.flight
    }

    /// The prefetcher bound to this store.
    pub(crate) fn prefetcher(&self) -> &Arc<Prefetcher> {
        &self.prefetcher
    }

    /// Create the cache directory, rehydrate sidecars and spawn the
    /// background loops (cleanup, sidecar flush, prefetch idle ticker).
    pub fn start(self: &Arc<Self>) -> Result<(), CacheError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.cfg.path)?;
        let restored = self.rehydrate()?;
        info!(
            path = %self.cfg.path.display(),
            items = restored,
            "cache store started"
        );

        let mut tasks = self.tasks.lock();
        {
            let store = Arc::clone(self);
            let token = self.token.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = tick.tick() => store.cleanup_pass(),
                    }
                }
            }));
        }
        {
            let store = Arc::clone(self);
            let token = self.token.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(SIDECAR_FLUSH_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = tick.tick() => store.flush_pass(),
                    }
                }
            }));
        }
        tasks.push(self.prefetcher.spawn_idle_ticker(self.token.child_token()));
        Ok(())
    }

    /// Cancel background work, join the loops, flush dirty sidecars.
    pub async fn stop(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.flush_pass();
        info!("cache store stopped");
    }

    /// Open a view onto `path`, creating the item lazily.
    ///
    /// `size` is the authoritative logical size from metadata; a cached
    /// item of a different size is stale (the path was re-ingested) and
    /// is dropped before opening fresh state. `parent` scopes the
    /// handle's fetch cancellation.
    pub fn open(
        self: &Arc<Self>,
        path: &str,
        size: u64,
        fetcher: Arc<dyn RangeFetcher>,
        parent: &CancellationToken,
    ) -> Result<CacheHandle, CacheError> {
        if self.token.is_cancelled() {
            return Err(CacheError::Stopped);
        }
        let item = {
            let mut items = self.items.lock();
            let existing = items.get(path).cloned();
            let item = match existing {
                Some(item) if item.size() == size => item,
                stale => {
                    if let Some(stale) = stale {
                        debug!(path, old = stale.size(), new = size, "dropping stale cache item");
                        items.remove(path);
                        stale.delete_files();
                    }
                    let item = Arc::new(CacheItem::new(&self.cfg.path, path, size));
                    items.insert(Arc::clone(item.path()), Arc::clone(&item));
                    item
                }
            };
            item.retain();
            item
        };
        if let Err(e) = item.ensure_open() {
            self.release_item(&item);
            return Err(e.into());
        }
        Ok(CacheHandle::new(
            Arc::clone(self),
            item,
            fetcher,
            parent.child_token(),
        ))
    }

    /// Drop one handle's reference to an item.
    pub(crate) fn release_item(&self, item: &Arc<CacheItem>) {
        if item.release() == 0 {
            self.prefetcher.stop_file(item.path());
        }
    }

    /// Total bytes materialized across all items.
    pub fn total_cached_bytes(&self) -> u64 {
        let items: Vec<_> = self.items.lock().values().cloned().collect();
        items.iter().map(|i| i.cached_bytes()).sum()
    }

    /// Number of tracked items.
    pub fn item_count(&self) -> usize {
        self.items.lock().len()
    }

    /// Scan the cache directory and rebuild item state from sidecars.
    /// Data files without readable sidecars are left alone.
    fn rehydrate(&self) -> Result<usize, CacheError> {
        let mut restored = 0;
        let mut items = self.items.lock();
        for entry in std::fs::read_dir(&self.cfg.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            let sidecar = match load_sidecar(&entry.path()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(file = name, error = %e, "ignoring unreadable sidecar");
                    continue;
                }
            };
            let item = Arc::new(CacheItem::from_sidecar(&self.cfg.path, sidecar));
            items.insert(Arc::clone(item.path()), item);
            restored += 1;
        }
        Ok(restored)
    }

    /// One eviction pass: TTL expiry first, then the size cap, oldest
    /// `last_access` first. Items with open handles are never touched.
    fn cleanup_pass(&self) {
        let expiry = self.cfg.expiry;
        let cap = self.cfg.max_size_bytes;

        let expired: Vec<Arc<CacheItem>> = {
            let mut items = self.items.lock();
            if expiry.is_zero() {
                Vec::new()
            } else {
                let doomed: Vec<Arc<str>> = items
                    .values()
                    .filter(|i| i.open_count() == 0 && i.idle_for() > expiry)
                    .map(|i| Arc::clone(i.path()))
                    .collect();
                doomed
                    .iter()
                    .filter_map(|path| items.remove(path))
                    .collect()
            }
        };
        for item in &expired {
            debug!(path = %item.path(), "expiring idle cache item");
            item.delete_files();
        }

        if cap == 0 {
            return;
        }
        loop {
            let (total, victim) = {
                let mut items = self.items.lock();
                let total: u64 = items.values().map(|i| i.cached_bytes()).sum();
                if total <= cap {
                    (total, None)
                } else {
                    let victim_path = items
                        .values()
                        .filter(|i| i.open_count() == 0)
                        .min_by_key(|i| i.last_access_millis())
                        .map(|i| Arc::clone(i.path()));
                    match victim_path {
                        Some(path) => (total, items.remove(&path)),
                        None => (total, None),
                    }
                }
            };
            match victim {
                Some(item) => {
                    debug!(
                        path = %item.path(),
                        total,
                        cap,
                        "evicting cache item over size cap"
                    );
                    item.delete_files();
                }
                None => break,
            }
        }
    }

    /// Flush every dirty sidecar.
    fn flush_pass(&self) {
        let items: Vec<_> = self.items.lock().values().cloned().collect();
        for item in items {
            if item.is_dirty() {
                if let Err(e) = item.flush_sidecar() {
                    warn!(path = %item.path(), error = %e, "sidecar flush failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticFetcher;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            path: dir.path().to_path_buf(),
            chunk_size: 1024,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(test_config(&dir));
        store.start().unwrap();
        store.start().unwrap();
        store.stop().await;
    }

    #[tokio::test]
    async fn test_open_rejects_after_stop() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(test_config(&dir));
        store.start().unwrap();
        store.stop().await;

        let fetcher = Arc::new(StaticFetcher::new(vec![0u8; 100]));
        let result = store.open("f", 100, fetcher, &CancellationToken::new());
        match result {
            Err(err) => assert!(matches!(err, CacheError::Stopped)),
            Ok(_) => panic!("expected CacheError::Stopped"),
        }
    }

    #[tokio::test]
    async fn test_stale_size_drops_item() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(test_config(&dir));
        store.start().unwrap();

        let fetcher = Arc::new(StaticFetcher::new(vec![3u8; 2048]));
        let token = CancellationToken::new();
        {
            let handle = store.open("f", 2048, Arc::clone(&fetcher) as Arc<dyn RangeFetcher>, &token).unwrap();
            let mut buf = [0u8; 16];
            handle.read_at(&mut buf, 0).await.unwrap();
        }
        assert!(store.total_cached_bytes() > 0);

        // Re-ingestion changed the size; cached bytes must not survive.
        let handle = store.open("f", 4096, Arc::clone(&fetcher) as Arc<dyn RangeFetcher>, &token).unwrap();
        assert_eq!(handle.size(), 4096);
        assert_eq!(store.total_cached_bytes(), 0);
        drop(handle);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_rehydrate_restores_ranges() {
        let dir = TempDir::new().unwrap();
        let payload = vec![9u8; 4096];
        {
            let store = CacheStore::new(test_config(&dir));
            store.start().unwrap();
            let fetcher = Arc::new(StaticFetcher::new(payload.clone()));
            let handle = store
                .open("shows/e1", 4096, fetcher, &CancellationToken::new())
                .unwrap();
            let mut buf = [0u8; 512];
            handle.read_at(&mut buf, 0).await.unwrap();
            drop(handle);
            store.stop().await; // flushes sidecars
        }

        let store = CacheStore::new(test_config(&dir));
        store.start().unwrap();
        assert_eq!(store.item_count(), 1);
        assert_eq!(store.total_cached_bytes(), 1024); // one aligned chunk

        // A hit on the rehydrated range does not refetch.
        let fetcher = Arc::new(StaticFetcher::new(payload));
        let handle = store
            .open("shows/e1", 4096, Arc::clone(&fetcher) as Arc<dyn RangeFetcher>, &CancellationToken::new())
            .unwrap();
        let mut buf = [0u8; 512];
        handle.read_at(&mut buf, 100).await.unwrap();
        assert_eq!(fetcher.calls(), 0);
        drop(handle);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_unreadable_sidecar_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data-without-sidecar"), b"x").unwrap();
        std::fs::write(dir.path().join("junk.meta"), b"not json").unwrap();

        let store = CacheStore::new(test_config(&dir));
        store.start().unwrap();
        assert_eq!(store.item_count(), 0);
        // The orphan data file is not deleted.
        assert!(dir.path().join("data-without-sidecar").exists());
        store.stop().await;
    }

    #[tokio::test]
    async fn test_cleanup_expires_idle_items() {
        let dir = TempDir::new().unwrap();
        let cfg = CacheConfig {
            expiry: std::time::Duration::from_millis(1),
            ..test_config(&dir)
        };
        let store = CacheStore::new(cfg);
        store.start().unwrap();

        let fetcher = Arc::new(StaticFetcher::new(vec![1u8; 2048]));
        let handle = store
            .open("f", 2048, fetcher, &CancellationToken::new())
            .unwrap();
        let mut buf = [0u8; 64];
        handle.read_at(&mut buf, 0).await.unwrap();

        // Open items are never expired.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.cleanup_pass();
        assert_eq!(store.item_count(), 1);

        drop(handle);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.cleanup_pass();
        assert_eq!(store.item_count(), 0);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_size_cap_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let cfg = CacheConfig {
            max_size_bytes: 3 * 1024,
            ..test_config(&dir)
        };
        let store = CacheStore::new(cfg);
        store.start().unwrap();

        let token = CancellationToken::new();
        for (i, path) in ["a", "b", "c", "d"].iter().enumerate() {
            let fetcher = Arc::new(StaticFetcher::new(vec![i as u8; 1024]));
            let handle = store.open(path, 1024, fetcher, &token).unwrap();
            let mut buf = [0u8; 64];
            handle.read_at(&mut buf, 0).await.unwrap();
            drop(handle);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.total_cached_bytes(), 4 * 1024);

        store.cleanup_pass();
        assert!(store.total_cached_bytes() <= 3 * 1024);
        // The least recently used item went first.
        let survivors: Vec<String> = {
            let items = store.items.lock();
            items.keys().map(|k| k.to_string()).collect()
        };
        assert!(!survivors.contains(&"a".to_string()));
        store.stop().await;
    }
}
