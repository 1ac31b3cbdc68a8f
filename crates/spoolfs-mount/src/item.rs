//! One cached file: sparse data file, sidecar, interval accounting.
//!
//! The data file is sparse and offsets in it equal logical offsets in
//! the cached file, so serving a hit is a single positional read. The
//! sidecar is a JSON document rewritten atomically (write + rename) by
//! the store's flush loop; on startup items are rehydrated from
//! sidecars.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::intervals::{Interval, IntervalSet};
use crate::path_codec::{self, SIDECAR_SUFFIX};

/// Serialized sidecar form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    /// Logical path this item caches.
    pub path: String,
    /// Logical file size.
    pub size: u64,
    /// Materialized ranges.
    pub ranges: IntervalSet,
    /// Creation time of the cache item.
    pub created: SystemTime,
    /// Last access time at flush.
    pub last_access: SystemTime,
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// In-memory state of one cached path.
///
/// Items are owned by the store's map and referenced by handles; the
/// interval set is guarded by a per-item RW-lock, the data file handle
/// is opened on the first reference and closed when the count returns
/// to zero.
pub struct CacheItem {
    path: Arc<str>,
    size: u64,
    data_path: PathBuf,
    sidecar_path: PathBuf,
    ranges: RwLock<IntervalSet>,
    file: Mutex<Option<Arc<File>>>,
    open_count: AtomicU32,
    last_access_ms: AtomicU64,
    created: SystemTime,
    dirty: AtomicBool,
}

impl CacheItem {
    /// Create state for a path that has no on-disk presence yet.
    pub fn new(cache_dir: &Path, path: &str, size: u64) -> Self {
        let encoded = path_codec::encode(path);
        let data_path = cache_dir.join(&encoded);
        let sidecar_path = cache_dir.join(format!("{encoded}{SIDECAR_SUFFIX}"));
        Self {
            path: Arc::from(path),
            size,
            data_path,
            sidecar_path,
            ranges: RwLock::new(IntervalSet::new()),
            file: Mutex::new(None),
            open_count: AtomicU32::new(0),
            last_access_ms: AtomicU64::new(epoch_millis(SystemTime::now())),
            created: SystemTime::now(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Rehydrate from a sidecar read at startup.
    pub fn from_sidecar(cache_dir: &Path, sidecar: Sidecar) -> Self {
        let item = Self::new(cache_dir, &sidecar.path, sidecar.size);
        *item.ranges.write() = sidecar.ranges;
        item.last_access_ms
            .store(epoch_millis(sidecar.last_access), Ordering::Relaxed);
        item
    }

    /// Logical path.
    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    /// Logical file size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current open-handle count.
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Bytes currently materialized.
    pub fn cached_bytes(&self) -> u64 {
        self.ranges.read().total()
    }

    /// Age since the last access.
    pub fn idle_for(&self) -> Duration {
        let last = UNIX_EPOCH + Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        SystemTime::now().duration_since(last).unwrap_or_default()
    }

    /// Last access as a sortable key.
    pub fn last_access_millis(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Record an access and mark the sidecar dirty.
    pub fn touch(&self) {
        self.last_access_ms
            .store(epoch_millis(SystemTime::now()), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    /// Reserve a reference without touching the disk.
    ///
    /// The store calls this under its membership lock so eviction can
    /// check `open_count` race-free; the actual file open happens in
    /// [`ensure_open`](Self::ensure_open) outside the lock.
    pub fn retain(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Lazily open (and size) the sparse data file.
    pub fn ensure_open(&self) -> io::Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.data_path)?;
            // Full-size sparse file: holes read as zeros, consume no blocks.
            if file.metadata()?.len() < self.size {
                file.set_len(self.size)?;
            }
            *guard = Some(Arc::new(file));
        }
        Ok(())
    }

    /// Take a reference and open the data file.
    pub fn acquire(&self) -> io::Result<()> {
        self.retain();
        if let Err(e) = self.ensure_open() {
            self.release();
            return Err(e);
        }
        Ok(())
    }

    /// Drop a reference; closes the data file at zero. Returns the new
    /// count.
    pub fn release(&self) -> u32 {
        let prev = self.open_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without acquire");
        let now = prev.saturating_sub(1);
        if now == 0 {
            *self.file.lock() = None;
        }
        now
    }

    fn file(&self) -> io::Result<Arc<File>> {
        self.file
            .lock()
            .clone()
            .ok_or_else(|| io::Error::other(format!("data file for {} not open", self.path)))
    }

    /// Whether `[start, end)` is fully materialized.
    pub fn present(&self, start: u64, end: u64) -> bool {
        self.ranges.read().present(start, end)
    }

    /// Gaps of `[start, end)` not yet materialized.
    pub fn find_missing(&self, start: u64, end: u64) -> Vec<Interval> {
        self.ranges.read().find_missing(start, end)
    }

    /// Positional read from the data file.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        self.file()?.read_exact_at(buf, off)
    }

    /// Positional write to the data file, then publish the range.
    ///
    /// The interval set is only updated for bytes actually written, so a
    /// failed write leaves no inconsistent coverage behind.
    pub fn write_range(&self, data: &[u8], off: u64) -> io::Result<()> {
        self.file()?.write_all_at(data, off)?;
        self.ranges.write().insert(off, off + data.len() as u64);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the sidecar needs flushing.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the sidecar atomically (temp file + rename) and clear the
    /// dirty flag.
    pub fn flush_sidecar(&self) -> Result<(), CacheError> {
        let sidecar = Sidecar {
            path: self.path.to_string(),
            size: self.size,
            ranges: self.ranges.read().clone(),
            created: self.created,
            last_access: UNIX_EPOCH
                + Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed)),
        };
        let json = serde_json::to_vec_pretty(&sidecar).map_err(|e| CacheError::CorruptSidecar {
            path: self.path.to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.sidecar_path.with_extension("meta.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.sidecar_path)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Remove the data file and sidecar from disk.
    pub fn delete_files(&self) {
        for path in [&self.data_path, &self.sidecar_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to delete cache file");
                }
            }
        }
        debug!(path = %self.path, "cache item deleted");
    }
}

/// Read and parse a sidecar file.
pub fn load_sidecar(path: &Path) -> Result<Sidecar, CacheError> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| CacheError::CorruptSidecar {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_sparse_file() {
        let dir = TempDir::new().unwrap();
        let item = CacheItem::new(dir.path(), "a/b.mkv", 1 << 20);
        item.acquire().unwrap();

        let meta = std::fs::metadata(dir.path().join(path_codec::encode("a/b.mkv"))).unwrap();
        assert_eq!(meta.len(), 1 << 20);

        // Holes read as zeros.
        let mut buf = [1u8; 16];
        item.read_at(&mut buf, 4096).unwrap();
        assert_eq!(buf, [0u8; 16]);

        assert_eq!(item.release(), 0);
    }

    #[test]
    fn test_write_publishes_range() {
        let dir = TempDir::new().unwrap();
        let item = CacheItem::new(dir.path(), "f", 4096);
        item.acquire().unwrap();

        assert!(!item.present(100, 200));
        item.write_range(&[7u8; 100], 100).unwrap();
        assert!(item.present(100, 200));
        assert_eq!(item.cached_bytes(), 100);

        let mut buf = [0u8; 100];
        item.read_at(&mut buf, 100).unwrap();
        assert_eq!(buf, [7u8; 100]);
        item.release();
    }

    #[test]
    fn test_release_closes_file() {
        let dir = TempDir::new().unwrap();
        let item = CacheItem::new(dir.path(), "f", 64);
        item.acquire().unwrap();
        item.acquire().unwrap();
        assert_eq!(item.release(), 1);
        // Still open: reads work.
        let mut buf = [0u8; 8];
        item.read_at(&mut buf, 0).unwrap();
        assert_eq!(item.release(), 0);
        // Closed now.
        assert!(item.read_at(&mut buf, 0).is_err());
    }

    #[test]
    fn test_sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let item = CacheItem::new(dir.path(), "movies/x y.mkv", 9000);
        item.acquire().unwrap();
        item.write_range(&[1u8; 500], 0).unwrap();
        item.write_range(&[2u8; 500], 4096).unwrap();
        item.flush_sidecar().unwrap();
        assert!(!item.is_dirty());
        item.release();

        let sidecar_path = dir
            .path()
            .join(format!("{}{SIDECAR_SUFFIX}", path_codec::encode("movies/x y.mkv")));
        let sidecar = load_sidecar(&sidecar_path).unwrap();
        assert_eq!(sidecar.path, "movies/x y.mkv");
        assert_eq!(sidecar.size, 9000);

        let restored = CacheItem::from_sidecar(dir.path(), sidecar);
        assert!(restored.present(0, 500));
        assert!(restored.present(4096, 4596));
        assert!(!restored.present(500, 600));
    }

    #[test]
    fn test_corrupt_sidecar_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.meta");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            load_sidecar(&path),
            Err(CacheError::CorruptSidecar { .. })
        ));
    }

    #[test]
    fn test_delete_files_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let item = CacheItem::new(dir.path(), "f", 64);
        item.acquire().unwrap();
        item.flush_sidecar().unwrap();
        item.release();
        item.delete_files();
        item.delete_files(); // no panic on missing files
    }
}
