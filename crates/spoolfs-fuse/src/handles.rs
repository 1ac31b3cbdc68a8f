//! Open-file handles.
//!
//! Each kernel `open` creates an [`OpenHandle`]: a read target (the
//! range cache view, or a bare segmented reader when the cache is
//! disabled) plus the playback session it belongs to. Handles do not
//! carry a seek position (every kernel read is positional) and close
//! exactly once via a CAS, so double `release` is a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use spoolfs_core::{FileReader, ReadError, SequentialReader};
use spoolfs_mount::{CacheHandle, RangeFetcher, SessionTracker, StreamSession};

/// [`RangeFetcher`] adapter that attributes backend traffic to the
/// playback session it serves, so per-session incoming speed and the
/// buffered high-water mark reflect both sync fetches and prefetch.
pub struct SessionFetcher {
    inner: Arc<FileReader>,
    session: Arc<StreamSession>,
}

impl SessionFetcher {
    /// Wrap `inner`, accounting to `session`.
    pub fn new(inner: Arc<FileReader>, session: Arc<StreamSession>) -> Self {
        Self { inner, session }
    }
}

#[async_trait]
impl RangeFetcher for SessionFetcher {
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, ReadError> {
        let bytes = self.inner.read_range(start..end).await?;
        self.session.record_download(bytes.len() as u64);
        self.session.record_buffered(start + bytes.len() as u64);
        Ok(bytes)
    }
}

/// Where a handle's bytes come from.
pub enum ReadTarget {
    /// Through the range cache (normal mode).
    Cached(CacheHandle),
    /// Straight from a long-lived sequential reader (cache disabled).
    /// Repeated bounded `read_at` opens would defeat the reader's
    /// pipeline, so positional reads are served by seeking one shared
    /// stream; concurrent reads on the handle serialize here.
    Direct {
        /// The underlying per-open reader, for cancellation.
        reader: Arc<FileReader>,
        /// The forward stream serving the reads.
        stream: tokio::sync::Mutex<SequentialReader>,
    },
}

impl ReadTarget {
    /// Direct target over a fresh sequential stream.
    pub fn direct(reader: Arc<FileReader>) -> Self {
        let stream = SequentialReader::new(Arc::clone(&reader), 0);
        ReadTarget::Direct {
            reader,
            stream: tokio::sync::Mutex::new(stream),
        }
    }
}

/// One kernel open of a logical file.
pub struct OpenHandle {
    /// Inode this handle was opened for.
    pub ino: u64,
    target: ReadTarget,
    session: Arc<StreamSession>,
    tracker: Arc<SessionTracker>,
    closed: AtomicBool,
}

impl OpenHandle {
    /// Wire up a handle to its read target and session.
    pub fn new(
        ino: u64,
        target: ReadTarget,
        session: Arc<StreamSession>,
        tracker: Arc<SessionTracker>,
    ) -> Self {
        Self {
            ino,
            target,
            session,
            tracker,
            closed: AtomicBool::new(false),
        }
    }

    /// The session this open is aggregated into.
    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    /// Positional read, accounted against the session.
    pub async fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, ReadError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReadError::Cancelled);
        }
        let n = match &self.target {
            ReadTarget::Cached(cache) => cache.read_at(buf, off).await?,
            ReadTarget::Direct { stream, .. } => {
                let mut stream = stream.lock().await;
                stream.seek(off);
                let mut filled = 0;
                while filled < buf.len() {
                    let n = stream.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                filled
            }
        };
        self.session.record_read(off, n as u64);
        Ok(n)
    }

    /// Close the handle: cancel in-flight work, detach from the session.
    /// Idempotent; only the first call acts.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.target {
            ReadTarget::Cached(cache) => cache.close(),
            ReadTarget::Direct { reader, .. } => reader.cancel(),
        }
        self.tracker.close(&self.session);
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Thread-safe handle table with auto-incrementing ids.
pub struct HandleTable {
    handles: DashMap<u64, Arc<OpenHandle>>,
    next_id: AtomicU64,
}

impl HandleTable {
    /// Empty table; ids start at 1.
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handle, returning its id.
    pub fn insert(&self, handle: OpenHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, Arc::new(handle));
        id
    }

    /// Look up a handle.
    pub fn get(&self, id: u64) -> Option<Arc<OpenHandle>> {
        self.handles.get(&id).map(|e| Arc::clone(&e))
    }

    /// Remove and return a handle.
    pub fn remove(&self, id: u64) -> Option<Arc<OpenHandle>> {
        self.handles.remove(&id).map(|(_, h)| h)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are open.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
