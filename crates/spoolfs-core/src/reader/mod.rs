//! Per-open-file segmented readers.
//!
//! [`FileReader`] is the persistent reader created once per open of a
//! logical file. Its `read_at` resolves an arbitrary byte range through
//! the record's shape (flat plain, flat AES-CBC, or nested sources) by
//! opening an internal reader bounded to exactly that range. The
//! [`SequentialReader`] fallback serves consumers that benefit from a
//! long-lived forward-reading stream instead.

mod cbc;
mod nested;
mod segments;

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ReaderConfig;
use crate::error::ReadError;
use crate::metadata::{encrypted_len, Encryption, FileRecord, Segment};
use crate::pool::SegmentPool;

use self::nested::PlannedSource;
use self::segments::patch_short_tail;

/// Strategy chosen at open time from the record's shape.
///
/// Tail patching has already been applied to every segment list held
/// here, so the read functions see streams of exactly the declared wire
/// length.
#[derive(Debug)]
enum ReadPlan {
    Plain {
        segments: Vec<Segment>,
    },
    Cbc {
        segments: Vec<Segment>,
        key: Vec<u8>,
        iv: Vec<u8>,
    },
    Nested {
        sources: Vec<PlannedSource>,
    },
}

/// Persistent reader over one logical file.
///
/// Cheap to share; all state is immutable after open except the
/// cancellation token. Cancelling the token aborts every in-flight
/// fetch issued on behalf of this reader.
pub struct FileReader {
    size: u64,
    plan: ReadPlan,
    pool: Arc<dyn SegmentPool>,
    cfg: ReaderConfig,
    token: CancellationToken,
}

impl FileReader {
    /// Open a reader for `record`.
    ///
    /// Validates the record's structural invariants and applies the
    /// short-tail patch heuristic to each segment list. `token` is
    /// typically a child of the owning handle's token.
    pub fn open(
        record: &FileRecord,
        pool: Arc<dyn SegmentPool>,
        cfg: ReaderConfig,
        token: CancellationToken,
    ) -> Result<Self, ReadError> {
        record.validate()?;

        let plan = if record.is_nested() {
            let mut sources = Vec::with_capacity(record.nested_sources.len());
            for src in &record.nested_sources {
                let cipher = src.cipher().map(|(k, iv)| (k.to_vec(), iv.to_vec()));
                let wire_len = if cipher.is_some() {
                    encrypted_len(src.inner_volume_size)
                } else {
                    src.inner_volume_size
                };
                sources.push(PlannedSource {
                    segments: patch_short_tail(
                        &src.segments,
                        wire_len,
                        cfg.max_tail_patch_bytes,
                    )?,
                    cipher,
                    inner_offset: src.inner_offset,
                    inner_length: src.inner_length,
                    inner_volume_size: src.inner_volume_size,
                });
            }
            ReadPlan::Nested { sources }
        } else {
            let segments =
                patch_short_tail(&record.segments, record.wire_len(), cfg.max_tail_patch_bytes)?;
            match &record.encryption {
                Encryption::None => ReadPlan::Plain { segments },
                Encryption::AesCbc { key, iv } => ReadPlan::Cbc {
                    segments,
                    key: key.clone(),
                    iv: iv.clone(),
                },
            }
        };

        debug!(
            size = record.size,
            nested = record.is_nested(),
            encrypted = record.encryption.is_encrypted(),
            "opened segmented reader"
        );
        Ok(Self {
            size: record.size,
            plan,
            pool,
            cfg,
            token,
        })
    }

    /// Logical (decrypted, un-nested) file size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The token governing this reader's fetches.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Abort all in-flight fetches and fail subsequent reads.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Read logical bytes `[range.start, range.end)`, clamped to the file
    /// size. This opens an internal reader bounded to exactly the
    /// requested range; it is the form the range cache uses.
    pub async fn read_range(&self, range: Range<u64>) -> Result<Bytes, ReadError> {
        if self.token.is_cancelled() {
            return Err(ReadError::Cancelled);
        }
        let range = range.start.min(self.size)..range.end.min(self.size);
        match &self.plan {
            ReadPlan::Plain { segments } => {
                segments::read_wire_range(&*self.pool, segments, range, &self.cfg, &self.token)
                    .await
            }
            ReadPlan::Cbc { segments, key, iv } => {
                cbc::read_cbc_range(
                    &*self.pool,
                    segments,
                    key,
                    iv,
                    self.size,
                    range,
                    &self.cfg,
                    &self.token,
                )
                .await
            }
            ReadPlan::Nested { sources } => {
                nested::read_nested_range(&*self.pool, sources, range, &self.cfg, &self.token)
                    .await
            }
        }
    }

    /// Random-access read into `buf` at `off`.
    ///
    /// Returns the number of bytes written; short counts only occur at
    /// end of file. `off >= size` reads zero bytes.
    pub async fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, ReadError> {
        if off >= self.size {
            return Ok(0);
        }
        let end = (off + buf.len() as u64).min(self.size);
        let got = self.read_range(off..end).await?;
        buf[..got.len()].copy_from_slice(&got);
        Ok(got.len())
    }
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("size", &self.size)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

/// Default read-ahead unit for the sequential fallback.
const SEQUENTIAL_REFILL_BYTES: u64 = 256 * 1024;

/// Long-lived forward reader over a [`FileReader`].
///
/// Used only by consumers without a range cache, where repeated
/// `read_at` calls would destroy the benefit of a persistent pipelined
/// stream. Buffers one refill unit; a seek discards the buffer.
pub struct SequentialReader {
    reader: Arc<FileReader>,
    pos: u64,
    buf: Bytes,
    buf_start: u64,
}

impl SequentialReader {
    /// Create a sequential reader positioned at `start`.
    pub fn new(reader: Arc<FileReader>, start: u64) -> Self {
        Self {
            reader,
            pos: start,
            buf: Bytes::new(),
            buf_start: 0,
        }
    }

    /// Current stream position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Reposition the stream. Buffered bytes outside the new position are
    /// kept only if the position still falls inside the buffer.
    pub fn seek(&mut self, pos: u64) {
        let buf_end = self.buf_start + self.buf.len() as u64;
        if pos < self.buf_start || pos >= buf_end {
            self.buf = Bytes::new();
        }
        self.pos = pos;
    }

    /// Read the next bytes of the stream into `out`.
    ///
    /// Returns 0 at end of file.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, ReadError> {
        if out.is_empty() || self.pos >= self.reader.size() {
            return Ok(0);
        }
        let buf_end = self.buf_start + self.buf.len() as u64;
        if self.pos < self.buf_start || self.pos >= buf_end {
            let end = (self.pos + SEQUENTIAL_REFILL_BYTES).min(self.reader.size());
            self.buf = self.reader.read_range(self.pos..end).await?;
            self.buf_start = self.pos;
        }
        let avail = &self.buf[(self.pos - self.buf_start) as usize..];
        let n = avail.len().min(out.len());
        out[..n].copy_from_slice(&avail[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}
