//! Test doubles shared across the workspace.
//!
//! [`MemoryPool`] is an in-memory [`SegmentPool`] with per-article fetch
//! counting and simple fault injection, used by unit tests here and by
//! the cache and FUSE test suites downstream.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::metadata::{encrypted_len, Encryption, FileRecord, Segment};
use crate::pool::{PoolError, PoolMetrics, SegmentBody, SegmentPool};

/// In-memory segment pool.
#[derive(Default)]
pub struct MemoryPool {
    articles: Mutex<HashMap<String, Bytes>>,
    counts: Mutex<HashMap<String, u64>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    fetches: AtomicU64,
    latency: Option<Duration>,
    metrics: PoolMetrics,
}

impl MemoryPool {
    /// Empty pool with no artificial latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that sleeps for `latency` on every fetch.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Store an article body.
    pub fn insert(&self, article_id: &str, body: impl Into<Bytes>) {
        self.articles
            .lock()
            .unwrap()
            .insert(article_id.to_string(), body.into());
    }

    /// Drop an article so fetches report it missing.
    pub fn remove(&self, article_id: &str) {
        self.articles.lock().unwrap().remove(article_id);
    }

    /// Make the next `times` fetches of an article fail transiently.
    pub fn fail_transient(&self, article_id: &str, times: u32) {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(article_id.to_string(), times);
    }

    /// Total fetches attempted, successful or not.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetches attempted for one article.
    pub fn fetches_for(&self, article_id: &str) -> u64 {
        self.counts
            .lock()
            .unwrap()
            .get(article_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SegmentPool for MemoryPool {
    async fn fetch(
        &self,
        article_id: &str,
        _groups: &[String],
        token: &CancellationToken,
    ) -> Result<SegmentBody, PoolError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        *self
            .counts
            .lock()
            .unwrap()
            .entry(article_id.to_string())
            .or_insert(0) += 1;

        if let Some(latency) = self.latency {
            tokio::select! {
                () = token.cancelled() => return Err(PoolError::Cancelled),
                () = tokio::time::sleep(latency) => {}
            }
        }
        if token.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(article_id) {
                if *left > 0 {
                    *left -= 1;
                    self.metrics.record_error();
                    return Err(PoolError::Transient {
                        article_id: article_id.to_string(),
                        reason: "injected failure".to_string(),
                    });
                }
            }
        }

        let body = self.articles.lock().unwrap().get(article_id).cloned();
        match body {
            Some(body) => {
                self.metrics.record_fetch(body.len() as u64);
                Ok(Box::new(Cursor::new(body)))
            }
            None => {
                self.metrics.record_error();
                Err(PoolError::Missing {
                    article_id: article_id.to_string(),
                })
            }
        }
    }

    fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

/// Deterministic non-repeating byte pattern of length `len`.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + (i >> 8) * 7 + 11) & 0xff) as u8)
        .collect()
}

/// AES-CBC encrypt `plain`, zero-padding to a whole number of blocks.
///
/// Mirrors the on-wire form the reader consumes: `encrypted_len` bytes,
/// with the padding trimmed against the plaintext length on read.
pub fn encrypt_cbc(key: &[u8], iv: &[u8], plain: &[u8]) -> Vec<u8> {
    use aes::{Aes128, Aes192, Aes256};
    use cbc::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};

    let padded = encrypted_len(plain.len() as u64) as usize;
    let mut buf = vec![0u8; padded];
    buf[..plain.len()].copy_from_slice(plain);
    match key.len() {
        16 => {
            cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .unwrap()
                .encrypt_padded_mut::<NoPadding>(&mut buf, padded)
                .unwrap();
        }
        24 => {
            cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
                .unwrap()
                .encrypt_padded_mut::<NoPadding>(&mut buf, padded)
                .unwrap();
        }
        32 => {
            cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .unwrap()
                .encrypt_padded_mut::<NoPadding>(&mut buf, padded)
                .unwrap();
        }
        n => panic!("unsupported key length {n}"),
    }
    buf
}

/// Split `wire` into segments of `seg_size`, loading each body into the
/// pool under `{prefix}-{index}` article ids.
pub fn load_segments(
    pool: &MemoryPool,
    wire: &[u8],
    seg_size: usize,
    prefix: &str,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    for (i, chunk) in wire.chunks(seg_size).enumerate() {
        let article_id = format!("{prefix}-{i}");
        let start = (i * seg_size) as u64;
        pool.insert(&article_id, chunk.to_vec());
        segments.push(Segment {
            article_id,
            groups: vec!["alt.binaries.test".to_string()],
            size: chunk.len() as u64,
            start_offset: start,
            end_offset: start + chunk.len() as u64 - 1,
            patched: false,
        });
    }
    segments
}

/// Build a plain flat record whose payload is loaded into `pool`.
pub fn build_plain_record(
    pool: &MemoryPool,
    payload: &[u8],
    seg_size: usize,
    prefix: &str,
) -> FileRecord {
    FileRecord {
        size: payload.len() as u64,
        encryption: Encryption::None,
        segments: load_segments(pool, payload, seg_size, prefix),
        nested_sources: Vec::new(),
        source_id: "test".to_string(),
        mtime: SystemTime::UNIX_EPOCH,
    }
}

/// Build an AES-CBC flat record whose ciphertext is loaded into `pool`.
pub fn build_cbc_record(
    pool: &MemoryPool,
    payload: &[u8],
    key: &[u8],
    iv: &[u8],
    seg_size: usize,
    prefix: &str,
) -> FileRecord {
    let wire = encrypt_cbc(key, iv, payload);
    FileRecord {
        size: payload.len() as u64,
        encryption: Encryption::AesCbc {
            key: key.to_vec(),
            iv: iv.to_vec(),
        },
        segments: load_segments(pool, &wire, seg_size, prefix),
        nested_sources: Vec::new(),
        source_id: "test".to_string(),
        mtime: SystemTime::UNIX_EPOCH,
    }
}
