//! Test doubles for the cache layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use spoolfs_core::ReadError;

use crate::fetcher::RangeFetcher;

/// A [`RangeFetcher`] over a fixed byte vector, with call accounting and
/// optional latency / failure injection.
pub struct StaticFetcher {
    data: Vec<u8>,
    calls: AtomicU64,
    total_bytes: AtomicU64,
    ranges: Mutex<Vec<(u64, u64)>>,
    latency: Option<Duration>,
    /// Calls after this many succeed fail with a backend error.
    fail_after: Option<u64>,
}

impl StaticFetcher {
    /// Fetcher serving `data` instantly.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            calls: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            ranges: Mutex::new(Vec::new()),
            latency: None,
            fail_after: None,
        }
    }

    /// Fetcher that sleeps `latency` before serving each range.
    pub fn with_latency(data: Vec<u8>, latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new(data)
        }
    }

    /// Fetcher whose calls beyond `ok_calls` fail with a backend error.
    pub fn failing_after(data: Vec<u8>, ok_calls: u64) -> Self {
        Self {
            fail_after: Some(ok_calls),
            ..Self::new(data)
        }
    }

    /// Number of fetch calls made.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Total bytes served.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// The `(start, end)` ranges requested, in call order.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeFetcher for StaticFetcher {
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, ReadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_after.is_some_and(|ok| call > ok) {
            return Err(ReadError::Backend("injected backend failure".to_string()));
        }
        let end = end.min(self.data.len() as u64);
        if start >= end {
            return Ok(Bytes::new());
        }
        self.ranges.lock().unwrap().push((start, end));
        self.total_bytes.fetch_add(end - start, Ordering::Relaxed);
        Ok(Bytes::copy_from_slice(&self.data[start as usize..end as usize]))
    }
}
