//! Single-flight deduplication for backend range fetches.
//!
//! When the synchronous read path and the prefetcher (or several
//! concurrent readers) want the same aligned range before the first
//! fetch completes, only one request actually goes to the backend
//! ("leader") and the rest ("waiters") share its outcome. Different keys
//! proceed in parallel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use spoolfs_core::ReadError;

/// Key identifying one aligned fetch: path plus half-open byte range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    /// Logical path of the file.
    pub path: Arc<str>,
    /// Range start.
    pub start: u64,
    /// Range end (exclusive).
    pub end: u64,
}

impl FetchKey {
    /// Build a key for `path` covering `[start, end)`.
    pub fn new(path: &Arc<str>, start: u64, end: u64) -> Self {
        Self {
            path: Arc::clone(path),
            start,
            end,
        }
    }
}

impl std::fmt::Display for FetchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.path, self.start, self.end)
    }
}

/// Cloneable failure shared with waiters when the leader's fetch fails.
#[derive(Debug, Clone)]
pub enum FetchFailure {
    /// The read was cancelled (waiters retry or propagate EINTR).
    Cancelled,
    /// Hard missing-data condition.
    MissingData(String),
    /// Any other backend or disk failure, flattened to a message.
    Failed(String),
}

impl From<&ReadError> for FetchFailure {
    fn from(e: &ReadError) -> Self {
        match e {
            ReadError::Cancelled => FetchFailure::Cancelled,
            ReadError::MissingSegment { .. } | ReadError::MissingData(_) => {
                FetchFailure::MissingData(e.to_string())
            }
            other => FetchFailure::Failed(other.to_string()),
        }
    }
}

impl From<FetchFailure> for ReadError {
    fn from(f: FetchFailure) -> Self {
        match f {
            FetchFailure::Cancelled => ReadError::Cancelled,
            FetchFailure::MissingData(m) => ReadError::MissingData(m),
            FetchFailure::Failed(m) => ReadError::Backend(m),
        }
    }
}

/// Outcome broadcast from leader to waiters: bytes materialized.
type Outcome = Result<u64, FetchFailure>;

struct InFlight {
    sender: broadcast::Sender<Outcome>,
}

/// Statistics for the dedup barrier.
#[derive(Debug, Default)]
pub struct FlightStats {
    /// Requests that performed the fetch.
    pub leaders: AtomicU64,
    /// Requests that attached to an existing fetch.
    pub waiters: AtomicU64,
}

impl FlightStats {
    /// Fraction of requests deduplicated away.
    pub fn dedup_ratio(&self) -> f64 {
        let leaders = self.leaders.load(Ordering::Relaxed);
        let waiters = self.waiters.load(Ordering::Relaxed);
        let total = leaders + waiters;
        if total == 0 {
            0.0
        } else {
            waiters as f64 / total as f64
        }
    }
}

/// The dedup barrier. One instance per cache store.
#[derive(Default)]
pub struct FetchGroup {
    in_flight: DashMap<FetchKey, InFlight>,
    stats: FlightStats,
}

impl FetchGroup {
    /// New empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key`, deduplicating against concurrent callers.
    ///
    /// The first caller for a key becomes the leader and executes the
    /// future; everyone else awaits the leader's broadcast outcome. The
    /// entry is removed before the outcome is sent, so a fetch that
    /// completes and is requested again re-executes (the range is then
    /// normally served from disk before reaching the barrier).
    pub async fn run<F>(&self, key: FetchKey, fetch: F) -> Result<u64, ReadError>
    where
        F: Future<Output = Result<u64, ReadError>>,
    {
        let receiver = {
            match self.in_flight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    self.stats.waiters.fetch_add(1, Ordering::Relaxed);
                    Some(occupied.get().sender.subscribe())
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (sender, _) = broadcast::channel(1);
                    vacant.insert(InFlight { sender });
                    self.stats.leaders.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        };

        if let Some(mut rx) = receiver {
            trace!(%key, "waiting on in-flight fetch");
            return match rx.recv().await {
                Ok(Ok(n)) => Ok(n),
                Ok(Err(failure)) => Err(failure.into()),
                // Leader dropped without completing (cancelled mid-flight).
                Err(_) => Err(ReadError::Cancelled),
            };
        }

        trace!(%key, "leading fetch");
        let result = fetch.await;
        let outcome: Outcome = match &result {
            Ok(n) => Ok(*n),
            Err(e) => Err(FetchFailure::from(e)),
        };
        if let Some((_, entry)) = self.in_flight.remove(&key) {
            let _ = entry.sender.send(outcome);
        }
        result
    }

    /// Number of fetches currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Barrier statistics.
    pub fn stats(&self) -> &FlightStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn key(start: u64, end: u64) -> FetchKey {
        FetchKey::new(&Arc::from("movies/a.mkv"), start, end)
    }

    #[tokio::test]
    async fn test_single_caller_executes() {
        let group = FetchGroup::new();
        let n = group.run(key(0, 10), async { Ok(10) }).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(group.in_flight_count(), 0);
        assert_eq!(group.stats().leaders.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_fetches_once() {
        let group = Arc::new(FetchGroup::new());
        let executed = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let group = Arc::clone(&group);
            let executed = Arc::clone(&executed);
            tasks.push(tokio::spawn(async move {
                group
                    .run(key(0, 1024), async {
                        executed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(1024)
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 1024);
        }
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(group.stats().waiters.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn test_different_keys_run_in_parallel() {
        let group = Arc::new(FetchGroup::new());
        let executed = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for i in 0..4u64 {
            let group = Arc::clone(&group);
            let executed = Arc::clone(&executed);
            tasks.push(tokio::spawn(async move {
                group
                    .run(key(i * 100, i * 100 + 100), async {
                        executed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(100)
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_leader_failure_propagates_to_waiters() {
        let group = Arc::new(FetchGroup::new());

        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run(key(0, 10), async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(ReadError::MissingData("gone".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let waiter = group.run(key(0, 10), async { Ok(10) }).await;

        assert!(matches!(waiter, Err(ReadError::MissingData(_))));
        assert!(leader.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_completed_key_reexecutes() {
        let group = FetchGroup::new();
        let executed = AtomicU32::new(0);

        for _ in 0..2 {
            group
                .run(key(0, 10), async {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(10)
                })
                .await
                .unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 2);
    }
}
