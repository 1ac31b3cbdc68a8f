//! End-to-end playback scenarios: kernel-style reads through the range
//! cache backed by the real segmented reader over an in-memory pool.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use spoolfs_core::testing::{build_plain_record, pattern_bytes, MemoryPool};
use spoolfs_core::{FileReader, ReaderConfig, SegmentPool};
use spoolfs_mount::{CacheConfig, CacheStore, RangeFetcher};

const MIB: u64 = 1024 * 1024;
const SEGMENT: usize = 512 * 1024;

struct Fixture {
    pool: Arc<MemoryPool>,
    store: Arc<CacheStore>,
    payload: Vec<u8>,
    _dir: TempDir,
}

/// A 10 MiB plain file split into 512 KiB articles, cached with 1 MiB
/// chunks: every chunk is exactly two articles, so per-article fetch
/// counts expose chunk-level fetch behavior.
fn fixture(file_len: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemoryPool::new());
    let payload = pattern_bytes(file_len);
    let store = CacheStore::new(CacheConfig {
        path: dir.path().to_path_buf(),
        chunk_size: MIB,
        read_ahead_chunks: 4,
        prefetch_concurrency: 3,
        ..CacheConfig::default()
    });
    store.start().unwrap();
    Fixture {
        pool,
        store,
        payload,
        _dir: dir,
    }
}

fn open_reader(fx: &Fixture, path: &str) -> Arc<FileReader> {
    let record = build_plain_record(&fx.pool, &fx.payload, SEGMENT, path);
    Arc::new(
        FileReader::open(
            &record,
            Arc::clone(&fx.pool) as Arc<dyn SegmentPool>,
            ReaderConfig::default(),
            CancellationToken::new(),
        )
        .unwrap(),
    )
}

async fn settle(fx: &Fixture, expect_at_most: u64) {
    // Give prefetch time to drain; then require the fetch count stable.
    let mut last = fx.pool.fetch_count();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let now = fx.pool.fetch_count();
        if now == last {
            break;
        }
        last = now;
    }
    assert!(
        fx.pool.fetch_count() <= expect_at_most,
        "backend fetched {} articles, expected at most {expect_at_most}",
        fx.pool.fetch_count()
    );
}

/// Scenario: sequential play from a cold cache. Twelve reads cover the
/// whole 10 MiB file; every article is fetched exactly once, with the
/// later chunks arriving via prefetch rather than sync reads.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_play_cold_cache() {
    let fx = fixture(10 * MIB as usize);
    let reader = open_reader(&fx, "seq");
    let handle = fx
        .store
        .open("seq", 10 * MIB, reader, &CancellationToken::new())
        .unwrap();

    let mut total = 0usize;
    let mut buf = vec![0u8; MIB as usize];
    for i in 0..10u64 {
        let n = handle.read_at(&mut buf, i * MIB).await.unwrap();
        assert_eq!(n, MIB as usize);
        assert_eq!(&buf[..], &fx.payload[(i * MIB) as usize..((i + 1) * MIB) as usize]);
        total += n;
    }
    let mut tail = vec![0u8; 512 * 1024];
    for off in [9 * MIB, 9 * MIB + 512 * 1024] {
        let n = handle.read_at(&mut tail, off).await.unwrap();
        assert_eq!(n, 512 * 1024);
        assert_eq!(
            &tail[..],
            &fx.payload[off as usize..off as usize + 512 * 1024]
        );
        total += n;
    }
    // 10 x 1 MiB plus two 512 KiB tail re-reads.
    assert_eq!(total, 11 * MIB as usize);

    // 10 MiB = 20 articles; the dedup barrier caps every article at one
    // backend fetch no matter how sync reads and prefetch interleave.
    settle(&fx, 20).await;
    for i in 0..20 {
        assert!(
            fx.pool.fetches_for(&format!("seq-{i}")) <= 1,
            "article {i} fetched more than once"
        );
    }

    // Seek inside the cached region: zero backend fetches.
    let before = fx.pool.fetch_count();
    let mut small = vec![0u8; 64 * 1024];
    let n = handle.read_at(&mut small, 3 * MIB).await.unwrap();
    assert_eq!(n, 64 * 1024);
    assert_eq!(
        &small[..],
        &fx.payload[3 * MIB as usize..3 * MIB as usize + 64 * 1024]
    );
    assert_eq!(fx.pool.fetch_count(), before);

    drop(handle);
    fx.store.stop().await;
}

/// Scenario: eight concurrent 4 KiB reads of the same cold chunk issue
/// exactly one chunk fetch between them.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn random_access_dedups_concurrent_reads() {
    let fx = fixture(10 * MIB as usize);
    let reader = open_reader(&fx, "rnd");
    let handle = Arc::new(
        fx.store
            .open("rnd", 10 * MIB, reader, &CancellationToken::new())
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let handle = Arc::clone(&handle);
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = handle.read_at(&mut buf, 5 * MIB).await.unwrap();
            (n, buf)
        }));
    }
    for task in tasks {
        let (n, buf) = task.await.unwrap();
        assert_eq!(n, 4096);
        assert_eq!(
            &buf[..],
            &fx.payload[5 * MIB as usize..5 * MIB as usize + 4096]
        );
    }

    // Chunk 5 is articles 10 and 11; nothing else was touched, and the
    // single reads at the same offset collapsed to one fetch each.
    assert_eq!(fx.pool.fetches_for("rnd-10"), 1);
    assert_eq!(fx.pool.fetches_for("rnd-11"), 1);
    assert_eq!(fx.pool.fetch_count(), 2);

    drop(handle);
    fx.store.stop().await;
}

/// Scenario: release while a prefetch window is in flight. Fetches stop
/// within a bounded grace period and the cached bytes stay on disk,
/// eligible for later eviction.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn release_cancels_inflight_prefetch() {
    let dir = TempDir::new().unwrap();
    let payload = pattern_bytes(32 * MIB as usize);
    let pool = Arc::new(MemoryPool::with_latency(Duration::from_millis(40)));
    let record = build_plain_record(&pool, &payload, SEGMENT, "rel");
    let store = CacheStore::new(CacheConfig {
        path: dir.path().to_path_buf(),
        chunk_size: MIB,
        read_ahead_chunks: 8,
        prefetch_concurrency: 3,
        ..CacheConfig::default()
    });
    store.start().unwrap();

    let reader = Arc::new(
        FileReader::open(
            &record,
            Arc::clone(&pool) as Arc<dyn SegmentPool>,
            ReaderConfig::default(),
            CancellationToken::new(),
        )
        .unwrap(),
    );
    let handle = store
        .open("rel", 32 * MIB, Arc::clone(&reader) as Arc<dyn RangeFetcher>, &CancellationToken::new())
        .unwrap();

    // Three sequential reads arm the prefetcher.
    let mut buf = vec![0u8; MIB as usize];
    for i in 0..3u64 {
        handle.read_at(&mut buf, i * MIB).await.unwrap();
    }
    // Window is running against the slow pool; release mid-flight.
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.close();

    // In-flight fetches abort within roughly one backend round trip.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_grace = pool.fetch_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        pool.fetch_count(),
        after_grace,
        "prefetch kept fetching after release"
    );

    // Cached bytes survive the release and remain eviction candidates.
    assert!(store.total_cached_bytes() >= 3 * MIB);
    assert_eq!(store.item_count(), 1);

    store.stop().await;
}

/// Concurrent reads of disjoint ranges return the same bytes as
/// sequential reads would.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_disjoint_reads_match_sequential() {
    let fx = fixture(8 * MIB as usize);
    let reader = open_reader(&fx, "par");
    let handle = Arc::new(
        fx.store
            .open("par", 8 * MIB, reader, &CancellationToken::new())
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let handle = Arc::clone(&handle);
        tasks.push(tokio::spawn(async move {
            let off = i * 512 * 1024;
            let mut buf = vec![0u8; 512 * 1024];
            let n = handle.read_at(&mut buf, off).await.unwrap();
            (off, n, buf)
        }));
    }
    for task in tasks {
        let (off, n, buf) = task.await.unwrap();
        assert_eq!(n, 512 * 1024);
        assert_eq!(&buf[..], &fx.payload[off as usize..off as usize + n]);
    }

    drop(handle);
    fx.store.stop().await;
}
