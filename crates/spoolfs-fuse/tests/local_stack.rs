//! The full local stack without a kernel mount: record documents on
//! disk, article bodies on disk, segmented reader, range cache.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use spoolfs_core::testing::{encrypt_cbc, pattern_bytes};
use spoolfs_core::{
    Encryption, FileRecord, FileReader, MetadataStore, ReaderConfig, Segment, SegmentPool,
};
use spoolfs_mount::{path_codec, CacheConfig, CacheStore};

use spoolfs_fuse::metadata_dir::write_record;
use spoolfs_fuse::{DirArticlePool, DirMetadataStore};

const KEY: [u8; 32] = [0x5A; 32];
const IV: [u8; 16] = [0xA5; 16];

struct Stack {
    metadata: DirMetadataStore,
    pool: Arc<DirArticlePool>,
    store: Arc<CacheStore>,
    _meta_dir: TempDir,
    _articles_dir: TempDir,
    _cache_dir: TempDir,
}

fn write_articles(dir: &TempDir, wire: &[u8], seg_size: usize, prefix: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for (i, chunk) in wire.chunks(seg_size).enumerate() {
        let article_id = format!("<{prefix}-{i}@local>");
        let start = (i * seg_size) as u64;
        std::fs::write(
            dir.path().join(path_codec::encode(&article_id)),
            chunk,
        )
        .unwrap();
        segments.push(Segment {
            article_id,
            groups: vec!["alt.binaries.local".to_string()],
            size: chunk.len() as u64,
            start_offset: start,
            end_offset: start + chunk.len() as u64 - 1,
            patched: false,
        });
    }
    segments
}

fn stack() -> Stack {
    let meta_dir = TempDir::new().unwrap();
    let articles_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let store = CacheStore::new(CacheConfig {
        path: cache_dir.path().to_path_buf(),
        chunk_size: 64 * 1024,
        ..CacheConfig::default()
    });
    store.start().unwrap();

    Stack {
        metadata: DirMetadataStore::new(meta_dir.path()),
        pool: Arc::new(DirArticlePool::new(articles_dir.path())),
        store,
        _meta_dir: meta_dir,
        _articles_dir: articles_dir,
        _cache_dir: cache_dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn encrypted_record_reads_through_cache() {
    let stack = stack();
    let payload = pattern_bytes(300_000);
    let wire = encrypt_cbc(&KEY, &IV, &payload);
    let segments = write_articles(&stack._articles_dir, &wire, 100_000, "enc");

    let record = FileRecord {
        size: payload.len() as u64,
        encryption: Encryption::AesCbc {
            key: KEY.to_vec(),
            iv: IV.to_vec(),
        },
        segments,
        nested_sources: Vec::new(),
        source_id: "local".to_string(),
        mtime: SystemTime::UNIX_EPOCH,
    };
    write_record(stack._meta_dir.path(), "shows/pilot.mkv", &record).unwrap();

    // stat through the metadata contract, then open the read path the
    // way the adapter does.
    let fetched = stack
        .metadata
        .stat("shows/pilot.mkv")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.size, payload.len() as u64);

    let reader = Arc::new(
        FileReader::open(
            &fetched,
            Arc::clone(&stack.pool) as Arc<dyn SegmentPool>,
            ReaderConfig::default(),
            CancellationToken::new(),
        )
        .unwrap(),
    );
    let handle = stack
        .store
        .open(
            "shows/pilot.mkv",
            fetched.size,
            reader,
            &CancellationToken::new(),
        )
        .unwrap();

    // Unaligned read in the middle.
    let mut buf = vec![0u8; 10_000];
    let n = handle.read_at(&mut buf, 123_457).await.unwrap();
    assert_eq!(n, 10_000);
    assert_eq!(&buf[..], &payload[123_457..133_457]);

    // Tail read clamps at EOF.
    let mut tail = vec![0u8; 4096];
    let n = handle.read_at(&mut tail, 299_000).await.unwrap();
    assert_eq!(n, 1000);
    assert_eq!(&tail[..n], &payload[299_000..]);

    // Repeat read is a cache hit: no new backend bytes.
    let downloaded = stack.pool.metrics().bytes_downloaded.load(Ordering::Relaxed);
    handle.read_at(&mut buf, 123_457).await.unwrap();
    assert_eq!(
        stack.pool.metrics().bytes_downloaded.load(Ordering::Relaxed),
        downloaded
    );

    drop(handle);
    stack.store.stop().await;
}

#[tokio::test]
async fn missing_article_surfaces_as_read_failure() {
    let stack = stack();
    let payload = pattern_bytes(50_000);
    let mut segments = write_articles(&stack._articles_dir, &payload, 20_000, "gap");
    // Remove the middle article body from disk.
    std::fs::remove_file(
        stack
            ._articles_dir
            .path()
            .join(path_codec::encode(&segments[1].article_id)),
    )
    .unwrap();
    segments.truncate(3);

    let record = FileRecord {
        size: payload.len() as u64,
        encryption: Encryption::None,
        segments,
        nested_sources: Vec::new(),
        source_id: "local".to_string(),
        mtime: SystemTime::UNIX_EPOCH,
    };
    write_record(stack._meta_dir.path(), "broken.bin", &record).unwrap();

    let fetched = stack.metadata.stat("broken.bin").await.unwrap().unwrap();
    let reader = Arc::new(
        FileReader::open(
            &fetched,
            Arc::clone(&stack.pool) as Arc<dyn SegmentPool>,
            ReaderConfig::default(),
            CancellationToken::new(),
        )
        .unwrap(),
    );
    let handle = stack
        .store
        .open("broken.bin", fetched.size, reader, &CancellationToken::new())
        .unwrap();

    // Chunk alignment (64 KiB) spans the hole for any offset in this
    // small file, so every read fails hard.
    let mut buf = vec![0u8; 50_000];
    assert!(handle.read_at(&mut buf, 0).await.is_err());
    assert!(handle.read_at(&mut buf[..10_000], 0).await.is_err());

    drop(handle);
    stack.store.stop().await;
}
