//! spoolfs daemon: mount segmented remote archives read-only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::BackgroundSession;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spoolfs_core::{MetadataStore, ReaderConfig, SegmentPool};
use spoolfs_mount::{CacheConfig, CacheStore, SessionConfig, SessionTracker};

use spoolfs_fuse::{DirArticlePool, DirMetadataStore, MountConfig, MountMonitor, SpoolFs};

/// Mount segmented remote archive content as a read-only filesystem.
#[derive(Debug, Parser)]
#[command(name = "spoolfs", version, about)]
struct Cli {
    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    /// Directory of FileRecord JSON documents produced by ingestion.
    #[arg(long, env = "SPOOLFS_METADATA")]
    metadata_root: PathBuf,

    /// Directory of article bodies backing the segment pool.
    #[arg(long, env = "SPOOLFS_ARTICLES")]
    articles_root: PathBuf,

    /// JSON configuration file (cache, reader, mount, sessions).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the cache directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Allow access by users other than the mounting one.
    #[arg(long)]
    allow_other: bool,

    /// Enable FUSE debug logging.
    #[arg(long)]
    debug: bool,
}

/// On-disk configuration document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppConfig {
    cache: CacheConfig,
    reader: ReaderConfig,
    mount: MountConfig,
    sessions: SessionConfig,
}

/// Everything needed to (re-)establish the mount.
#[derive(Clone)]
struct Mounter {
    handle: Handle,
    metadata: Arc<dyn MetadataStore>,
    pool: Arc<dyn SegmentPool>,
    cache: Option<Arc<CacheStore>>,
    sessions: Arc<SessionTracker>,
    reader_cfg: ReaderConfig,
    mount_cfg: MountConfig,
    root_token: CancellationToken,
    mountpoint: PathBuf,
}

impl Mounter {
    fn mount(&self) -> Result<BackgroundSession> {
        let fs = SpoolFs::new(
            self.handle.clone(),
            Arc::clone(&self.metadata),
            self.pool.clone(),
            self.cache.clone(),
            Arc::clone(&self.sessions),
            self.reader_cfg.clone(),
            self.mount_cfg.clone(),
            self.root_token.clone(),
        );
        let options = SpoolFs::mount_options(&self.mount_cfg);
        fuser::spawn_mount2(fs, &self.mountpoint, &options)
            .with_context(|| format!("failed to mount at {}", self.mountpoint.display()))
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("cannot read config {}", path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("cannot parse config {}", path.display()))?
        }
        None => AppConfig::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        cfg.cache.path.clone_from(dir);
    }
    if cli.allow_other {
        cfg.mount.allow_other = true;
    }
    if cli.debug {
        cfg.mount.debug = true;
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    // Background tasks (cache loops, sampler, monitor) spawn from here.
    let _enter = runtime.enter();

    let root_token = CancellationToken::new();
    let metadata: Arc<dyn MetadataStore> = Arc::new(DirMetadataStore::new(&cli.metadata_root));
    let pool: Arc<dyn SegmentPool> = Arc::new(DirArticlePool::new(&cli.articles_root));

    let cache = if cfg.cache.enabled {
        let store = CacheStore::new(cfg.cache.clone());
        store.start().context("failed to start cache store")?;
        Some(store)
    } else {
        warn!("range cache disabled; reads go straight to the backend");
        None
    };

    let sessions = SessionTracker::new(cfg.sessions.clone());
    sessions.start();

    let mounter = Mounter {
        handle: runtime.handle().clone(),
        metadata,
        pool,
        cache: cache.clone(),
        sessions: Arc::clone(&sessions),
        reader_cfg: cfg.reader.clone(),
        mount_cfg: cfg.mount.clone(),
        root_token: root_token.clone(),
        mountpoint: cli.mountpoint.clone(),
    };

    let session = Arc::new(Mutex::new(Some(mounter.mount()?)));
    info!(mountpoint = %cli.mountpoint.display(), "mounted");

    let monitor = {
        let mounter = mounter.clone();
        let session = Arc::clone(&session);
        MountMonitor::new(
            &cli.mountpoint,
            Box::new(move || {
                // Dropping the old session detaches stale kernel state
                // before mounting fresh.
                session.lock().take();
                let new_session = mounter.mount()?;
                *session.lock() = Some(new_session);
                Ok(())
            }),
        )
    };
    let monitor_task = monitor.spawn(root_token.child_token());

    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to install signal handler")?;
    let _ = shutdown_rx.recv();

    info!("shutting down");
    root_token.cancel();
    monitor_task.abort();
    // Unmount before stopping the stores so in-flight kernel reads
    // drain through live components.
    session.lock().take();

    runtime.block_on(async {
        if let Some(cache) = &cache {
            cache.stop().await;
        }
        sessions.stop().await;
    });
    info!("bye");
    Ok(())
}
