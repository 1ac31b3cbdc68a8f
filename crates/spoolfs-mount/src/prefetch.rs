//! Sequential-read detection and windowed prefetch.
//!
//! The cache notifies the prefetcher of every served access offset. Two
//! consecutive forward steps within twice the chunk size arm a per-file
//! sequential flag; while armed, a background window fetches chunks
//! ahead of the consumer with bounded parallelism, through the same
//! dedup barrier as synchronous reads. A backward or random seek cancels
//! the window immediately, since its connections are needed for the new
//! region. Repeated fetch failures open a per-file circuit breaker.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::fetcher::RangeFetcher;
use crate::item::CacheItem;
use crate::single_flight::FetchGroup;
use crate::stats::TransferStats;
use crate::store::fetch_range_into;

/// Forward steps needed before the sequential flag arms.
const SEQUENTIAL_THRESHOLD: u32 = 2;

/// Consecutive fetch errors that open the circuit.
const CIRCUIT_ERROR_THRESHOLD: u32 = 10;

/// How long an opened circuit stays open.
const CIRCUIT_OPEN_FOR: Duration = Duration::from_secs(20 * 60);

/// Cadence of the idle sweep.
const IDLE_TICK: Duration = Duration::from_secs(10);

/// No accesses for this long clears the sequential assumption.
const IDLE_RESET_AFTER: Duration = Duration::from_secs(30);

/// Per-file state entries idle this long are dropped entirely.
const STATE_GC_AFTER: Duration = Duration::from_secs(3600);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Everything a prefetch window needs from the access that armed it.
pub(crate) struct AccessContext {
    pub item: Arc<CacheItem>,
    pub fetcher: Arc<dyn RangeFetcher>,
    pub flight: Arc<FetchGroup>,
    pub parent: CancellationToken,
}

#[derive(Default)]
struct FileState {
    /// Last served offset, -1 before the first access.
    last_offset: AtomicI64,
    sequential_hits: AtomicU32,
    is_sequential: AtomicBool,
    /// The running window (id, token), if any. The id lets a finishing
    /// window clear only its own slot.
    window: Mutex<Option<(u64, CancellationToken)>>,
    next_window_id: AtomicU64,
    consecutive_errors: AtomicU32,
    /// Epoch millis until which the circuit stays open; 0 = closed.
    circuit_open_until: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl FileState {
    fn new() -> Self {
        let state = Self::default();
        state.last_offset.store(-1, Ordering::Relaxed);
        state.last_activity_ms.store(now_millis(), Ordering::Relaxed);
        state
    }

    fn circuit_open(&self) -> bool {
        now_millis() < self.circuit_open_until.load(Ordering::Relaxed)
    }

    fn cancel_window(&self) {
        if let Some((_, token)) = self.window.lock().take() {
            token.cancel();
        }
    }

    fn clear_window(&self, id: u64) {
        let mut window = self.window.lock();
        if matches!(&*window, Some((wid, _)) if *wid == id) {
            *window = None;
        }
    }
}

/// Per-store prefetch coordinator.
pub(crate) struct Prefetcher {
    cfg: CacheConfig,
    files: DashMap<Arc<str>, Arc<FileState>>,
    stats: Arc<TransferStats>,
}

impl Prefetcher {
    pub(crate) fn new(cfg: CacheConfig, stats: Arc<TransferStats>) -> Self {
        Self {
            cfg,
            files: DashMap::new(),
            stats,
        }
    }

    /// Record a served access and, when a sequential pattern holds,
    /// ensure a prefetch window is running ahead of it.
    pub(crate) fn record_access(&self, ctx: AccessContext, off: u64) {
        if self.cfg.read_ahead_chunks == 0 {
            return;
        }
        let state = self
            .files
            .entry(Arc::clone(ctx.item.path()))
            .or_insert_with(|| Arc::new(FileState::new()))
            .clone();
        state.last_activity_ms.store(now_millis(), Ordering::Relaxed);

        let last = state.last_offset.swap(off as i64, Ordering::AcqRel);
        if last >= 0 {
            let delta = off as i64 - last;
            let step_limit = (2 * self.cfg.chunk_size) as i64;
            if delta > 0 && delta <= step_limit {
                let hits = state.sequential_hits.fetch_add(1, Ordering::AcqRel) + 1;
                if hits >= SEQUENTIAL_THRESHOLD {
                    state.is_sequential.store(true, Ordering::Release);
                }
            } else {
                // Seek: prefetched chunks ahead of the old position are
                // waste and the connections are needed here.
                trace!(path = %ctx.item.path(), delta, "seek resets sequential state");
                state.sequential_hits.store(0, Ordering::Release);
                state.is_sequential.store(false, Ordering::Release);
                state.cancel_window();
                return;
            }
        }

        if !state.is_sequential.load(Ordering::Acquire) {
            return;
        }
        if state.circuit_open() {
            trace!(path = %ctx.item.path(), "prefetch circuit open, skipping");
            return;
        }
        self.spawn_window_if_idle(&state, ctx, off);
    }

    fn spawn_window_if_idle(&self, state: &Arc<FileState>, ctx: AccessContext, off: u64) {
        let mut window = state.window.lock();
        if window.as_ref().is_some_and(|(_, t)| !t.is_cancelled()) {
            return;
        }
        let id = state.next_window_id.fetch_add(1, Ordering::Relaxed);
        let token = ctx.parent.child_token();
        *window = Some((id, token.clone()));
        drop(window);

        debug!(path = %ctx.item.path(), off, "starting prefetch window");
        let cfg = self.cfg.clone();
        let stats = Arc::clone(&self.stats);
        let state = Arc::clone(state);
        tokio::spawn(async move {
            run_windows(&cfg, &state, &ctx, &stats, &token, off).await;
            state.clear_window(id);
        });
    }

    /// Forget per-file state when the last handle closes.
    pub(crate) fn stop_file(&self, path: &Arc<str>) {
        if let Some((_, state)) = self.files.remove(path) {
            state.cancel_window();
        }
    }

    /// Spawn the 10 s sweep that clears stale sequential flags so a long
    /// pause does not resume with yesterday's assumption.
    pub(crate) fn spawn_idle_ticker(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(IDLE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = tick.tick() => this.idle_sweep(),
                }
            }
        })
    }

    fn idle_sweep(&self) {
        let now = now_millis();
        let mut drop_paths = Vec::new();
        for entry in self.files.iter() {
            let idle = now.saturating_sub(entry.last_activity_ms.load(Ordering::Relaxed));
            if idle > STATE_GC_AFTER.as_millis() as u64 {
                drop_paths.push(Arc::clone(entry.key()));
            } else if idle > IDLE_RESET_AFTER.as_millis() as u64 {
                entry.is_sequential.store(false, Ordering::Release);
                entry.sequential_hits.store(0, Ordering::Release);
            }
        }
        for path in drop_paths {
            self.stop_file(&path);
        }
    }
}

/// Run prefetch windows until the consumer catches up, an error opens
/// the circuit, or the token is cancelled.
async fn run_windows(
    cfg: &CacheConfig,
    state: &Arc<FileState>,
    ctx: &AccessContext,
    stats: &Arc<TransferStats>,
    token: &CancellationToken,
    off: u64,
) {
    let chunk = cfg.chunk_size;
    let size = ctx.item.size();
    let mut next_chunk = off / chunk + 1;

    'windows: while !token.is_cancelled() {
        let semaphore = Arc::new(Semaphore::new(cfg.prefetch_concurrency.max(1)));
        let mut fetches = JoinSet::new();
        let mut scheduled = 0u64;

        for c in next_chunk..next_chunk + cfg.read_ahead_chunks {
            let start = c * chunk;
            if start >= size {
                break;
            }
            let end = (start + chunk).min(size);
            if ctx.item.present(start, end) {
                continue;
            }
            scheduled += 1;
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break 'windows;
            };
            let item = Arc::clone(&ctx.item);
            let fetcher = Arc::clone(&ctx.fetcher);
            let flight = Arc::clone(&ctx.flight);
            let stats = Arc::clone(stats);
            let token = token.clone();
            fetches.spawn(async move {
                let result =
                    fetch_range_into(&flight, &item, &fetcher, &stats, start, end, &token).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(Ok(_)) => {
                    state.consecutive_errors.store(0, Ordering::Release);
                }
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    let errors = state.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(path = %ctx.item.path(), error = %e, errors, "prefetch fetch failed");
                    if errors >= CIRCUIT_ERROR_THRESHOLD {
                        state.circuit_open_until.store(
                            now_millis() + CIRCUIT_OPEN_FOR.as_millis() as u64,
                            Ordering::Release,
                        );
                        warn!(
                            path = %ctx.item.path(),
                            open_for = ?CIRCUIT_OPEN_FOR,
                            "prefetch circuit opened"
                        );
                        token.cancel();
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "prefetch task panicked");
                }
            }
        }

        // Window fully cached: the consumer caught up, stop here and let
        // the next access re-arm.
        if scheduled == 0 || token.is_cancelled() {
            break;
        }
        next_chunk += cfg.read_ahead_chunks;
    }
    trace!(path = %ctx.item.path(), "prefetch window finished");
}
