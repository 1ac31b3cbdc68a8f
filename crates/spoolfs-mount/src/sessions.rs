//! Playback session aggregation and throughput reporting.
//!
//! Players open several parallel TCP connections for one playback; the
//! tracker collapses opens that share `(file_path, user, source,
//! client_ip)` into one logical session so reported throughput reflects
//! one viewer. A 2 s sampler computes windowed speeds and status; stale
//! and idle sessions are reaped periodically, and the last few completed
//! sessions are kept for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::config::SessionConfig;

/// Sampling cadence.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Samples older than this are discarded.
const SAMPLE_RETENTION: Duration = Duration::from_secs(60);

/// Window over which speeds are computed.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// No reads for this long flips a session to stalled.
const STALL_AFTER: Duration = Duration::from_secs(10);

/// Reaper cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Who is reading. `user_agent` is display metadata only; it is not part
/// of the grouping key because players rotate it per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Authenticated user, or a platform stand-in (e.g. uid).
    pub user: String,
    /// Frontend that produced the open (e.g. "fuse", "webdav").
    pub source: String,
    /// Remote address, empty for local mounts.
    pub client_ip: String,
    /// Player user agent, informational.
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    path: String,
    user: String,
    source: String,
    client_ip: String,
}

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Opened, nothing served yet.
    Starting,
    /// No bytes ever sent to the consumer.
    Buffering,
    /// Actively serving.
    Streaming,
    /// No reads for over ten seconds.
    Stalled,
    /// All handles released.
    Completed,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    sent: u64,
    downloaded: u64,
}

/// One aggregated playback.
pub struct StreamSession {
    id: Uuid,
    path: String,
    identity: SessionIdentity,
    total_size: u64,
    started_at: SystemTime,
    started_mono: Instant,
    refs: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_downloaded: AtomicU64,
    current_offset: AtomicU64,
    buffered_offset: AtomicU64,
    /// Millis since `started_mono` of the last read; u64::MAX = never.
    last_read_ms: AtomicU64,
    /// Millis since `started_mono` when `bytes_sent` last advanced.
    last_progress_ms: AtomicU64,
    samples: Mutex<VecDeque<Sample>>,
    status: Mutex<SessionStatus>,
    speed_out: AtomicU64,
    speed_in: AtomicU64,
    token: CancellationToken,
}

impl StreamSession {
    fn new(path: &str, identity: SessionIdentity, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.to_string(),
            identity,
            total_size,
            started_at: SystemTime::now(),
            started_mono: Instant::now(),
            refs: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            current_offset: AtomicU64::new(0),
            buffered_offset: AtomicU64::new(0),
            last_read_ms: AtomicU64::new(u64::MAX),
            last_progress_ms: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
            status: Mutex::new(SessionStatus::Starting),
            speed_out: AtomicU64::new(0),
            speed_in: AtomicU64::new(0),
            token: CancellationToken::new(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_mono.elapsed().as_millis() as u64
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token cancelled when the session is destroyed; readers bound to
    /// the session inherit it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Record bytes handed to the consumer at `offset`.
    pub fn record_read(&self, offset: u64, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.current_offset.store(offset + bytes, Ordering::Relaxed);
        let now = self.elapsed_ms();
        self.last_read_ms.store(now, Ordering::Relaxed);
        if bytes > 0 {
            self.last_progress_ms.store(now, Ordering::Relaxed);
        }
    }

    /// Record bytes fetched from the backend on this session's behalf.
    pub fn record_download(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record how far ahead of the consumer the cache has materialized.
    pub fn record_buffered(&self, offset: u64) {
        self.buffered_offset.fetch_max(offset, Ordering::Relaxed);
    }

    fn speed_over_window(samples: &VecDeque<Sample>, now: Instant, field: fn(&Sample) -> u64, latest: u64) -> u64 {
        // Reference: most recent sample older than the window, falling
        // back to the oldest available.
        let reference = samples
            .iter()
            .rev()
            .find(|s| now.duration_since(s.at) >= SPEED_WINDOW)
            .or_else(|| samples.front());
        let Some(reference) = reference else { return 0 };
        let elapsed = now.duration_since(reference.at).as_secs_f64();
        if elapsed < f64::EPSILON {
            return 0;
        }
        let delta = latest.saturating_sub(field(reference));
        (delta as f64 / elapsed) as u64
    }

    /// Push a sample and refresh speeds/status. Called by the tracker.
    fn sample(&self) {
        let now = Instant::now();
        let sent = self.bytes_sent.load(Ordering::Relaxed);
        let downloaded = self.bytes_downloaded.load(Ordering::Relaxed);

        let (out, incoming) = {
            let mut samples = self.samples.lock();
            samples.push_back(Sample {
                at: now,
                sent,
                downloaded,
            });
            while samples
                .front()
                .is_some_and(|s| now.duration_since(s.at) > SAMPLE_RETENTION)
            {
                samples.pop_front();
            }
            (
                Self::speed_over_window(&samples, now, |s| s.sent, sent),
                Self::speed_over_window(&samples, now, |s| s.downloaded, downloaded),
            )
        };
        self.speed_out.store(out, Ordering::Relaxed);
        self.speed_in.store(incoming, Ordering::Relaxed);

        let status = if sent == 0 {
            SessionStatus::Buffering
        } else {
            let last_read = self.last_read_ms.load(Ordering::Relaxed);
            let idle = self.elapsed_ms().saturating_sub(last_read);
            if last_read != u64::MAX && idle > STALL_AFTER.as_millis() as u64 {
                SessionStatus::Stalled
            } else {
                SessionStatus::Streaming
            }
        };
        *self.status.lock() = status;
    }

    /// Seconds until playback has fully been served at the current
    /// outgoing speed; -1 when unknown.
    pub fn eta_seconds(&self) -> i64 {
        let speed = self.speed_out.load(Ordering::Relaxed);
        if speed == 0 {
            return -1;
        }
        let remaining = self
            .total_size
            .saturating_sub(self.current_offset.load(Ordering::Relaxed));
        (remaining / speed) as i64
    }

    /// Point-in-time view for UIs.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            path: self.path.clone(),
            identity: self.identity.clone(),
            status: *self.status.lock(),
            total_size: self.total_size,
            started_at: self.started_at,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            current_offset: self.current_offset.load(Ordering::Relaxed),
            buffered_offset: self.buffered_offset.load(Ordering::Relaxed),
            speed_out: self.speed_out.load(Ordering::Relaxed),
            speed_in: self.speed_in.load(Ordering::Relaxed),
            eta_seconds: self.eta_seconds(),
        }
    }
}

/// Plain-data session view.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: Uuid,
    /// File being played.
    pub path: String,
    /// Who is playing it.
    pub identity: SessionIdentity,
    /// Current status.
    pub status: SessionStatus,
    /// Logical file size.
    pub total_size: u64,
    /// Wall-clock session start.
    pub started_at: SystemTime,
    /// Bytes handed to the consumer.
    pub bytes_sent: u64,
    /// Bytes fetched from the backend.
    pub bytes_downloaded: u64,
    /// Consumer position.
    pub current_offset: u64,
    /// Cache high-water mark.
    pub buffered_offset: u64,
    /// Outgoing bytes/second over the speed window.
    pub speed_out: u64,
    /// Incoming bytes/second over the speed window.
    pub speed_in: u64,
    /// Estimated seconds to completion, -1 unknown.
    pub eta_seconds: i64,
}

/// Process-lifetime session registry.
pub struct SessionTracker {
    cfg: SessionConfig,
    sessions: DashMap<SessionKey, Arc<StreamSession>>,
    history: Mutex<VecDeque<SessionSnapshot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
}

impl SessionTracker {
    /// New tracker; call [`start`](Self::start) to run sampling.
    pub fn new(cfg: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            sessions: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        })
    }

    /// Spawn the sampler and the reaper.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        {
            let tracker = Arc::clone(self);
            let token = self.token.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(SAMPLE_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = tick.tick() => tracker.sample_pass(),
                    }
                }
            }));
        }
        {
            let tracker = Arc::clone(self);
            let token = self.token.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(REAP_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = tick.tick() => tracker.reap_pass(),
                    }
                }
            }));
        }
    }

    /// Stop background work and join it.
    pub async fn stop(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Attach an open to its logical session, creating one if needed.
    ///
    /// Parallel opens of the same file by the same client share the
    /// returned session; each must be paired with one
    /// [`close`](Self::close).
    pub fn open(
        &self,
        path: &str,
        identity: SessionIdentity,
        total_size: u64,
    ) -> Arc<StreamSession> {
        let key = SessionKey {
            path: path.to_string(),
            user: identity.user.clone(),
            source: identity.source.clone(),
            client_ip: identity.client_ip.clone(),
        };
        let session = self
            .sessions
            .entry(key)
            .or_insert_with(|| {
                info!(path, user = %identity.user, "session started");
                Arc::new(StreamSession::new(path, identity, total_size))
            })
            .clone();
        session.refs.fetch_add(1, Ordering::AcqRel);
        session
    }

    /// Detach one open. The last close completes the session, moves it
    /// to history and cancels any reader bound to it.
    pub fn close(&self, session: &Arc<StreamSession>) {
        let prev = session.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "session close without open");
        if prev != 1 {
            return;
        }
        *session.status.lock() = SessionStatus::Completed;
        self.remove(session, "completed");
    }

    fn remove(&self, session: &Arc<StreamSession>, why: &str) {
        let key = SessionKey {
            path: session.path.clone(),
            user: session.identity.user.clone(),
            source: session.identity.source.clone(),
            client_ip: session.identity.client_ip.clone(),
        };
        if self.sessions.remove(&key).is_some() {
            session.token.cancel();
            debug!(path = %session.path, why, "session removed");
            let mut history = self.history.lock();
            history.push_front(session.snapshot());
            while history.len() > self.cfg.history_limit {
                history.pop_back();
            }
        }
    }

    /// Live session snapshots, unordered.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Completed sessions, newest first.
    pub fn history(&self) -> Vec<SessionSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    fn sample_pass(&self) {
        for entry in self.sessions.iter() {
            entry.value().sample();
        }
        trace!(sessions = self.sessions.len(), "session sample pass");
    }

    fn reap_pass(&self) {
        let doomed: Vec<Arc<StreamSession>> = self
            .sessions
            .iter()
            .filter(|entry| {
                let s = entry.value();
                let age = s.started_mono.elapsed();
                if age > self.cfg.stale_timeout {
                    return true;
                }
                let progress_idle = s
                    .elapsed_ms()
                    .saturating_sub(s.last_progress_ms.load(Ordering::Relaxed));
                progress_idle > self.cfg.idle_timeout.as_millis() as u64
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in doomed {
            *session.status.lock() = SessionStatus::Completed;
            self.remove(&session, "reaped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user: &str, ip: &str, agent: &str) -> SessionIdentity {
        SessionIdentity {
            user: user.to_string(),
            source: "fuse".to_string(),
            client_ip: ip.to_string(),
            user_agent: agent.to_string(),
        }
    }

    fn tracker() -> Arc<SessionTracker> {
        SessionTracker::new(SessionConfig::default())
    }

    #[tokio::test]
    async fn test_parallel_opens_share_one_session() {
        let tracker = tracker();
        // Same player, rotating user agent across connections.
        let a = tracker.open("f.mkv", identity("alice", "10.0.0.2", "vlc/1"), 100);
        let b = tracker.open("f.mkv", identity("alice", "10.0.0.2", "vlc/2"), 100);
        assert_eq!(a.id(), b.id());
        assert_eq!(tracker.active_count(), 1);

        tracker.close(&a);
        assert_eq!(tracker.active_count(), 1);
        tracker.close(&b);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.history().len(), 1);
    }

    #[tokio::test]
    async fn test_two_devices_stay_distinct() {
        let tracker = tracker();
        let a = tracker.open("f.mkv", identity("alice", "10.0.0.2", "vlc"), 100);
        let b = tracker.open("f.mkv", identity("alice", "10.0.0.9", "vlc"), 100);
        assert_ne!(a.id(), b.id());
        assert_eq!(tracker.active_count(), 2);
        tracker.close(&a);
        tracker.close(&b);
    }

    #[tokio::test]
    async fn test_close_cancels_session_token() {
        let tracker = tracker();
        let s = tracker.open("f.mkv", identity("u", "", ""), 100);
        let token = s.cancellation().clone();
        assert!(!token.is_cancelled());
        tracker.close(&s);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_double_close_second_open_unaffected() {
        let tracker = tracker();
        let a = tracker.open("f.mkv", identity("u", "", ""), 100);
        tracker.close(&a);
        // A new open after completion starts a fresh session.
        let b = tracker.open("f.mkv", identity("u", "", ""), 100);
        assert_ne!(a.id(), b.id());
        tracker.close(&b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_transitions() {
        let tracker = tracker();
        let s = tracker.open("f.mkv", identity("u", "", ""), 1 << 20);

        s.sample();
        assert_eq!(s.snapshot().status, SessionStatus::Buffering);

        s.record_read(0, 4096);
        s.sample();
        assert_eq!(s.snapshot().status, SessionStatus::Streaming);

        tokio::time::advance(Duration::from_secs(11)).await;
        s.sample();
        assert_eq!(s.snapshot().status, SessionStatus::Stalled);

        tracker.close(&s);
        let history = tracker.history();
        assert_eq!(history[0].status, SessionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_speed() {
        let tracker = tracker();
        let s = tracker.open("f.mkv", identity("u", "", ""), 100 << 20);

        // 1 MiB/s for 12 seconds of samples.
        for i in 0..6u64 {
            s.record_read(i * 2 * 1024 * 1024, 2 * 1024 * 1024);
            s.sample();
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        let snap = s.snapshot();
        let mib = 1024 * 1024;
        assert!(
            snap.speed_out >= mib / 2 && snap.speed_out <= 2 * mib,
            "speed {} outside plausible band",
            snap.speed_out
        );
        assert!(snap.eta_seconds > 0);
        tracker.close(&s);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let tracker = SessionTracker::new(SessionConfig {
            history_limit: 3,
            ..SessionConfig::default()
        });
        for i in 0..5 {
            let s = tracker.open(&format!("f{i}"), identity("u", "", ""), 10);
            tracker.close(&s);
        }
        let history = tracker.history();
        assert_eq!(history.len(), 3);
        // Newest first.
        assert_eq!(history[0].path, "f4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_stale_sessions() {
        let tracker = SessionTracker::new(SessionConfig {
            stale_timeout: Duration::from_secs(60),
            ..SessionConfig::default()
        });
        let s = tracker.open("f", identity("u", "", ""), 10);
        let token = s.cancellation().clone();

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.reap_pass();
        assert_eq!(tracker.active_count(), 0);
        assert!(token.is_cancelled());
    }
}
