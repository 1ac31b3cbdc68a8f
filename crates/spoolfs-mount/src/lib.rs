//! Disk-backed range cache, prefetcher and session tracking shared by
//! spoolfs mount frontends.
//!
//! # Components
//!
//! - [`CacheStore`] / [`CacheHandle`] - per-path sparse data files with
//!   byte-interval accounting; `read_at` serves from disk on coverage
//!   and otherwise fetches aligned chunks through a single-flight dedup
//!   barrier shared with the prefetcher.
//! - [`IntervalSet`] - sorted, coalesced `[start, end)` coverage with
//!   presence and gap queries.
//! - [`FetchGroup`] - collapses concurrent fetches of the same range
//!   into one backend request.
//! - `prefetch` - sequential-pattern detection and bounded-concurrency
//!   read-ahead windows with a per-file circuit breaker.
//! - [`SessionTracker`] - aggregates parallel opens of one playback into
//!   a logical session and reports windowed throughput.
//! - [`path_codec`] - reversible, collision-free path-to-filename
//!   encoding for the cache directory.
//!
//! The store and the tracker are process-lifetime singletons with
//! explicit `start()`/`stop()`; every background task they spawn is
//! bound to a cancellation token and joined on stop.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;
mod fetcher;
mod handle;
mod intervals;
mod item;
mod prefetch;
mod sessions;
mod single_flight;
mod stats;
mod store;

pub mod path_codec;

/// Test doubles (counting fetchers) shared with downstream test suites.
pub mod testing;

pub use config::{
    CacheConfig, SessionConfig, DEFAULT_CHUNK_SIZE, DEFAULT_PREFETCH_CONCURRENCY,
    DEFAULT_READ_AHEAD_CHUNKS, MAX_FETCH_BYTES, SUB_FETCH_BYTES,
};
pub use error::CacheError;
pub use fetcher::RangeFetcher;
pub use handle::CacheHandle;
pub use intervals::{Interval, IntervalSet};
pub use item::Sidecar;
pub use sessions::{
    SessionIdentity, SessionSnapshot, SessionStatus, SessionTracker, StreamSession,
};
pub use single_flight::{FetchGroup, FetchKey, FlightStats};
pub use stats::{format_bytes, TransferStats, TransferStatsSnapshot};
pub use store::CacheStore;
