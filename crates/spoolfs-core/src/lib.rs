//! Core read path for segmented remote archives.
//!
//! This crate turns a byte-range request on a logical file into bytes,
//! given a [`FileRecord`] describing how the file is stored (ordered
//! network segments, optional AES-CBC encryption, optional nesting
//! inside other containers) and a [`SegmentPool`] that can stream single
//! segment bodies.
//!
//! # Components
//!
//! - [`metadata`] - the data model ([`FileRecord`], [`Segment`],
//!   [`NestedSource`]) and the read-only [`MetadataStore`] lookup
//!   contract.
//! - [`pool`] - the pluggable segment-fetch contract and its error
//!   classification.
//! - [`reader`] - [`FileReader`], the per-open persistent reader with
//!   random-access `read_at` and a sequential fallback.
//! - [`testing`] - in-memory pool and record builders shared by the
//!   workspace test suites.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metadata;
pub mod pool;
pub mod reader;
pub mod testing;

pub use config::ReaderConfig;
pub use error::ReadError;
pub use metadata::{
    encrypted_len, DirEntry, Encryption, FileRecord, MetadataError, MetadataStore, NestedSource,
    RecordError, Segment, AES_BLOCK_SIZE,
};
pub use pool::{PoolError, PoolMetrics, SegmentBody, SegmentPool};
pub use reader::{FileReader, SequentialReader};
