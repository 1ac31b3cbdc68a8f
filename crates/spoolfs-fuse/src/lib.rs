//! Read-only FUSE frontend for segmented remote archives.
//!
//! Maps kernel operations onto the metadata contract and the range
//! cache: `lookup`/`getattr`/`readdir` consult the metadata store,
//! `open` builds a segmented reader plus a cache view and registers a
//! playback session, `read` dispatches positional reads without
//! blocking the FUSE callback thread, and `release` tears everything
//! down idempotently. A background monitor watches mount liveness and
//! re-mounts through an unmount escalation when the mount goes stale.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod article_dir;
pub mod bridge;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod health;
pub mod inode;
pub mod metadata_dir;

pub use article_dir::DirArticlePool;
pub use config::MountConfig;
pub use error::MountError;
pub use filesystem::SpoolFs;
pub use health::{MountMonitor, MountState};
pub use metadata_dir::DirMetadataStore;
