//! Error mapping for the kernel boundary.
//!
//! Structured errors from the read path and the cache are converted to
//! POSIX errno values exactly once, here. Cancellation is deliberately
//! distinct from `EIO`: a player closing its connection mid-read is not
//! a fault and must not be logged as one.

use std::io;

use thiserror::Error;

use spoolfs_core::{MetadataError, ReadError};
use spoolfs_mount::CacheError;

use crate::bridge::BridgeError;

/// FUSE-layer errors.
#[derive(Debug, Error)]
pub enum MountError {
    /// Metadata lookup failed (not "not found", which is handled inline).
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// The read path failed.
    #[error("read error: {0}")]
    Read(#[from] ReadError),

    /// The cache layer failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Sync/async bridge failure (timeout, runtime gone).
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Unknown file handle.
    #[error("invalid file handle {0}")]
    InvalidHandle(u64),

    /// I/O failure outside the layers above.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Convert a read error to errno.
pub fn read_error_to_errno(e: &ReadError) -> i32 {
    match e {
        ReadError::Cancelled => libc::EINTR,
        ReadError::MissingSegment { .. }
        | ReadError::MissingData(_)
        | ReadError::Backend(_)
        | ReadError::Timeout(_)
        | ReadError::Cipher(_)
        | ReadError::InvalidRecord(_)
        | ReadError::Io(_) => libc::EIO,
    }
}

impl MountError {
    /// The errno this error surfaces as.
    pub fn to_errno(&self) -> i32 {
        match self {
            MountError::Metadata(_) => libc::EIO,
            MountError::Read(e) => read_error_to_errno(e),
            MountError::Cache(CacheError::Stopped) => libc::EINTR,
            MountError::Cache(_) => libc::EIO,
            MountError::Bridge(e) => e.to_errno(),
            MountError::InvalidHandle(_) => libc::EBADF,
            MountError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_eintr_not_eio() {
        assert_eq!(read_error_to_errno(&ReadError::Cancelled), libc::EINTR);
        let e = MountError::Read(ReadError::Cancelled);
        assert_eq!(e.to_errno(), libc::EINTR);
    }

    #[test]
    fn test_data_faults_are_eio() {
        assert_eq!(
            read_error_to_errno(&ReadError::MissingData("short".to_string())),
            libc::EIO
        );
        assert_eq!(
            read_error_to_errno(&ReadError::MissingSegment {
                article_id: "<a@b>".to_string()
            }),
            libc::EIO
        );
        assert_eq!(
            read_error_to_errno(&ReadError::Backend("pool exhausted".to_string())),
            libc::EIO
        );
    }

    #[test]
    fn test_handle_and_io_mapping() {
        assert_eq!(MountError::InvalidHandle(9).to_errno(), libc::EBADF);
        let e = MountError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.to_errno(), libc::ENOSPC);
        let e = MountError::Io(io::Error::other("no raw errno"));
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_stopped_cache_is_eintr() {
        assert_eq!(MountError::Cache(CacheError::Stopped).to_errno(), libc::EINTR);
    }
}
