//! Bridge from synchronous FUSE callbacks into the async runtime.
//!
//! Metadata operations block the callback thread on a oneshot with a
//! timeout; data reads never use this (they are spawned with the reply
//! moved into the task, see `filesystem::read`). A timed-out task is
//! aborted so it cannot keep holding locks or backend connections.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Bridge failures.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The runtime dropped the task before completion.
    #[error("operation was cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Errno for this failure.
    pub fn to_errno(&self) -> i32 {
        match self {
            BridgeError::Timeout(_) => libc::ETIMEDOUT,
            BridgeError::Cancelled => libc::ECANCELED,
        }
    }
}

/// Run `future` on the runtime, blocking the calling thread for at most
/// `timeout`.
pub fn block_on_with_timeout<F, T>(
    handle: &Handle,
    timeout: Duration,
    future: F,
) -> Result<T, BridgeError>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task = handle.spawn(async move {
        let result = tokio::time::timeout(timeout, future).await;
        let _ = tx.send(result);
    });

    match rx.blocking_recv() {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_elapsed)) => {
            task.abort();
            Err(BridgeError::Timeout(timeout))
        }
        Err(_closed) => {
            task.abort();
            Err(BridgeError::Cancelled)
        }
    }
}
