//! Segment pool over a local directory of article bodies.
//!
//! A stand-in for a production news-server pool: each article body is a
//! file named by its percent-encoded article id. Useful for offline
//! operation, integration tests and cold-start smoke checks; anything
//! network-backed implements [`SegmentPool`] the same way.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use spoolfs_core::{PoolError, PoolMetrics, SegmentBody, SegmentPool};
use spoolfs_mount::path_codec;

/// [`SegmentPool`] reading bodies from a directory.
pub struct DirArticlePool {
    root: PathBuf,
    metrics: PoolMetrics,
}

impl DirArticlePool {
    /// Pool rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            metrics: PoolMetrics::default(),
        }
    }

    /// Path holding an article's body.
    pub fn article_path(&self, article_id: &str) -> PathBuf {
        self.root.join(path_codec::encode(article_id))
    }
}

#[async_trait]
impl SegmentPool for DirArticlePool {
    async fn fetch(
        &self,
        article_id: &str,
        _groups: &[String],
        token: &CancellationToken,
    ) -> Result<SegmentBody, PoolError> {
        if token.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        match tokio::fs::File::open(self.article_path(article_id)).await {
            Ok(file) => {
                if let Ok(meta) = file.metadata().await {
                    self.metrics.record_fetch(meta.len());
                }
                Ok(Box::new(file))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.metrics.record_error();
                Err(PoolError::Missing {
                    article_id: article_id.to_string(),
                })
            }
            Err(e) => {
                self.metrics.record_error();
                Err(PoolError::Transient {
                    article_id: article_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}
