//! Range assembly for files carved out of other containers.
//!
//! A nested record's logical bytes are the concatenation of slices of one
//! or more inner volumes (plain or encrypted). Resolving a logical range
//! walks the sources in order, translates the overlapping part of the
//! request into inner-volume coordinates, and reads each contributing
//! source serially.

use std::ops::Range;

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::ReaderConfig;
use crate::error::ReadError;
use crate::metadata::Segment;
use crate::pool::SegmentPool;

use super::cbc::read_cbc_range;
use super::segments::read_wire_range;

/// A nested source with its segment list already tail-patched at open.
#[derive(Debug, Clone)]
pub(crate) struct PlannedSource {
    pub segments: Vec<Segment>,
    pub cipher: Option<(Vec<u8>, Vec<u8>)>,
    pub inner_offset: u64,
    pub inner_length: u64,
    pub inner_volume_size: u64,
}

impl PlannedSource {
    /// Read `[range.start, range.end)` in *inner volume* coordinates.
    async fn read_inner(
        &self,
        pool: &dyn SegmentPool,
        range: Range<u64>,
        cfg: &ReaderConfig,
        token: &CancellationToken,
    ) -> Result<Bytes, ReadError> {
        match &self.cipher {
            Some((key, iv)) => {
                read_cbc_range(
                    pool,
                    &self.segments,
                    key,
                    iv,
                    self.inner_volume_size,
                    range,
                    cfg,
                    token,
                )
                .await
            }
            None => read_wire_range(pool, &self.segments, range, cfg, token).await,
        }
    }
}

/// Read logical bytes `[range.start, range.end)` of a nested file.
///
/// Sources are opened serially in order; the concatenation of the
/// per-source reads yields exactly the requested span.
pub(crate) async fn read_nested_range(
    pool: &dyn SegmentPool,
    sources: &[PlannedSource],
    range: Range<u64>,
    cfg: &ReaderConfig,
    token: &CancellationToken,
) -> Result<Bytes, ReadError> {
    if range.start >= range.end {
        return Ok(Bytes::new());
    }
    let wanted = (range.end - range.start) as usize;
    let mut out = BytesMut::with_capacity(wanted);

    let mut source_start = 0u64;
    for src in sources {
        let source_end = source_start + src.inner_length;
        if source_start < range.end && source_end > range.start {
            let local_a = range.start.max(source_start) - source_start;
            let local_b = range.end.min(source_end) - source_start;
            let inner = (src.inner_offset + local_a)..(src.inner_offset + local_b);
            trace!(
                source_start,
                inner_start = inner.start,
                inner_end = inner.end,
                encrypted = src.cipher.is_some(),
                "reading nested slice"
            );
            out.extend_from_slice(&src.read_inner(pool, inner, cfg, token).await?);
        }
        source_start = source_end;
        if source_start >= range.end {
            break;
        }
    }

    if out.len() != wanted {
        return Err(ReadError::MissingData(format!(
            "nested sources supplied {} of {} bytes for [{}, {})",
            out.len(),
            wanted,
            range.start,
            range.end
        )));
    }
    Ok(out.freeze())
}
