//! Wire-range resolution and pipelined segment fetching.
//!
//! A wire range is a `[start, end)` byte span in the coordinates of the
//! enclosing stream a segment list describes (the raw file, the encrypted
//! blob, or a nested volume). [`read_wire_range`] resolves the span to the
//! overlapping segments, fetches their bodies from the pool with a bounded
//! pipeline, and concatenates the trimmed bodies in stream order.

use std::ops::Range;

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesOrdered, StreamExt};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ReaderConfig;
use crate::error::ReadError;
use crate::metadata::Segment;
use crate::pool::SegmentPool;

/// Extend a segment list so it covers `expected_len` stream bytes.
///
/// Ingestion occasionally reports a final part short by up to roughly one
/// segment. When the shortfall is within `max_patch` bytes, the preceding
/// segment's reference is duplicated with a truncated span to keep the
/// stream whole; the bytes the duplicate yields are *undefined content*,
/// present only so downstream framing sees the declared length. Larger
/// shortfalls fail with [`ReadError::MissingData`].
pub(crate) fn patch_short_tail(
    segments: &[Segment],
    expected_len: u64,
    max_patch: u64,
) -> Result<Vec<Segment>, ReadError> {
    if expected_len == 0 {
        return Ok(Vec::new());
    }
    let Some(last) = segments.last() else {
        return Err(ReadError::MissingData(format!(
            "no segments for a {expected_len}-byte stream"
        )));
    };
    let covered = last.end_offset + 1;
    if covered >= expected_len {
        return Ok(segments.to_vec());
    }
    let shortfall = expected_len - covered;
    if shortfall > max_patch {
        return Err(ReadError::MissingData(format!(
            "stream short by {shortfall} bytes (patch limit {max_patch})"
        )));
    }
    debug!(
        shortfall,
        article_id = %last.article_id,
        "patching short tail with duplicate of preceding segment"
    );
    let mut patched = segments.to_vec();
    patched.push(Segment {
        article_id: last.article_id.clone(),
        groups: last.groups.clone(),
        size: last.size,
        start_offset: covered,
        end_offset: expected_len - 1,
        patched: true,
    });
    Ok(patched)
}

/// Fetch one segment body in full, bounded by the per-fetch timeout and
/// the caller's cancellation token.
async fn fetch_segment(
    pool: &dyn SegmentPool,
    seg: &Segment,
    cfg: &ReaderConfig,
    token: &CancellationToken,
) -> Result<Bytes, ReadError> {
    let fetch = async {
        let mut stream = pool.fetch(&seg.article_id, &seg.groups, token).await?;
        let mut body = Vec::with_capacity(seg.size as usize);
        stream.read_to_end(&mut body).await?;
        Ok::<_, ReadError>(Bytes::from(body))
    };
    tokio::select! {
        () = token.cancelled() => Err(ReadError::Cancelled),
        res = tokio::time::timeout(cfg.read_timeout, fetch) => match res {
            Ok(body) => body,
            Err(_) => Err(ReadError::Timeout(cfg.read_timeout)),
        },
    }
}

/// Slice the part of `body` that falls inside `range`, given the segment's
/// claimed span. Patched segments may return a body shorter than their
/// span; the remainder is zero-filled (undefined content by contract).
fn trim_body(seg: &Segment, body: &Bytes, range: &Range<u64>) -> Result<Bytes, ReadError> {
    let from = range.start.max(seg.start_offset) - seg.start_offset;
    let to = range.end.min(seg.end_offset + 1) - seg.start_offset;
    debug_assert!(from < to, "segment selected without overlap");

    let (from, to) = (from as usize, to as usize);
    if body.len() >= to {
        return Ok(body.slice(from..to));
    }
    if !seg.patched {
        return Err(ReadError::MissingData(format!(
            "segment {} returned {} bytes, span needs {}",
            seg.article_id,
            body.len(),
            to
        )));
    }
    let mut out = BytesMut::zeroed(to - from);
    if body.len() > from {
        let avail = &body[from..];
        out[..avail.len()].copy_from_slice(avail);
    }
    Ok(out.freeze())
}

/// Read `[range.start, range.end)` of the stream described by `segments`.
///
/// Bodies are fetched one segment at a time in stream order, with up to
/// `cfg.max_prefetch_segments` fetches in flight. On cancellation the
/// pipeline is dropped; speculative bodies are discarded without being
/// reported as errors.
pub(crate) async fn read_wire_range(
    pool: &dyn SegmentPool,
    segments: &[Segment],
    range: Range<u64>,
    cfg: &ReaderConfig,
    token: &CancellationToken,
) -> Result<Bytes, ReadError> {
    if range.start >= range.end {
        return Ok(Bytes::new());
    }
    let wanted = (range.end - range.start) as usize;
    let spans: Vec<&Segment> = segments
        .iter()
        .filter(|s| s.start_offset < range.end && s.end_offset + 1 > range.start)
        .collect();
    if spans.is_empty() {
        return Err(ReadError::MissingData(format!(
            "no segments cover [{}, {})",
            range.start, range.end
        )));
    }
    trace!(
        start = range.start,
        end = range.end,
        segments = spans.len(),
        "reading wire range"
    );

    let mut out = BytesMut::with_capacity(wanted);
    let mut pending = FuturesOrdered::new();
    let mut next = 0usize;
    // One completion queue entry per segment, in order; depth bounds how
    // far the fetches run ahead of consumption.
    let depth = cfg.max_prefetch_segments.max(1);
    loop {
        while pending.len() < depth && next < spans.len() {
            let seg = spans[next];
            next += 1;
            pending.push_back(async move { (seg, fetch_segment(pool, seg, cfg, token).await) });
        }
        let Some((seg, body)) = pending.next().await else {
            break;
        };
        let body = body?;
        out.extend_from_slice(&trim_body(seg, &body, &range)?);
    }

    if out.len() != wanted {
        return Err(ReadError::MissingData(format!(
            "assembled {} of {} bytes for [{}, {})",
            out.len(),
            wanted,
            range.start,
            range.end
        )));
    }
    Ok(out.freeze())
}
