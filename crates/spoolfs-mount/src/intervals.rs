//! Coalesced byte-interval accounting.
//!
//! An [`IntervalSet`] tracks which `[start, end)` byte ranges of a cached
//! file are materialized on disk. Intervals are kept sorted,
//! non-overlapping and non-adjacent; insertion coalesces, lookups are a
//! binary search.

use serde::{Deserialize, Serialize};

/// One half-open byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// First byte covered.
    pub start: u64,
    /// One past the last byte covered.
    pub end: u64,
}

/// Sorted, coalesced set of `[start, end)` intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntervalSet {
    ranges: Vec<Interval>,
}

impl IntervalSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether nothing is covered.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Sum of covered bytes.
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// The disjoint intervals, sorted.
    pub fn iter(&self) -> impl Iterator<Item = Interval> + '_ {
        self.ranges.iter().copied()
    }

    /// Index of the first interval whose end is past `offset`.
    fn first_reaching(&self, offset: u64) -> usize {
        self.ranges.partition_point(|r| r.end <= offset)
    }

    /// Mark `[start, end)` as covered, coalescing adjacent and
    /// overlapping intervals. Empty ranges are no-ops; `start > end`
    /// is rejected.
    pub fn insert(&mut self, start: u64, end: u64) {
        assert!(start <= end, "inverted interval [{start}, {end})");
        if start == end {
            return;
        }
        // Everything that overlaps or touches [start, end) merges into one.
        let lo = self.ranges.partition_point(|r| r.end < start);
        let hi = self.ranges.partition_point(|r| r.start <= end);
        if lo == hi {
            self.ranges.insert(lo, Interval { start, end });
            return;
        }
        let merged = Interval {
            start: start.min(self.ranges[lo].start),
            end: end.max(self.ranges[hi - 1].end),
        };
        self.ranges.splice(lo..hi, std::iter::once(merged));
    }

    /// Whether `[start, end)` is fully covered. Empty ranges are
    /// trivially present.
    pub fn present(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        let i = self.first_reaching(start);
        match self.ranges.get(i) {
            Some(r) => r.start <= start && end <= r.end,
            None => false,
        }
    }

    /// The ordered gaps of `[start, end)` that are not covered.
    pub fn find_missing(&self, start: u64, end: u64) -> Vec<Interval> {
        let mut gaps = Vec::new();
        if start >= end {
            return gaps;
        }
        let mut cursor = start;
        let mut i = self.first_reaching(start);
        while cursor < end {
            match self.ranges.get(i) {
                Some(r) if r.start < end => {
                    if r.start > cursor {
                        gaps.push(Interval {
                            start: cursor,
                            end: r.start,
                        });
                    }
                    cursor = r.end.max(cursor);
                    i += 1;
                }
                _ => {
                    gaps.push(Interval { start: cursor, end });
                    break;
                }
            }
        }
        gaps
    }
}
