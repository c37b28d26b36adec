// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{SeqNo, UserKey};

/// Kind of a key span
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpanKind {
    /// Deletes all point keys in the span below its seqno
    RangeTombstone,

    /// Deletes all range keys in the span below its seqno
    RangeKeyDelete,
}

/// A deletion covering a half-open range of user keys [start, end)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Span {
    /// Start key (inclusive)
    pub start: UserKey,

    /// End key (exclusive)
    pub end: UserKey,

    /// Write timestamp
    pub seqno: SeqNo,

    /// What the span deletes
    pub kind: SpanKind,
}

impl Span {
    /// Creates a new span.
    ///
    /// # Panics
    ///
    /// Panics if start >= end.
    #[must_use]
    pub fn new<K: Into<UserKey>>(start: K, end: K, seqno: SeqNo, kind: SpanKind) -> Self {
        let start = start.into();
        let end = end.into();
        assert!(start < end, "span may not be empty");

        Self {
            start,
            end,
            seqno,
            kind,
        }
    }
}

/// A defragmented piece of overlapping spans
///
/// Fragments produced by [`fragment`] are non-overlapping and sorted,
/// so a single linear scan over them lines up with the merged point
/// key stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    /// Start key (inclusive)
    pub start: UserKey,

    /// End key (exclusive)
    pub end: UserKey,

    /// Lowest seqno of any span covering this fragment
    pub smallest_seqno: SeqNo,

    /// Highest seqno of any span covering this fragment
    pub largest_seqno: SeqNo,

    /// Whether a covering span deletes point keys
    pub deletes_points: bool,

    /// Whether a covering span deletes range keys
    pub deletes_range_keys: bool,
}

impl Fragment {
    /// Returns `true` if `key` written at `seqno` is deleted by this fragment.
    #[must_use]
    pub fn covers(&self, key: &[u8], seqno: SeqNo) -> bool {
        self.deletes_points && key >= &self.start && key < &self.end && seqno < self.largest_seqno
    }
}

/// Splits overlapping spans into disjoint, sorted fragments.
///
/// Every boundary key of any input span becomes a fragment boundary, and
/// each fragment aggregates the seqno range and kinds of all spans
/// covering it.
#[must_use]
pub fn fragment(spans: &[Span]) -> Vec<Fragment> {
    if spans.is_empty() {
        return Vec::new();
    }

    let mut boundaries: Vec<&UserKey> = Vec::with_capacity(spans.len() * 2);
    for span in spans {
        boundaries.push(&span.start);
        boundaries.push(&span.end);
    }
    boundaries.sort();
    boundaries.dedup();

    let mut fragments = Vec::new();

    for window in boundaries.windows(2) {
        let (Some(start), Some(end)) = (window.first(), window.get(1)) else {
            continue;
        };

        let mut smallest_seqno = SeqNo::MAX;
        let mut largest_seqno = 0;
        let mut deletes_points = false;
        let mut deletes_range_keys = false;

        for span in spans {
            if &span.start <= *start && &span.end >= *end {
                smallest_seqno = smallest_seqno.min(span.seqno);
                largest_seqno = largest_seqno.max(span.seqno);

                match span.kind {
                    SpanKind::RangeTombstone => deletes_points = true,
                    SpanKind::RangeKeyDelete => deletes_range_keys = true,
                }
            }
        }

        if !deletes_points && !deletes_range_keys {
            // Gap between disjoint spans
            continue;
        }

        fragments.push(Fragment {
            start: (*start).clone(),
            end: (*end).clone(),
            smallest_seqno,
            largest_seqno,
            deletes_points,
            deletes_range_keys,
        });
    }

    fragments
}
