// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{binary_search::partition_point, SeqNo};

/// Returns the stripe index of `seqno` in an ascending list of snapshot seqnos.
///
/// A snapshot at seqno `t` sees exactly the items with seqno < `t`, so two
/// items fall into the same stripe - meaning no snapshot can tell them
/// apart - iff their indexes are equal.
///
/// Index 0 is the visible stripe (below the earliest snapshot).
#[must_use]
pub fn snapshot_index(seqno: SeqNo, snapshots: &[SeqNo]) -> usize {
    debug_assert!(snapshots.is_sorted(), "snapshots must be sorted ascending");

    partition_point(snapshots, |&s| s <= seqno)
}

/// Returns the earliest snapshot seqno, or `SeqNo::MAX` if there are none.
///
/// Anything below this seqno is invisible to every open snapshot.
#[must_use]
pub fn earliest_snapshot(snapshots: &[SeqNo]) -> SeqNo {
    snapshots.first().copied().unwrap_or(SeqNo::MAX)
}
