// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    seqno::snapshot_index, span::Fragment, version::inuse::InUseKeyRanges, SeqNo, UserKey,
    ValueType,
};
use std::iter::Peekable;

type Item = crate::Result<crate::InternalValue>;

/// Consumes a merged KV stream and emits the versions that must survive
///
/// This iterator is used during flushing & compaction. Versions are
/// collapsed per snapshot stripe: of all versions of a user key that no
/// snapshot can tell apart, only the newest survives. On top of that:
///
/// - point keys deleted by a range tombstone in their own stripe are
///   dropped,
/// - weak tombstones annihilate the value they delete when both sit in
///   the same stripe,
/// - tombstones in the visible stripe are elided entirely once no deeper
///   table can still hold a version of their key,
/// - surviving seqnos below the earliest snapshot may be rewritten to 0,
///   which keeps them maximally compressible.
pub struct CompactionStream<'a, I: Iterator<Item = Item>> {
    /// KV stream, ordered by user key asc, seqno desc
    inner: Peekable<I>,

    /// Ascending seqnos of open snapshots
    snapshots: &'a [SeqNo],

    /// Defragmented deletion spans over all inputs
    fragments: Vec<Fragment>,
    frag_idx: usize,

    /// Key ranges still in use below the output level; `None` disables
    /// tombstone elision
    in_use: Option<InUseKeyRanges>,

    zero_seqnos: bool,

    current_key: Option<UserKey>,
    current_stripe: Option<usize>,
}

impl<'a, I: Iterator<Item = Item>> CompactionStream<'a, I> {
    /// Initializes a new compaction stream.
    #[must_use]
    pub fn new(iter: I, snapshots: &'a [SeqNo]) -> Self {
        Self {
            inner: iter.peekable(),
            snapshots,
            fragments: Vec::new(),
            frag_idx: 0,
            in_use: None,
            zero_seqnos: false,
            current_key: None,
            current_stripe: None,
        }
    }

    /// Installs the deletion spans covering this compaction.
    #[must_use]
    pub fn with_fragments(mut self, fragments: Vec<Fragment>) -> Self {
        self.fragments = fragments;
        self
    }

    /// Enables tombstone elision against the given deeper key ranges.
    #[must_use]
    pub fn with_tombstone_elision(mut self, in_use: InUseKeyRanges) -> Self {
        self.in_use = Some(in_use);
        self
    }

    /// Rewrites seqnos below the earliest snapshot to zero.
    ///
    /// Only sound when no deeper table holds versions of the compacted
    /// keys, otherwise zeroing would invert version order across levels.
    #[must_use]
    pub fn zero_seqnos(mut self, b: bool) -> Self {
        self.zero_seqnos = b;
        self
    }

    /// Returns `true` if a range deletion in the item's own stripe covers it.
    fn covered_by_span(&mut self, key: &[u8], seqno: SeqNo, stripe: usize) -> bool {
        while self
            .fragments
            .get(self.frag_idx)
            .is_some_and(|frag| frag.end.as_ref() <= key)
        {
            self.frag_idx += 1;
        }

        let Some(frag) = self.fragments.get(self.frag_idx) else {
            return false;
        };

        frag.covers(key, seqno) && snapshot_index(frag.largest_seqno, self.snapshots) == stripe
    }
}

impl<I: Iterator<Item = Item>> Iterator for CompactionStream<'_, I> {
    type Item = Item;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut head = fail_iter!(self.inner.next()?);

            if self.current_key.as_ref() != Some(&head.key.user_key) {
                self.current_key = Some(head.key.user_key.clone());
                self.current_stripe = None;
            }

            let stripe = snapshot_index(head.key.seqno, self.snapshots);

            // Shadowed by a newer version no snapshot can tell apart
            if self.current_stripe == Some(stripe) {
                continue;
            }

            self.current_stripe = Some(stripe);

            if self.covered_by_span(&head.key.user_key, head.key.seqno, stripe) {
                continue;
            }

            if head.key.value_type == ValueType::WeakTombstone {
                let snapshots = self.snapshots;

                // The weak tombstone and the value it deletes cancel out,
                // unless a snapshot sits between them
                let annihilated = self
                    .inner
                    .next_if(|kv| {
                        matches!(kv, Ok(kv) if kv.key.user_key == head.key.user_key
                            && kv.key.value_type == ValueType::Value
                            && snapshot_index(kv.key.seqno, snapshots) == stripe)
                    })
                    .is_some();

                if annihilated {
                    continue;
                }
            }

            if head.is_tombstone() && stripe == 0 {
                if let Some(in_use) = &mut self.in_use {
                    // Nothing below can resurface this key, so the
                    // tombstone shadows nothing that outlives this
                    // compaction (older versions in the stream are all
                    // in the visible stripe, too, and get dropped above)
                    if !in_use.contains(&head.key.user_key) {
                        continue;
                    }
                }
            }

            if self.zero_seqnos && stripe == 0 {
                head.key.seqno = 0;
            }

            return Some(Ok(head));
        }
    }
}
