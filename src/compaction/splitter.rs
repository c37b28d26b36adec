// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Table, UserKey};
use enum_dispatch::enum_dispatch;

/// A single output-splitting rule
///
/// Consulted by the executor before writing `key`; `written` is the
/// estimated size of the current output so far. The executor only acts
/// on the advice at user key boundaries, so no output ever splits a
/// user key's versions apart.
///
/// Once a splitter advises a split for some key, it must keep advising
/// one for every following key until the next output is started.
#[enum_dispatch]
pub trait OutputSplitter {
    /// Returns `true` if the current output should end before `key`.
    fn should_split_before(&mut self, key: &[u8], written: u64) -> bool;

    /// Resets per-output state; `key` is the first key of the new output.
    fn on_new_output(&mut self, key: &[u8]);
}

/// Enforces the target output size, preferring splits that line up
/// with grandparent table boundaries
pub struct SizeSplitter {
    target_size: u64,

    /// Smallest keys of the grandparent tables overlapping the compaction
    boundaries: Vec<UserKey>,

    next_boundary: usize,
    boundaries_observed: u64,
}

impl SizeSplitter {
    /// Creates a splitter aiming for `target_size` bytes per output.
    #[must_use]
    pub fn new(target_size: u64, grandparents: &[Table]) -> Self {
        Self {
            target_size,
            boundaries: grandparents
                .iter()
                .map(|x| x.key_range.min().clone())
                .collect(),
            next_boundary: 0,
            boundaries_observed: 0,
        }
    }
}

impl OutputSplitter for SizeSplitter {
    fn should_split_before(&mut self, key: &[u8], written: u64) -> bool {
        let mut at_boundary = false;

        while self
            .boundaries
            .get(self.next_boundary)
            .is_some_and(|b| b.as_ref() <= key)
        {
            at_boundary = true;
            self.boundaries_observed += 1;
            self.next_boundary += 1;
        }

        if written < self.target_size / 2 {
            return false;
        }

        if written >= 2 * self.target_size {
            return true;
        }

        if !at_boundary {
            // Past the last grandparent there is nothing to align with,
            // so split on size alone
            return self.next_boundary >= self.boundaries.len() && written >= self.target_size;
        }

        // Between 0.5x and 2x the target and aligned with a grandparent.
        // Each boundary already observed inside this output means the
        // grandparent level is dense here, so a later, better-sized
        // split opportunity is likely; raise the bar accordingly.
        let min_pct = 50 + 5 * self.boundaries_observed.saturating_sub(1).min(8);

        written >= min_pct * self.target_size / 100
    }

    fn on_new_output(&mut self, _key: &[u8]) {
        self.boundaries_observed = 0;
    }
}

/// Caps how much grandparent data a single output may overlap
///
/// Without this, one oversized output could force an enormous follow-up
/// compaction when it is itself compacted down a level.
pub struct GrandparentLimiter {
    max_overlap: u64,
    grandparents: Vec<Table>,
    limit: Option<UserKey>,
}

impl GrandparentLimiter {
    /// Creates a limiter capping the overlap at `max_overlap` bytes.
    #[must_use]
    pub fn new(max_overlap: u64, grandparents: Vec<Table>) -> Self {
        Self {
            max_overlap,
            grandparents,
            limit: None,
        }
    }

    /// Returns the user key an output starting at `start` may extend to.
    fn find_limit(&self, start: &[u8]) -> Option<UserKey> {
        let mut overlapped = 0;

        for table in &self.grandparents {
            if table.key_range.max().as_ref() < start {
                continue;
            }

            overlapped += table.file_size;

            // Always allow forward progress past the first boundary
            if table.key_range.min().as_ref() <= start {
                continue;
            }

            if overlapped > self.max_overlap {
                return Some(table.key_range.min().clone());
            }
        }

        None
    }
}

impl OutputSplitter for GrandparentLimiter {
    fn should_split_before(&mut self, key: &[u8], _written: u64) -> bool {
        self.limit.as_ref().is_some_and(|limit| key >= limit.as_ref())
    }

    fn on_new_output(&mut self, key: &[u8]) {
        self.limit = self.find_limit(key);
    }
}

/// Splits at precomputed keys, used when flushing into L0
///
/// Aligning flushed runs on shared boundaries keeps later L0 merges
/// narrow.
pub struct SplitKeySplitter {
    keys: Vec<UserKey>,
    limit: Option<UserKey>,
}

impl SplitKeySplitter {
    /// Creates a splitter cutting outputs at the given keys.
    #[must_use]
    pub fn new(mut keys: Vec<UserKey>) -> Self {
        keys.sort();

        Self { keys, limit: None }
    }
}

impl OutputSplitter for SplitKeySplitter {
    fn should_split_before(&mut self, key: &[u8], _written: u64) -> bool {
        self.limit.as_ref().is_some_and(|limit| key >= limit.as_ref())
    }

    fn on_new_output(&mut self, key: &[u8]) {
        self.limit = self.keys.iter().find(|x| x.as_ref() > key).cloned();
    }
}

/// The decision rules of one compaction, consulted in order
#[enum_dispatch(OutputSplitter)]
pub enum Splitter {
    /// Target-size rule
    SizeSplitter,

    /// Grandparent-overlap cap
    GrandparentLimiter,

    /// Precomputed flush boundaries
    SplitKeySplitter,
}

/// Combines splitters; any one of them may force a split
pub struct SplitterChain(Vec<Splitter>);

impl SplitterChain {
    /// Combines the given splitters into one chain.
    #[must_use]
    pub fn new(splitters: Vec<Splitter>) -> Self {
        Self(splitters)
    }

    pub(crate) fn should_split_before(&mut self, key: &[u8], written: u64) -> bool {
        let mut split = false;

        // Every splitter sees every key, even after one of them already
        // voted to split, so their cursors stay in sync with the stream
        for splitter in &mut self.0 {
            split |= splitter.should_split_before(key, written);
        }

        split
    }

    pub(crate) fn on_new_output(&mut self, key: &[u8]) {
        for splitter in &mut self.0 {
            splitter.on_new_output(key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{table::TableMetadata, KeyRange};
    use test_log::test;

    fn t(id: u64, min: &str, max: &str, size: u64) -> Table {
        TableMetadata::new(
            id,
            KeyRange::new((min.as_bytes().into(), max.as_bytes().into())),
            size,
            (0, 0),
        )
        .into()
    }

    #[test]
    fn size_splitter_plain_thresholds() {
        let mut splitter = SizeSplitter::new(100, &[]);
        splitter.on_new_output(b"a");

        assert!(!splitter.should_split_before(b"b", 10));
        assert!(!splitter.should_split_before(b"c", 49));

        // No grandparents left: split at the target
        assert!(splitter.should_split_before(b"d", 100));

        // Double the target always splits
        assert!(splitter.should_split_before(b"e", 200));
    }

    #[test]
    fn size_splitter_waits_for_grandparent_boundary() {
        let grandparents = vec![t(1, "k", "m", 10), t(2, "p", "r", 10)];
        let mut splitter = SizeSplitter::new(100, &grandparents);
        splitter.on_new_output(b"a");

        // Half the target reached, but not at a boundary yet
        assert!(!splitter.should_split_before(b"b", 60));

        // Crossing the first boundary at >= 50% of the target splits
        assert!(splitter.should_split_before(b"k", 60));
    }

    #[test]
    fn size_splitter_ramps_up_threshold() {
        let grandparents = vec![t(1, "b", "c", 10), t(2, "d", "e", 10)];
        let mut splitter = SizeSplitter::new(100, &grandparents);
        splitter.on_new_output(b"a");

        // First boundary: 50% suffices, but we are below it
        assert!(!splitter.should_split_before(b"b", 40));

        // Second boundary raises the bar to 55%
        assert!(!splitter.should_split_before(b"d", 54));

        // Same boundary count, enough bytes now
        assert!(splitter.should_split_before(b"f", 200));
    }

    #[test]
    fn grandparent_limiter() {
        let grandparents = vec![
            t(1, "a", "c", 60),
            t(2, "d", "f", 60),
            t(3, "g", "i", 60),
        ];

        let mut limiter = GrandparentLimiter::new(150, grandparents);
        limiter.on_new_output(b"a");

        // 120 bytes overlapped at "d", 180 > 150 at "g"
        assert!(!limiter.should_split_before(b"b", 0));
        assert!(!limiter.should_split_before(b"f", 0));
        assert!(limiter.should_split_before(b"g", 0));
        assert!(limiter.should_split_before(b"z", 0));

        // A new output starting past the overlap is unconstrained
        limiter.on_new_output(b"h");
        assert!(!limiter.should_split_before(b"z", 0));
    }

    #[test]
    fn split_key_splitter() {
        let mut splitter = SplitKeySplitter::new(vec![b"k".into(), b"d".into()]);

        splitter.on_new_output(b"a");
        assert!(!splitter.should_split_before(b"c", 0));
        assert!(splitter.should_split_before(b"d", 0));

        splitter.on_new_output(b"d");
        assert!(!splitter.should_split_before(b"j", 0));
        assert!(splitter.should_split_before(b"k", 0));

        splitter.on_new_output(b"x");
        assert!(!splitter.should_split_before(b"z", 0));
    }

    #[test]
    fn chain_any_splitter_wins() {
        let mut chain = SplitterChain::new(vec![
            SizeSplitter::new(1_000, &[]).into(),
            SplitKeySplitter::new(vec![b"m".into()]).into(),
        ]);

        chain.on_new_output(b"a");
        assert!(!chain.should_split_before(b"b", 10));
        assert!(chain.should_split_before(b"m", 10));
    }
}
