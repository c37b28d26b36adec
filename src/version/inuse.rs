// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Version;
use crate::KeyRange;

/// Merged key ranges of all tables below a compaction's output level.
///
/// A tombstone written by the compaction can only be elided if no deeper
/// table could still hold a version of its key; these ranges answer that
/// question. Queries must arrive with non-decreasing keys, which lets a
/// whole compaction consult the ranges in a single linear pass.
#[derive(Clone)]
pub struct InUseKeyRanges {
    ranges: Vec<KeyRange>,
    idx: usize,
}

impl InUseKeyRanges {
    /// Collects and merges the key ranges of all tables in levels
    /// `start_level..`, clipped to `bounds`.
    #[must_use]
    pub fn calculate(version: &Version, start_level: usize, bounds: &KeyRange) -> Self {
        let mut ranges: Vec<KeyRange> = Vec::new();

        for level in version.iter_levels().skip(start_level) {
            for table in level.get_overlapping(bounds) {
                ranges.push(table.key_range.clone());
            }
        }

        ranges.sort_by(|a, b| a.min().cmp(b.min()));

        // Interval merge
        let mut merged: Vec<KeyRange> = Vec::with_capacity(ranges.len());

        for range in ranges {
            match merged.last_mut() {
                Some(last) if last.max() >= range.min() => {
                    last.expand_with(&range);
                }
                _ => merged.push(range),
            }
        }

        Self {
            ranges: merged,
            idx: 0,
        }
    }

    /// Returns an empty set (everything is elidable).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ranges: Vec::new(),
            idx: 0,
        }
    }

    /// Returns `true` if there are no in-use ranges at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns `true` if the half-open range `[start, end)` intersects
    /// any in-use range.
    ///
    /// Queried ranges must arrive with non-decreasing start keys.
    pub fn overlaps_range(&mut self, start: &[u8], end: &[u8]) -> bool {
        while let Some(range) = self.ranges.get(self.idx) {
            if start > range.max() {
                self.idx += 1;
            } else {
                return range.min().as_ref() < end;
            }
        }

        false
    }

    /// Returns `true` if `key` lies in any in-use range.
    ///
    /// Keys must be passed in non-decreasing order.
    pub fn contains(&mut self, key: &[u8]) -> bool {
        while let Some(range) = self.ranges.get(self.idx) {
            if key > range.max() {
                self.idx += 1;
            } else {
                return key >= range.min();
            }
        }

        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        table::TableMetadata,
        version::{Level, Run},
        Table,
    };
    use std::sync::Arc;
    use test_log::test;

    fn kr(min: &str, max: &str) -> KeyRange {
        KeyRange::new((min.as_bytes().into(), max.as_bytes().into()))
    }

    fn t(id: u64, min: &str, max: &str) -> Table {
        TableMetadata::new(id, kr(min, max), 100, (0, 0)).into()
    }

    fn level_of(tables: Vec<Table>) -> Level {
        Level::from_runs(vec![Arc::new(Run::new(tables))])
    }

    #[test]
    fn inuse_empty_version() {
        let version = Version::new(0);
        let mut ranges = InUseKeyRanges::calculate(&version, 1, &kr("a", "z"));

        assert!(!ranges.contains(b"a"));
        assert!(!ranges.contains(b"m"));
    }

    #[test]
    fn inuse_merges_overlapping() {
        let version = Version::from_levels(
            0,
            vec![
                Level::empty(),
                level_of(vec![t(1, "a", "f"), t(2, "k", "p")]),
                level_of(vec![t(3, "d", "m")]),
            ],
        );

        // Levels 1+2 merge into one contiguous range [a, p]
        let mut ranges = InUseKeyRanges::calculate(&version, 1, &kr("a", "z"));

        assert!(ranges.contains(b"a"));
        assert!(ranges.contains(b"g"));
        assert!(ranges.contains(b"p"));
        assert!(!ranges.contains(b"q"));
    }

    #[test]
    fn inuse_monotone_scan() {
        let version = Version::from_levels(
            0,
            vec![
                Level::empty(),
                level_of(vec![t(1, "a", "c"), t(2, "k", "m")]),
            ],
        );

        let mut ranges = InUseKeyRanges::calculate(&version, 1, &kr("a", "z"));

        assert!(ranges.contains(b"b"));
        assert!(!ranges.contains(b"d"));
        assert!(ranges.contains(b"k"));
        assert!(!ranges.contains(b"z"));
    }

    #[test]
    fn inuse_skips_shallow_levels() {
        let version = Version::from_levels(
            0,
            vec![Level::empty(), level_of(vec![t(1, "a", "z")]), Level::empty()],
        );

        // Starting below level 1 sees nothing
        let mut ranges = InUseKeyRanges::calculate(&version, 2, &kr("a", "z"));
        assert!(!ranges.contains(b"m"));
    }
}
