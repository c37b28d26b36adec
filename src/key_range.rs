// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::UserKey;

/// A closed interval [min, max] of user keys
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange((UserKey, UserKey));

impl KeyRange {
    /// Creates a new key range.
    ///
    /// # Panics
    ///
    /// Panics if min > max.
    #[must_use]
    pub fn new(range: (UserKey, UserKey)) -> Self {
        debug_assert!(range.0 <= range.1, "invalid key range");
        Self(range)
    }

    /// Returns the lower bound.
    #[must_use]
    pub fn min(&self) -> &UserKey {
        &self.0 .0
    }

    /// Returns the upper bound (inclusive).
    #[must_use]
    pub fn max(&self) -> &UserKey {
        &self.0 .1
    }

    #[must_use]
    pub(crate) fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> bool {
        let key = key.as_ref();
        let (start, end) = &self.0;
        key >= start && key <= end
    }

    /// Returns `true` if the ranges share at least one key.
    #[must_use]
    pub fn overlaps_with_key_range(&self, other: &Self) -> bool {
        let (start1, end1) = &self.0;
        let (start2, end2) = &other.0;
        end1 >= start2 && start1 <= end2
    }

    /// Returns `true` if `other` is fully contained in this range.
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        let (start1, end1) = &self.0;
        let (start2, end2) = &other.0;
        start1 <= start2 && end1 >= end2
    }

    /// Merges an iterator of key ranges into their convex hull.
    ///
    /// Returns `None` for an empty iterator.
    pub fn aggregate<'a>(mut iter: impl Iterator<Item = &'a Self>) -> Option<Self> {
        let first = iter.next()?;

        let mut lo = first.min();
        let mut hi = first.max();

        for range in iter {
            if range.min() < lo {
                lo = range.min();
            }
            if range.max() > hi {
                hi = range.max();
            }
        }

        Some(Self((lo.clone(), hi.clone())))
    }

    /// Extends this range to cover `other` as well.
    pub fn expand_with(&mut self, other: &Self) {
        if other.min() < self.min() {
            self.0 .0 = other.min().clone();
        }
        if other.max() > self.max() {
            self.0 .1 = other.max().clone();
        }
    }
}
