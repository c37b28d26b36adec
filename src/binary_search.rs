// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// NOTE: PERF: For some reason, hand-rolling a binary search is
// faster than using slice::partition_point

/// Returns the index of the partition point according to the given predicate
/// (the index of the first element of the second partition).
///
/// Faster alternative to [`slice::partition_point`] (according to benchmarks).
pub fn partition_point<T, F>(slice: &[T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();

    if right == 0 {
        return 0;
    }

    while left < right {
        let mid = (left + right) / 2;

        #[allow(clippy::expect_used)]
        let item = slice.get(mid).expect("should exist");

        if pred(item) {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    left
}
