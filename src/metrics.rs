// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

const MAX_LEVELS: usize = 7;

/// Per-level compaction counters
#[derive(Debug, Default)]
pub struct Metrics {
    /// Bytes written by merge compactions, per destination level
    bytes_compacted: [AtomicU64; MAX_LEVELS],

    /// Bytes moved by trivial moves, per destination level
    bytes_moved: [AtomicU64; MAX_LEVELS],

    /// Number of tables added, per level
    tables_added: [AtomicU64; MAX_LEVELS],

    /// Number of tables removed, per level
    tables_removed: [AtomicU64; MAX_LEVELS],
}

impl Metrics {
    pub(crate) fn add_compacted_bytes(&self, level: usize, bytes: u64) {
        if let Some(counter) = self.bytes_compacted.get(level) {
            counter.fetch_add(bytes, Relaxed);
        }
    }

    pub(crate) fn add_moved_bytes(&self, level: usize, bytes: u64) {
        if let Some(counter) = self.bytes_moved.get(level) {
            counter.fetch_add(bytes, Relaxed);
        }
    }

    pub(crate) fn add_tables(&self, level: usize, n: u64) {
        if let Some(counter) = self.tables_added.get(level) {
            counter.fetch_add(n, Relaxed);
        }
    }

    pub(crate) fn remove_tables(&self, level: usize, n: u64) {
        if let Some(counter) = self.tables_removed.get(level) {
            counter.fetch_add(n, Relaxed);
        }
    }

    /// Bytes written into `level` by merge compactions.
    #[must_use]
    pub fn compacted_bytes(&self, level: usize) -> u64 {
        self.bytes_compacted.get(level).map_or(0, |x| x.load(Relaxed))
    }

    /// Bytes relinked into `level` by trivial moves.
    #[must_use]
    pub fn moved_bytes(&self, level: usize) -> u64 {
        self.bytes_moved.get(level).map_or(0, |x| x.load(Relaxed))
    }

    /// Number of tables added to `level`.
    #[must_use]
    pub fn tables_added(&self, level: usize) -> u64 {
        self.tables_added.get(level).map_or(0, |x| x.load(Relaxed))
    }

    /// Number of tables removed from `level`.
    #[must_use]
    pub fn tables_removed(&self, level: usize) -> u64 {
        self.tables_removed.get(level).map_or(0, |x| x.load(Relaxed))
    }
}
