// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compaction picking and execution.

/// Deletion hints for dropping whole tables without rewriting them
pub mod hints;

/// Heuristics for extending a compaction across more than two levels
pub mod multi_level;

/// Compaction proposals and input expansion
pub mod picked;

/// Chooses what to compact next
pub mod picker;

/// Output splitting rules
pub mod splitter;

/// Tracking of in-progress compactions and pending hints
pub mod state;

/// The merging iterator at the heart of a compaction
pub mod stream;

/// Executes picked compactions
pub mod worker;

use crate::{KeyRange, Table, TableId};

/// What kind of work a compaction performs
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompactionKind {
    /// Merge tables from one level into the next
    Default,

    /// Re-link tables into the next level without rewriting them
    Move,

    /// Drop whole tables that are fully shadowed by resolved deletion hints
    DeleteOnly,

    /// Rewrite a bottom-level table in place to drop its dead garbage
    ElisionOnly,

    /// Rewrite a table flagged via `mark_for_compaction` in place
    Rewrite,

    /// Write a new L0 run from a memtable-style source
    ///
    /// Uses precomputed split keys and keeps all tombstones, since the
    /// flushed data shadows everything below it.
    Flush,
}

/// The tables a compaction consumes in a single level
#[derive(Clone, Debug)]
pub struct CompactionInput {
    /// The level the tables live in
    pub level: usize,

    /// The tables themselves
    pub tables: Vec<Table>,
}

impl CompactionInput {
    pub(crate) fn new(level: usize, tables: Vec<Table>) -> Self {
        Self { level, tables }
    }

    /// Returns the summed file size of the input's tables.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.tables.iter().map(Table::file_size).sum()
    }

    /// Returns the IDs of the input's tables.
    pub fn ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables.iter().map(Table::id)
    }

    /// Returns the convex hull of the input's tables, or `None` if empty.
    #[must_use]
    pub fn aggregate_key_range(&self) -> Option<KeyRange> {
        KeyRange::aggregate(self.tables.iter().map(|x| &x.key_range))
    }
}
