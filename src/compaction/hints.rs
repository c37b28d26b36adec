// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{seqno::snapshot_index, SeqNo, Table, TableId, UserKey, Version};

/// A note that a surviving range deletion may later allow dropping
/// whole tables without rewriting them
///
/// Created by the compaction executor when a range deletion outlives a
/// compaction because deeper tables still hold covered data. Once every
/// snapshot separating the deletion from that data is released, the
/// covered tables can be deleted outright in a delete-only compaction.
#[derive(Clone, Debug)]
pub struct DeletionHint {
    /// Start of the deleted key range (inclusive)
    pub start: UserKey,

    /// End of the deleted key range (exclusive)
    pub end: UserKey,

    /// Whether the deletion covers point keys
    pub deletes_points: bool,

    /// Whether the deletion covers range keys
    pub deletes_range_keys: bool,

    /// Lowest seqno of the deletions aggregated into this hint
    pub tombstone_smallest_seqno: SeqNo,

    /// Highest seqno of the deletions aggregated into this hint
    pub tombstone_largest_seqno: SeqNo,

    /// Level the surviving deletion was written to
    pub tombstone_level: usize,

    /// Output table carrying the surviving deletion
    pub tombstone_table: TableId,

    /// Lowest seqno of any covered table observed when the hint was made
    ///
    /// Tables with even older data may exist below; they were not
    /// covered by the deletion and must never be dropped through it.
    pub file_smallest_seqno: SeqNo,
}

impl DeletionHint {
    /// Returns `true` once no snapshot separates the deletion from the
    /// data it covers.
    #[must_use]
    pub fn is_resolved(&self, snapshots: &[SeqNo]) -> bool {
        snapshot_index(self.tombstone_largest_seqno, snapshots)
            == snapshot_index(self.file_smallest_seqno, snapshots)
    }

    /// Returns `true` if `table` can be dropped outright through this hint.
    #[must_use]
    pub fn can_delete(&self, table: &Table, snapshots: &[SeqNo]) -> bool {
        // Every key in the table must be older than the oldest deletion,
        // and must have been visible when the hint was made
        if table.largest_seqno >= self.tombstone_smallest_seqno
            || table.smallest_seqno < self.file_smallest_seqno
        {
            return false;
        }

        // No snapshot may separate the newest deletion from the table's
        // oldest key
        if snapshot_index(self.tombstone_largest_seqno, snapshots)
            != snapshot_index(table.smallest_seqno, snapshots)
        {
            return false;
        }

        if table.has_range_keys && !self.deletes_range_keys {
            return false;
        }

        if table.has_point_keys && !self.deletes_points {
            return false;
        }

        self.start.as_ref() <= table.key_range.min().as_ref()
            && table.key_range.max().as_ref() < self.end.as_ref()
    }

    /// Collects the tables below the deletion that can be dropped right now.
    pub(crate) fn deletable_tables(
        &self,
        version: &Version,
        snapshots: &[SeqNo],
    ) -> Vec<(usize, Table)> {
        let mut deletable = Vec::new();

        if self.start >= self.end {
            return deletable;
        }

        let bounds = crate::KeyRange::new((self.start.clone(), self.end.clone()));

        for (idx, level) in version.iter_levels().enumerate() {
            if idx <= self.tombstone_level {
                continue;
            }

            for table in level.get_overlapping(&bounds) {
                if !table.is_compacting() && self.can_delete(table, snapshots) {
                    deletable.push((idx, table.clone()));
                }
            }
        }

        deletable
    }
}
