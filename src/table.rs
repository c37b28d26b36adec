// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{version::Ranged, KeyRange, SeqNo};
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

/// Unique table (segment file) identifier
pub type TableId = u64;

/// Compaction status of a single table
///
/// Transitions only happen inside the compaction state critical section:
///
/// `NotCompacting -> Compacting -> { NotCompacting (failure), Compacted }`
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CompactionStatus {
    /// Not part of any compaction
    NotCompacting = 0,

    /// Currently an input of an in-progress compaction
    Compacting = 1,

    /// Consumed by a finished compaction; the table is obsolete
    Compacted = 2,
}

impl From<u8> for CompactionStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Compacting,
            2 => Self::Compacted,
            _ => Self::NotCompacting,
        }
    }
}

/// Table data statistics, gathered when the table was written
#[derive(Clone, Debug, Default)]
pub struct TableStats {
    /// Number of KV items
    pub item_count: u64,

    /// Number of point tombstones
    pub tombstone_count: u64,

    /// Estimated bytes in *older* tables that point tombstones
    /// in this table shadow
    pub point_del_bytes_estimate: u64,

    /// Estimated bytes in *older* tables that range tombstones
    /// in this table shadow
    pub range_del_bytes_estimate: u64,
}

impl TableStats {
    /// Estimated bytes reclaimable by compacting this table to the bottom.
    #[must_use]
    pub fn reclaimable_bytes(&self) -> u64 {
        self.point_del_bytes_estimate + self.range_del_bytes_estimate
    }
}

/// Metadata of an immutable table file
///
/// The host engine constructs these from its manifest; this crate never
/// opens the file itself.
#[derive(Debug)]
pub struct TableMetadata {
    /// Unique ID
    pub id: TableId,

    /// Size on disk in bytes (possibly compressed)
    pub file_size: u64,

    /// User key range [min, max]
    pub key_range: KeyRange,

    /// Lowest seqno of any item in the table
    pub smallest_seqno: SeqNo,

    /// Highest seqno of any item in the table
    pub largest_seqno: SeqNo,

    /// Data statistics
    pub stats: TableStats,

    /// Whether the table holds any point keys
    pub has_point_keys: bool,

    /// Whether the table holds any range keys
    pub has_range_keys: bool,

    status: AtomicU8,

    marked_for_compaction: AtomicBool,
}

impl TableMetadata {
    /// Creates new table metadata.
    #[must_use]
    pub fn new(
        id: TableId,
        key_range: KeyRange,
        file_size: u64,
        (smallest_seqno, largest_seqno): (SeqNo, SeqNo),
    ) -> Self {
        Self {
            id,
            file_size,
            key_range,
            smallest_seqno,
            largest_seqno,
            stats: TableStats::default(),
            has_point_keys: true,
            has_range_keys: false,
            status: AtomicU8::new(CompactionStatus::NotCompacting as u8),
            marked_for_compaction: AtomicBool::new(false),
        }
    }

    /// Attaches data statistics.
    #[must_use]
    pub fn with_stats(mut self, stats: TableStats) -> Self {
        self.stats = stats;
        self
    }

    /// Sets key kind presence flags.
    #[must_use]
    pub fn with_key_kinds(mut self, has_point_keys: bool, has_range_keys: bool) -> Self {
        self.has_point_keys = has_point_keys;
        self.has_range_keys = has_range_keys;
        self
    }
}

/// An immutable table file (cheaply cloneable handle)
#[derive(Clone, Debug)]
pub struct Table(Arc<TableMetadata>);

impl std::ops::Deref for Table {
    type Target = TableMetadata;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<TableMetadata> for Table {
    fn from(value: TableMetadata) -> Self {
        Self(Arc::new(value))
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Table {}

impl Ranged for Table {
    fn key_range(&self) -> &KeyRange {
        &self.key_range
    }
}

impl Table {
    /// Returns the table ID.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns the file size plus the estimated garbage its deletions
    /// shadow in older tables.
    ///
    /// Scoring by compensated size prioritizes tombstone-dense tables,
    /// which reclaims space faster than raw size would.
    #[must_use]
    pub fn compensated_size(&self) -> u64 {
        self.file_size + self.stats.reclaimable_bytes()
    }

    /// Returns the current compaction status.
    #[must_use]
    pub fn compaction_status(&self) -> CompactionStatus {
        self.0.status.load(Ordering::Acquire).into()
    }

    /// Returns `true` if the table is an input of a running compaction.
    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.compaction_status() == CompactionStatus::Compacting
    }

    pub(crate) fn set_compaction_status(&self, status: CompactionStatus) {
        self.0.status.store(status as u8, Ordering::Release);
    }

    /// Flags the table for a rewrite (e.g. after a format change).
    pub fn mark_for_compaction(&self) {
        self.0.marked_for_compaction.store(true, Ordering::Release);
    }

    pub(crate) fn unmark_for_compaction(&self) {
        self.0.marked_for_compaction.store(false, Ordering::Release);
    }

    /// Returns `true` if the table is flagged for a rewrite.
    #[must_use]
    pub fn is_marked_for_compaction(&self) -> bool {
        self.0.marked_for_compaction.load(Ordering::Acquire)
    }
}
