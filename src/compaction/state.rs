// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{hints::DeletionHint, picked::PickedCompaction, CompactionKind};
use crate::{HashMap, KeyRange, SeqNo, Table, TableId, Version};
use std::collections::VecDeque;

/// Unique ID of a registered compaction
pub type CompactionId = u64;

/// A key range that accumulated enough skipped-over reads to be worth
/// compacting down a level
#[derive(Clone, Debug)]
pub struct ReadCompaction {
    /// Level of the offending table
    pub level: usize,

    /// The read key range
    pub key_range: KeyRange,

    /// The table the reads kept stepping over
    pub table_id: TableId,
}

struct InProgress {
    kind: CompactionKind,
    output_level: usize,
    bounds: KeyRange,

    /// Input tables per level, kept to roll statuses forward or back
    inputs: Vec<(usize, Vec<Table>)>,
}

/// Book-keeping shared by the picker and the compaction workers
///
/// The caller guards this with its own mutex; all methods assume they
/// run inside that critical section. Table status flips never happen
/// anywhere else, so the picker always sees a consistent picture.
#[derive(Default)]
pub struct CompactionState {
    next_id: CompactionId,
    in_progress: HashMap<CompactionId, InProgress>,
    read_queue: VecDeque<ReadCompaction>,
    hints: Vec<DeletionHint>,
}

impl CompactionState {
    /// Registers a picked compaction, flagging its inputs as compacting.
    ///
    /// # Panics
    ///
    /// Panics if any input table is already part of another compaction.
    pub fn register(&mut self, pc: &PickedCompaction) -> CompactionId {
        let id = self.next_id;
        self.next_id += 1;

        let mut inputs = Vec::with_capacity(pc.inputs.len());

        for input in &pc.inputs {
            for table in &input.tables {
                assert!(
                    !table.is_compacting(),
                    "table {} is already being compacted",
                    table.id(),
                );
                table.set_compaction_status(crate::CompactionStatus::Compacting);
            }

            inputs.push((input.level, input.tables.clone()));
        }

        log::debug!(
            "registering compaction #{id}, {:?} L{}=>L{}, {} tables",
            pc.kind,
            pc.start_level,
            pc.output_level,
            pc.input_tables().count(),
        );

        self.in_progress.insert(
            id,
            InProgress {
                kind: pc.kind,
                output_level: pc.output_level,
                bounds: pc.bounds.clone(),
                inputs,
            },
        );

        id
    }

    /// Unregisters a compaction, rolling its input statuses forward
    /// (success) or back (failure).
    ///
    /// Moved tables live on in the successor version, so a successful
    /// move resets them instead of retiring them.
    pub fn finish(&mut self, id: CompactionId, success: bool) {
        let Some(info) = self.in_progress.remove(&id) else {
            return;
        };

        let status = if success && info.kind != CompactionKind::Move {
            crate::CompactionStatus::Compacted
        } else {
            crate::CompactionStatus::NotCompacting
        };

        for (_, tables) in &info.inputs {
            for table in tables {
                table.set_compaction_status(status);

                if success {
                    table.unmark_for_compaction();
                }
            }
        }

        log::debug!("compaction #{id} finished, success={success}");
    }

    /// Returns the number of currently running compactions.
    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    /// Per-level byte adjustments reflecting in-flight compactions.
    ///
    /// Bytes leaving a level are subtracted there and credited to the
    /// output level, so level scores anticipate the pending version edit
    /// instead of repeatedly picking the same overfull level.
    pub(crate) fn size_adjust(&self, level_count: usize) -> Vec<i64> {
        let mut adjust = vec![0_i64; level_count];

        for info in self.in_progress.values() {
            for (level, tables) in &info.inputs {
                if *level == info.output_level {
                    continue;
                }

                let real: u64 = tables.iter().map(Table::file_size).sum();
                let compensated: u64 = tables.iter().map(Table::compensated_size).sum();

                if let Some(slot) = adjust.get_mut(*level) {
                    *slot -= i64::try_from(compensated).unwrap_or(i64::MAX);
                }
                if let Some(slot) = adjust.get_mut(info.output_level) {
                    *slot += i64::try_from(real).unwrap_or(i64::MAX);
                }
            }
        }

        adjust
    }

    /// Returns `true` if a running compaction outputs into the same key
    /// region of the same level.
    ///
    /// Two compactions may conflict without sharing input tables when
    /// their outputs would interleave in one run.
    pub(crate) fn conflicts_with_output(&self, output_level: usize, bounds: &KeyRange) -> bool {
        self.in_progress.values().any(|c| {
            c.output_level == output_level && c.bounds.overlaps_with_key_range(bounds)
        })
    }

    /// Returns `true` if a running compaction touches any of the given
    /// levels within `bounds`.
    pub(crate) fn conflicts_with(&self, levels: &[usize], bounds: &KeyRange) -> bool {
        self.in_progress.values().any(|c| {
            if !c.bounds.overlaps_with_key_range(bounds) {
                return false;
            }

            levels.contains(&c.output_level)
                || c.inputs.iter().any(|(level, _)| levels.contains(level))
        })
    }

    /// Queues a read-triggered compaction candidate.
    pub fn push_read_compaction(&mut self, rc: ReadCompaction) {
        self.read_queue.push_back(rc);
    }

    pub(crate) fn pop_read_compaction(&mut self) -> Option<ReadCompaction> {
        self.read_queue.pop_front()
    }

    /// Returns the number of queued read-triggered candidates.
    #[must_use]
    pub fn read_compaction_count(&self) -> usize {
        self.read_queue.len()
    }

    /// Stores deletion hints produced by a finished compaction.
    pub fn add_hints(&mut self, hints: Vec<DeletionHint>) {
        self.hints.extend(hints);
    }

    /// Returns the number of stored deletion hints.
    #[must_use]
    pub fn hint_count(&self) -> usize {
        self.hints.len()
    }

    /// Removes and returns all hints whose snapshot constraint is gone.
    ///
    /// Hints whose carrying table no longer exists are silently dropped;
    /// the deletion was itself compacted away or re-hinted deeper.
    pub(crate) fn take_resolved_hints(
        &mut self,
        version: &Version,
        snapshots: &[SeqNo],
    ) -> Vec<DeletionHint> {
        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();

        for hint in self.hints.drain(..) {
            if version.get_table(hint.tombstone_table).is_none() {
                continue;
            }

            if hint.is_resolved(snapshots) {
                resolved.push(hint);
            } else {
                unresolved.push(hint);
            }
        }

        self.hints = unresolved;
        resolved
    }

    /// Drops all hints overlapping `bounds`.
    ///
    /// Compactions that zero seqnos rewrite covered keys to seqno 0,
    /// which would make previously covered tables look deletable through
    /// stale hints.
    pub fn invalidate_hints(&mut self, bounds: &KeyRange) {
        self.hints.retain(|hint| {
            hint.end.as_ref() <= bounds.min().as_ref() || hint.start.as_ref() > bounds.max().as_ref()
        });
    }
}
