// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Immutable, point-in-time views of the tree structure.

mod edit;
pub(crate) mod inuse;
mod optimize;
pub(crate) mod run;

pub use edit::{AddedTable, DeletedTable, VersionEdit};
pub use run::{Ranged, Run};

use crate::{HashSet, KeyRange, Table, TableId};
use optimize::optimize_runs;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

#[doc(hidden)]
pub const DEFAULT_LEVEL_COUNT: u8 = 7;

/// Monotonically increasing ID of a version.
pub type VersionId = u64;

struct LevelInner {
    runs: Vec<Arc<Run<Table>>>,

    // Memoized so all versions sharing this level node share the sum
    compensated_size: OnceLock<u64>,
}

/// One level of the tree, holding one or more disjoint runs
///
/// L0 may hold many runs (one per flush, its read amplification);
/// every deeper level holds at most one.
#[derive(Clone)]
pub struct Level(Arc<LevelInner>);

impl Level {
    /// Creates an empty level.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_runs(vec![])
    }

    /// Creates a level from runs.
    #[must_use]
    pub fn from_runs(runs: Vec<Arc<Run<Table>>>) -> Self {
        Self(Arc::new(LevelInner {
            runs,
            compensated_size: OnceLock::new(),
        }))
    }

    /// Returns the number of runs.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.0.runs.len()
    }

    /// Returns the number of tables over all runs.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.iter().map(|x| x.len()).sum()
    }

    /// Returns `true` if the level has no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.runs.is_empty()
    }

    /// Returns an iterator over the level's runs, newest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Run<Table>>> {
        self.0.runs.iter()
    }

    /// Returns an iterator over all tables in the level.
    pub fn iter_tables(&self) -> impl Iterator<Item = &Table> {
        self.iter().flat_map(|run| run.iter())
    }

    /// Returns the first (newest) run.
    #[must_use]
    pub fn first_run(&self) -> Option<&Arc<Run<Table>>> {
        self.0.runs.first()
    }

    /// Returns the on-disk size of the level.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.iter_tables().map(Table::file_size).sum()
    }

    /// Returns the compensated size of the level (size + shadowed garbage).
    #[must_use]
    pub fn compensated_size(&self) -> u64 {
        *self
            .0
            .compensated_size
            .get_or_init(|| self.iter_tables().map(Table::compensated_size).sum())
    }

    /// Returns the aggregate key range, or `None` for an empty level.
    #[must_use]
    pub fn aggregate_key_range(&self) -> Option<KeyRange> {
        let key_ranges = self
            .iter()
            .map(|x| Run::aggregate_key_range(x))
            .collect::<Vec<_>>();

        KeyRange::aggregate(key_ranges.iter())
    }

    /// Returns all tables overlapping the key range, over all runs.
    pub fn get_overlapping<'a>(&'a self, key_range: &'a KeyRange) -> impl Iterator<Item = &'a Table> {
        self.iter().flat_map(|x| x.get_overlapping(key_range))
    }

    pub(crate) fn list_ids(&self) -> HashSet<TableId> {
        self.iter_tables().map(Table::id).collect()
    }

    fn contains_any(&self, ids: &[TableId]) -> bool {
        self.iter_tables().any(|x| ids.contains(&x.id))
    }
}

struct VersionInner {
    id: VersionId,

    /// The individual LSM-tree levels which consist of runs of tables
    levels: Vec<Level>,
}

/// A version is an immutable, point-in-time view of a tree's structure
///
/// Any time a table is created or deleted, a new version is created.
#[derive(Clone)]
pub struct Version {
    inner: Arc<VersionInner>,
}

impl Version {
    /// Returns the version ID.
    #[must_use]
    pub fn id(&self) -> VersionId {
        self.inner.id
    }

    /// Creates a new empty version.
    #[must_use]
    pub fn new(id: VersionId) -> Self {
        let levels = (0..DEFAULT_LEVEL_COUNT).map(|_| Level::empty()).collect();

        Self {
            inner: Arc::new(VersionInner { id, levels }),
        }
    }

    /// Creates a new pre-populated version.
    ///
    /// # Panics
    ///
    /// Panics if `levels` is empty; a version always has at least L0.
    #[must_use]
    pub fn from_levels(id: VersionId, levels: Vec<Level>) -> Self {
        assert!(!levels.is_empty(), "version requires at least one level");

        Self {
            inner: Arc::new(VersionInner { id, levels }),
        }
    }

    /// Returns the number of levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.inner.levels.len()
    }

    /// Returns the index of the deepest level.
    #[must_use]
    pub fn last_level_index(&self) -> usize {
        self.level_count() - 1
    }

    /// Returns an iterator through all levels.
    pub fn iter_levels(&self) -> impl Iterator<Item = &Level> {
        self.inner.levels.iter()
    }

    /// Returns an iterator over all tables.
    pub fn iter_tables(&self) -> impl Iterator<Item = &Table> {
        self.iter_levels().flat_map(Level::iter_tables)
    }

    /// Returns the number of tables in all levels.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.iter_levels().map(Level::table_count).sum()
    }

    pub(crate) fn get_table(&self, id: TableId) -> Option<&Table> {
        self.iter_tables().find(|x| x.id == id)
    }

    /// Gets the n-th level.
    #[must_use]
    pub fn level(&self, n: usize) -> Option<&Level> {
        self.inner.levels.get(n)
    }

    /// Returns L0's run count (its read amplification).
    #[must_use]
    pub fn l0_read_amp(&self) -> usize {
        self.level(0).map_or(0, Level::run_count)
    }

    /// Returns the first non-empty level below L0, which L0 compacts into.
    ///
    /// Defaults to the deepest level for an otherwise empty tree.
    #[must_use]
    pub fn base_level_index(&self) -> usize {
        (1..self.level_count())
            .find(|&idx| self.level(idx).is_some_and(|x| !x.is_empty()))
            .unwrap_or_else(|| self.last_level_index())
    }

    /// Creates a new version with the additional run added to the "top" of L0.
    #[must_use]
    pub fn with_new_l0_run(&self, run: &[Table]) -> Self {
        let id = self.inner.id + 1;

        let mut levels = vec![];

        // Copy-on-write the first level with new run at top
        levels.push({
            // NOTE: We always have at least one level
            #[allow(clippy::expect_used)]
            let l0 = self.level(0).expect("L0 should always exist");

            let prev_runs = l0
                .iter()
                .map(|run| {
                    let run: Run<Table> = run.deref().clone();
                    run
                })
                .collect::<Vec<_>>();

            let mut runs = Vec::with_capacity(prev_runs.len() + 1);
            runs.push(Run::new(run.to_vec()));
            runs.extend(prev_runs);

            let runs = optimize_runs(runs);

            Level::from_runs(runs.into_iter().map(Arc::new).collect())
        });

        levels.extend(self.iter_levels().skip(1).cloned());

        Self {
            inner: Arc::new(VersionInner { id, levels }),
        }
    }

    /// Returns a new version with a list of tables removed.
    ///
    /// The table files are not immediately deleted; that is the job
    /// of the host engine's free list.
    #[must_use]
    pub fn with_dropped(&self, ids: &[TableId]) -> Self {
        let id = self.inner.id + 1;

        let levels = self
            .iter_levels()
            .map(|level| {
                if !level.contains_any(ids) {
                    return level.clone();
                }

                let runs = level
                    .iter()
                    .map(|run| {
                        let mut run: Run<Table> = run.deref().clone();
                        run.retain(|x| !ids.contains(&x.id));
                        run
                    })
                    .filter(|x| !x.is_empty())
                    .collect::<Vec<_>>();

                let runs = optimize_runs(runs);

                Level::from_runs(runs.into_iter().map(Arc::new).collect())
            })
            .collect();

        Self {
            inner: Arc::new(VersionInner { id, levels }),
        }
    }

    /// Returns a new version with `old_ids` replaced by `new_tables` in `dest_level`.
    #[must_use]
    pub fn with_merge(&self, old_ids: &[TableId], new_tables: &[Table], dest_level: usize) -> Self {
        let id = self.inner.id + 1;

        let levels = self
            .iter_levels()
            .enumerate()
            .map(|(level_idx, level)| {
                let is_dest = level_idx == dest_level && !new_tables.is_empty();

                if !is_dest && !level.contains_any(old_ids) {
                    return level.clone();
                }

                let mut runs = level
                    .iter()
                    .map(|run| {
                        let mut run: Run<Table> = run.deref().clone();
                        run.retain(|x| !old_ids.contains(&x.id));
                        run
                    })
                    .filter(|x| !x.is_empty())
                    .collect::<Vec<_>>();

                if is_dest {
                    runs.insert(0, Run::new(new_tables.to_vec()));
                }

                let runs = optimize_runs(runs);

                Level::from_runs(runs.into_iter().map(Arc::new).collect())
            })
            .collect();

        Self {
            inner: Arc::new(VersionInner { id, levels }),
        }
    }

    /// Returns a new version with the given tables relinked into `dest_level`.
    ///
    /// # Panics
    ///
    /// Panics if any ID does not resolve to a live table.
    #[must_use]
    pub fn with_moved(&self, ids: &[TableId], dest_level: usize) -> Self {
        let moved = self
            .iter_tables()
            .filter(|x| ids.contains(&x.id))
            .cloned()
            .collect::<Vec<_>>();

        assert_eq!(moved.len(), ids.len(), "invalid table IDs");

        let id = self.inner.id + 1;

        let levels = self
            .iter_levels()
            .enumerate()
            .map(|(level_idx, level)| {
                let is_dest = level_idx == dest_level;

                if !is_dest && !level.contains_any(ids) {
                    return level.clone();
                }

                let mut runs = level
                    .iter()
                    .map(|run| {
                        let mut run: Run<Table> = run.deref().clone();
                        run.retain(|x| !ids.contains(&x.id));
                        run
                    })
                    .filter(|x| !x.is_empty())
                    .collect::<Vec<_>>();

                if is_dest {
                    let mut sorted = moved.clone();
                    sorted.sort_by(|a, b| a.key_range.min().cmp(b.key_range.min()));
                    runs.insert(0, Run::new(sorted));
                }

                let runs = optimize_runs(runs);

                Level::from_runs(runs.into_iter().map(Arc::new).collect())
            })
            .collect();

        Self {
            inner: Arc::new(VersionInner { id, levels }),
        }
    }

    /// Applies a [`VersionEdit`], returning the successor version.
    #[must_use]
    pub fn with_edit(&self, edit: &VersionEdit) -> Self {
        let deleted_ids = edit.deleted_ids().collect::<Vec<_>>();

        let mut next = self.with_dropped(&deleted_ids);

        // Group additions per level, then splice each group in as a new run
        let mut by_level: Vec<(usize, Vec<Table>)> = Vec::new();

        for added in &edit.added {
            if let Some((_, tables)) = by_level.iter_mut().find(|(lvl, _)| *lvl == added.level) {
                tables.push(added.table.clone());
            } else {
                by_level.push((added.level, vec![added.table.clone()]));
            }
        }

        for (level, mut tables) in by_level {
            tables.sort_by(|a, b| a.key_range.min().cmp(b.key_range.min()));
            next = next.with_merge(&[], &tables, level);
        }

        Self {
            inner: Arc::new(VersionInner {
                id: self.inner.id + 1,
                levels: next.inner.levels.clone(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::table::TableMetadata;
    use test_log::test;

    fn t(id: TableId, min: &str, max: &str, size: u64) -> Table {
        TableMetadata::new(
            id,
            KeyRange::new((min.as_bytes().into(), max.as_bytes().into())),
            size,
            (0, 0),
        )
        .into()
    }

    fn version_with(levels: &[&[Table]]) -> Version {
        let mut v = Vec::new();

        for tables in levels {
            if tables.is_empty() {
                v.push(Level::empty());
            } else {
                let mut tables = tables.to_vec();
                tables.sort_by(|a, b| a.key_range.min().cmp(b.key_range.min()));
                v.push(Level::from_runs(vec![Arc::new(Run::new(tables))]));
            }
        }

        Version::from_levels(0, v)
    }

    #[test]
    #[should_panic(expected = "version requires at least one level")]
    fn version_needs_a_level() {
        let _ = Version::from_levels(0, vec![]);
    }

    #[test]
    fn version_base_level() {
        let version = version_with(&[
            &[t(1, "a", "c", 100)],
            &[],
            &[t(2, "a", "z", 100)],
            &[],
        ]);

        assert_eq!(2, version.base_level_index());

        let empty = version_with(&[&[], &[], &[]]);
        assert_eq!(2, empty.base_level_index());
    }

    #[test]
    fn version_l0_read_amp() {
        let version = Version::new(0)
            .with_new_l0_run(&[t(1, "a", "c", 100)])
            .with_new_l0_run(&[t(2, "b", "d", 100)]);

        assert_eq!(2, version.l0_read_amp());

        // Disjoint runs collapse into one
        let version = Version::new(0)
            .with_new_l0_run(&[t(1, "a", "c", 100)])
            .with_new_l0_run(&[t(2, "x", "z", 100)]);

        assert_eq!(1, version.l0_read_amp());
    }

    #[test]
    fn version_with_merge() {
        let version = version_with(&[
            &[t(1, "a", "c", 100), t(2, "d", "f", 100)],
            &[t(3, "a", "z", 500)],
        ]);

        let next = version.with_merge(&[1, 3], &[t(4, "a", "m", 300), t(5, "n", "z", 250)], 1);

        assert_eq!(1, next.level(0).unwrap().table_count());
        assert_eq!(2, next.level(1).unwrap().table_count());
        assert!(next.get_table(1).is_none());
        assert!(next.get_table(3).is_none());
        assert!(next.get_table(4).is_some());

        // Source version is untouched
        assert!(version.get_table(1).is_some());
    }

    #[test]
    fn version_with_moved() {
        let version = version_with(&[&[t(1, "a", "c", 100)], &[]]);

        let next = version.with_moved(&[1], 1);

        assert_eq!(0, next.level(0).unwrap().table_count());
        assert_eq!(1, next.level(1).unwrap().table_count());
    }

    #[test]
    fn version_with_dropped() {
        let version = version_with(&[&[], &[t(1, "a", "c", 100), t(2, "d", "f", 100)]]);

        let next = version.with_dropped(&[2]);

        assert_eq!(1, next.table_count());
        assert!(next.get_table(2).is_none());
    }

    #[test]
    fn version_unchanged_levels_are_shared() {
        let version = version_with(&[&[t(1, "a", "c", 100)], &[t(2, "a", "z", 100)]]);

        let next = version.with_dropped(&[1]);

        let untouched_old = version.level(1).unwrap();
        let untouched_new = next.level(1).unwrap();

        assert!(Arc::ptr_eq(&untouched_old.0, &untouched_new.0));
    }

    #[test]
    fn version_level_compensated_size() {
        use crate::table::TableStats;

        let table: Table = TableMetadata::new(
            1,
            KeyRange::new((b"a".into(), b"z".into())),
            1_000,
            (0, 0),
        )
        .with_stats(TableStats {
            point_del_bytes_estimate: 500,
            ..Default::default()
        })
        .into();

        let level = Level::from_runs(vec![Arc::new(Run::new(vec![table]))]);

        assert_eq!(1_000, level.size());
        assert_eq!(1_500, level.compensated_size());
        assert_eq!(1_500, level.compensated_size());
    }
}
