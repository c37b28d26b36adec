// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{multi_level::MultiLevelHeuristic, CompactionInput, CompactionKind};
use crate::{version::Level, Config, KeyRange, Table, TableId, Version};

/// Grows a contiguous table selection `[lo, hi]` within a sorted run to
/// its atomic compaction unit.
///
/// Neighboring tables that share a boundary user key must be compacted
/// together; splitting them apart would leave two tables in one run
/// holding versions of the same user key.
///
/// Returns the expanded interval and whether any table in it is
/// currently compacting.
pub(crate) fn expand_to_atomic_unit(
    run: &[Table],
    mut lo: usize,
    mut hi: usize,
) -> (usize, usize, bool) {
    while lo > 0 {
        let (Some(prev), Some(cur)) = (run.get(lo - 1), run.get(lo)) else {
            break;
        };

        if prev.key_range.max() == cur.key_range.min() {
            lo -= 1;
        } else {
            break;
        }
    }

    while hi + 1 < run.len() {
        let (Some(cur), Some(next)) = (run.get(hi), run.get(hi + 1)) else {
            break;
        };

        if cur.key_range.max() == next.key_range.min() {
            hi += 1;
        } else {
            break;
        }
    }

    let is_compacting = run
        .get(lo..=hi)
        .unwrap_or_default()
        .iter()
        .any(Table::is_compacting);

    (lo, hi, is_compacting)
}

/// Finds the index interval a contiguous table selection occupies in its run.
fn locate(run: &[Table], tables: &[Table]) -> Option<(usize, usize)> {
    let first = tables.first()?;
    let lo = run.iter().position(|x| x.id == first.id)?;
    Some((lo, lo + tables.len() - 1))
}

/// A fully expanded compaction proposal
///
/// `inputs` is ordered from shallowest to deepest level; the first entry
/// is the start level, the last one the output level. Multi-level
/// compactions carry an intermediate entry in between.
#[derive(Clone, Debug)]
pub struct PickedCompaction {
    /// What the compaction does
    pub kind: CompactionKind,

    /// Consumed tables, one entry per level
    pub inputs: Vec<CompactionInput>,

    /// Level the compaction was seeded from
    pub start_level: usize,

    /// Level the outputs are written to
    pub output_level: usize,

    /// Convex hull over all input tables
    pub bounds: KeyRange,

    /// Tables of the level below the output level that overlap `bounds`,
    /// used to align output splits
    pub grandparents: Vec<Table>,

    /// The score (ratio) that triggered this pick, 0.0 for non-scored picks
    pub score: f64,
}

impl PickedCompaction {
    pub(crate) fn from_seed(
        kind: CompactionKind,
        start_level: usize,
        output_level: usize,
        tables: Vec<Table>,
        bounds: KeyRange,
    ) -> Self {
        let mut inputs = vec![CompactionInput::new(start_level, tables)];

        if output_level != start_level {
            inputs.push(CompactionInput::new(output_level, vec![]));
        }

        Self {
            kind,
            inputs,
            start_level,
            output_level,
            bounds,
            grandparents: Vec::new(),
            score: 0.0,
        }
    }

    /// Returns an iterator over all input tables, shallowest level first.
    pub fn input_tables(&self) -> impl Iterator<Item = &Table> {
        self.inputs.iter().flat_map(|x| x.tables.iter())
    }

    /// Returns the IDs of all input tables.
    pub fn input_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.input_tables().map(Table::id)
    }

    /// Returns the summed file size of all input tables.
    #[must_use]
    pub fn compaction_size(&self) -> u64 {
        self.inputs.iter().map(CompactionInput::size).sum()
    }

    /// Total input bytes divided by the bytes *above* the output level.
    ///
    /// A merge rewrites everything it reads, so this is the write
    /// amplification the compaction is predicted to incur per byte
    /// moving downwards.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn predicted_write_amp(&self) -> f64 {
        let mut total = 0;
        let mut higher_level_bytes = 0;

        for (idx, input) in self.inputs.iter().enumerate() {
            let size = input.size();
            total += size;

            if idx != self.inputs.len() - 1 {
                higher_level_bytes += size;
            }
        }

        total as f64 / higher_level_bytes as f64
    }

    /// Output-level bytes divided by the bytes above them.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn overlapping_ratio(&self) -> f64 {
        let mut higher_level_bytes = 0;
        let mut output_level_bytes = 0;

        for (idx, input) in self.inputs.iter().enumerate() {
            let size = input.size();

            if idx == self.inputs.len() - 1 {
                output_level_bytes += size;
            } else {
                higher_level_bytes += size;
            }
        }

        output_level_bytes as f64 / higher_level_bytes as f64
    }

    /// Expands the seed selection into a consistent input set.
    ///
    /// Expands the seed to its atomic unit, pulls in the overlapping
    /// output-level tables (atomic units again), recomputes the bounds,
    /// absorbs extra start-level tables via [`Self::grow`], and collects
    /// the grandparent overlap.
    ///
    /// Returns `false` if any required table is already compacting; the
    /// proposal must then be discarded.
    pub(crate) fn setup_inputs(
        &mut self,
        config: &Config,
        version: &Version,
        seed_idx: usize,
    ) -> bool {
        let Some(seed_level) = self.inputs.get(seed_idx).map(|x| x.level) else {
            return false;
        };

        // L0 seeds are already transitively closed by the picker and may
        // span multiple runs, so atomic unit expansion only applies to L1+
        if seed_level > 0 && self.inputs.get(seed_idx).is_some_and(|x| !x.tables.is_empty()) {
            let Some(run) = version.level(seed_level).and_then(Level::first_run) else {
                return false;
            };

            let located = self
                .inputs
                .get(seed_idx)
                .and_then(|seed| locate(run, &seed.tables));

            let Some((lo, hi)) = located else {
                return false;
            };

            let (lo, hi, is_compacting) = expand_to_atomic_unit(run, lo, hi);

            if is_compacting {
                return false;
            }

            let expanded = run.get(lo..=hi).unwrap_or_default().to_vec();

            if let Some(seed) = self.inputs.get_mut(seed_idx) {
                seed.tables = expanded;
            }
        }

        let Some(mut bounds) =
            KeyRange::aggregate(self.input_tables().map(|x| &x.key_range))
        else {
            return false;
        };

        let Some(out_level) = self.inputs.last().map(|x| x.level) else {
            return false;
        };

        if out_level != seed_level {
            let overlap: Vec<Table> = version
                .level(out_level)
                .map(|level| level.get_overlapping(&bounds).cloned().collect())
                .unwrap_or_default();

            let expanded = if overlap.is_empty() {
                overlap
            } else {
                let Some(run) = version.level(out_level).and_then(Level::first_run) else {
                    return false;
                };

                let Some((lo, hi)) = locate(run, &overlap) else {
                    return false;
                };

                let (lo, hi, is_compacting) = expand_to_atomic_unit(run, lo, hi);

                if is_compacting {
                    return false;
                }

                run.get(lo..=hi).unwrap_or_default().to_vec()
            };

            for table in &expanded {
                bounds.expand_with(&table.key_range);
            }

            if let Some(output) = self.inputs.last_mut() {
                output.tables = expanded;
            }
        }

        self.bounds = bounds;

        if seed_idx == 0 && seed_level > 0 && self.inputs.len() == 2 {
            self.grow(config, version);
        }

        self.set_grandparents(version);

        true
    }

    /// Tries to absorb additional start-level tables into the compaction.
    ///
    /// Growing is free as long as the set of overlapping output-level
    /// tables stays the same: the extra inputs would otherwise be
    /// rewritten against the very same output tables by a later
    /// compaction. Bails if the expanded set exceeds the byte cap or
    /// touches a compacting table.
    fn grow(&mut self, config: &Config, version: &Version) {
        let Some(output_tables) = self.inputs.last().map(|x| x.tables.clone()) else {
            return;
        };

        if output_tables.is_empty() {
            return;
        }

        let Some(start_len) = self.inputs.first().map(|x| x.tables.len()) else {
            return;
        };

        let Some(run) = version.level(self.start_level).and_then(Level::first_run) else {
            return;
        };

        let overlap = run.get_overlapping(&self.bounds);

        let Some((lo, hi)) = locate(run, overlap) else {
            return;
        };

        let (lo, hi, is_compacting) = expand_to_atomic_unit(run, lo, hi);

        if is_compacting {
            return;
        }

        let grown_start = run.get(lo..=hi).unwrap_or_default();

        if grown_start.len() <= start_len {
            return;
        }

        let grown_size: u64 = grown_start.iter().map(Table::file_size).sum();
        let output_size: u64 = output_tables.iter().map(Table::file_size).sum();

        if grown_size + output_size >= config.expanded_compaction_byte_size_limit() {
            return;
        }

        let Some(new_bounds) = KeyRange::aggregate(
            grown_start
                .iter()
                .chain(output_tables.iter())
                .map(|x| &x.key_range),
        ) else {
            return;
        };

        // The grown set must not drag in more output-level tables,
        // otherwise growing just made the compaction wider for free
        let Some(out_run) = version
            .level(self.output_level)
            .and_then(Level::first_run)
        else {
            return;
        };

        let out_overlap = out_run.get_overlapping(&new_bounds);

        let Some((olo, ohi)) = locate(out_run, out_overlap) else {
            return;
        };

        let (olo, ohi, is_compacting) = expand_to_atomic_unit(out_run, olo, ohi);

        if is_compacting {
            return;
        }

        let grown_output = out_run.get(olo..=ohi).unwrap_or_default();

        if grown_output.len() != output_tables.len() {
            return;
        }

        let grown_start = grown_start.to_vec();
        let grown_output = grown_output.to_vec();

        if let Some(start) = self.inputs.first_mut() {
            start.tables = grown_start;
        }
        if let Some(output) = self.inputs.last_mut() {
            output.tables = grown_output;
        }

        self.bounds = new_bounds;
    }

    fn set_grandparents(&mut self, version: &Version) {
        let gp_level = if self.output_level == 0 {
            version.base_level_index()
        } else {
            self.output_level + 1
        };

        self.grandparents = version
            .level(gp_level)
            .map(|level| level.get_overlapping(&self.bounds).cloned().collect())
            .unwrap_or_default();
    }

    /// Appends the level below the current output as an additional input.
    ///
    /// Returns `false` if that level does not exist, is empty over the
    /// compaction's bounds, or holds compacting tables.
    pub(crate) fn setup_multi_level_candidate(
        &mut self,
        config: &Config,
        version: &Version,
    ) -> bool {
        let next_level = self.output_level + 1;

        if next_level >= version.level_count() {
            return false;
        }

        self.inputs.push(CompactionInput::new(next_level, vec![]));
        self.output_level = next_level;

        let middle = self.inputs.len() - 2;

        if !self.setup_inputs(config, version, middle) {
            return false;
        }

        self.inputs.last().is_some_and(|x| !x.tables.is_empty())
    }

    /// Hands the compaction to the multi-level heuristic, which may
    /// extend it one level deeper.
    pub(crate) fn maybe_add_level(
        self,
        config: &Config,
        version: &Version,
        heuristic: &dyn MultiLevelHeuristic,
    ) -> Self {
        if self.output_level == version.last_level_index() {
            return self;
        }

        if self.start_level == 0 && !heuristic.allow_l0() {
            return self;
        }

        if self.compaction_size() > config.expanded_compaction_byte_size_limit() {
            return self;
        }

        heuristic.pick(self, config, version)
    }
}
