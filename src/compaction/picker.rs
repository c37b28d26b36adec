// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    multi_level::{MultiLevelHeuristic, WriteAmpHeuristic},
    picked::PickedCompaction,
    state::CompactionState,
    CompactionInput, CompactionKind,
};
use crate::{
    earliest_snapshot, version::Level, Config, HashSet, KeyRange, SeqNo, Table, Version,
};

/// Everything the picker consults besides the version itself
pub struct PickerEnv<'a> {
    /// Tuning knobs
    pub config: &'a Config,

    /// Shared compaction book-keeping, guarded by the caller's mutex
    pub state: &'a mut CompactionState,

    /// Ascending seqnos of open snapshots
    pub snapshots: &'a [SeqNo],
}

/// Result of a manual compaction request
pub enum ManualOutcome {
    /// A compaction covering the requested range
    Picked(PickedCompaction),

    /// The range holds no tables, nothing to compact
    NothingToDo,

    /// Blocked by a running compaction, try again once it finishes
    RetryLater,
}

#[derive(Clone, Copy, Debug)]
struct LevelScore {
    level: usize,
    ratio: f64,
    should_compact: bool,
}

/// Chooses the most urgent compaction for a version
///
/// Priority order: delete-only work from resolved deletion hints, then
/// score-based compactions over the most overfull level, then the
/// fallbacks (elision-only, read-triggered, rewrite). Every proposal is
/// checked against running compactions before it is returned; the
/// caller registers accepted proposals in the [`CompactionState`].
pub struct Picker {
    multi_level: Box<dyn MultiLevelHeuristic>,
}

impl Default for Picker {
    fn default() -> Self {
        Self::new(Box::new(WriteAmpHeuristic::default()))
    }
}

impl Picker {
    /// Creates a picker with the given multi-level policy.
    #[must_use]
    pub fn new(multi_level: Box<dyn MultiLevelHeuristic>) -> Self {
        Self { multi_level }
    }

    /// Proposes the next compaction, or `None` if nothing (urgent) to do.
    ///
    /// May return `None` despite eligible work: with compactions already
    /// running, new ones are only admitted while L0 read amplification
    /// or the compaction debt keep growing past per-compaction budgets.
    pub fn pick(&self, version: &Version, env: &mut PickerEnv) -> Option<PickedCompaction> {
        // Delete-only compactions free space without any I/O, so they
        // bypass admission control
        if let Some(pc) = Self::pick_delete_only(version, env) {
            return Some(pc);
        }

        let n = env.state.in_progress_count();

        if n > 0 {
            let l0_ok = version.l0_read_amp() >= n * env.config.l0_compaction_concurrency;

            let debt_ok = Self::estimated_compaction_debt(version, env.config)
                >= (n as u64) * env.config.compaction_debt_concurrency;

            if !l0_ok && !debt_ok {
                log::trace!("compaction not admitted, {n} already running");
                return None;
            }
        }

        let scores = Self::calculate_level_scores(version, env.config, env.state);

        for candidate in scores.iter().filter(|x| x.should_compact) {
            let pc = if candidate.level == 0 {
                self.pick_l0(version, env, candidate.ratio)
            } else {
                self.pick_scored_level(version, env, candidate.level, candidate.ratio)
            };

            if let Some(pc) = pc {
                return Some(pc);
            }
        }

        if let Some(pc) = Self::pick_elision_only(version, env) {
            return Some(pc);
        }

        if let Some(pc) = Self::pick_read_triggered(version, env) {
            return Some(pc);
        }

        Self::pick_rewrite(version, env)
    }

    /// Builds a compaction over the given key range of one level.
    pub fn pick_manual(
        &self,
        version: &Version,
        env: &mut PickerEnv,
        level: usize,
        bounds: &KeyRange,
    ) -> ManualOutcome {
        let Some(lvl) = version.level(level) else {
            return ManualOutcome::NothingToDo;
        };

        let tables: Vec<Table> = lvl.get_overlapping(bounds).cloned().collect();

        if tables.is_empty() {
            return ManualOutcome::NothingToDo;
        }

        if tables.iter().any(Table::is_compacting) {
            return ManualOutcome::RetryLater;
        }

        let output_level = if level == 0 {
            version.base_level_index()
        } else {
            (level + 1).min(version.last_level_index())
        };

        let Some(hull) = KeyRange::aggregate(tables.iter().map(|x| &x.key_range)) else {
            return ManualOutcome::NothingToDo;
        };

        let mut pc = PickedCompaction::from_seed(
            CompactionKind::Default,
            level,
            output_level,
            tables,
            hull,
        );

        if !pc.setup_inputs(env.config, version, 0) {
            return ManualOutcome::RetryLater;
        }

        if env.state.conflicts_with(&[level, output_level], &pc.bounds) {
            return ManualOutcome::RetryLater;
        }

        ManualOutcome::Picked(pc)
    }

    /// Estimates the bytes of compaction work needed to bring every
    /// level back under its target size.
    ///
    /// All of L0 is assumed to eventually reach the base level; excess
    /// bytes of each level flow down one level, being rewritten together
    /// with the data they merge into.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn estimated_compaction_debt(version: &Version, config: &Config) -> u64 {
        let base = version.base_level_index();
        let last = version.last_level_index();

        let mut bytes_added = version.level(0).map_or(0, Level::size) as f64;
        let mut level_size = version.level(base).map_or(0, Level::size) as f64;

        let mut debt = if bytes_added > 0.0 && level_size > 0.0 {
            bytes_added + level_size
        } else {
            0.0
        };

        for level in base..last {
            let target = config.level_target_size(level - base + 1).max(1) as f64;

            let estimated = level_size + bytes_added;
            bytes_added = 0.0;

            let next_size = version.level(level + 1).map_or(0, Level::size) as f64;

            if estimated > target {
                bytes_added = estimated - target;

                let merge_ratio = next_size / bytes_added;
                debt += bytes_added * (merge_ratio + 1.0);
            }

            level_size = next_size;
        }

        debt as u64
    }

    /// Scores all levels and sorts them by compaction urgency.
    ///
    /// Scores are size / target (L0: run count and file count based),
    /// adjusted for bytes already moving through running compactions.
    /// Each score is then divided by the next deeper level's
    /// uncompensated score, steering work toward levels whose successor
    /// has room; without this, a full last level would let upper levels
    /// pile up behind it.
    #[allow(clippy::cast_precision_loss)]
    fn calculate_level_scores(
        version: &Version,
        config: &Config,
        state: &CompactionState,
    ) -> Vec<LevelScore> {
        let adjust = state.size_adjust(version.level_count());
        let base = version.base_level_index();
        let last = version.last_level_index();

        // (level, compensated score, uncompensated score),
        // ordered shallow to deep
        let mut raw: Vec<(usize, f64, f64)> = Vec::new();

        let l0 = Self::l0_score(version, config);
        raw.push((0, l0, l0));

        for level in base..=last {
            let Some(lvl) = version.level(level) else {
                continue;
            };

            let target = config.level_target_size(level - base + 1).max(1) as f64;
            let adj = *adjust.get(level).unwrap_or(&0) as f64;

            let compensated = ((lvl.compensated_size() as f64) + adj).max(0.0) / target;
            let uncompensated = ((lvl.size() as f64) + adj).max(0.0) / target;

            raw.push((level, compensated, uncompensated));
        }

        let mut scores = Vec::with_capacity(raw.len());

        for (idx, &(level, compensated, _)) in raw.iter().enumerate() {
            // The bottom level has no output level to score against
            if level == last {
                continue;
            }

            let next_uncompensated = raw.get(idx + 1).map(|x| x.2);

            let ratio = match next_uncompensated {
                Some(next) if compensated >= 1.0 => compensated / next.max(0.01),
                _ => compensated,
            };

            scores.push(LevelScore {
                level,
                ratio,
                should_compact: ratio >= 1.0,
            });
        }

        scores.sort_by(|a, b| {
            b.should_compact
                .cmp(&a.should_compact)
                .then(b.ratio.total_cmp(&a.ratio))
        });

        scores
    }

    /// L0 is scored by structure, not by bytes: reads pay per run.
    #[allow(clippy::cast_precision_loss)]
    fn l0_score(version: &Version, config: &Config) -> f64 {
        let Some(l0) = version.level(0) else {
            return 0.0;
        };

        let mut runs = 0_usize;
        let mut files = 0_usize;

        for run in l0.iter() {
            let free = run.iter().filter(|x| !x.is_compacting()).count();

            if free > 0 {
                runs += 1;
            }
            files += free;
        }

        let depth_score = 2.0 * (runs as f64) / f64::from(config.l0_threshold);
        let file_score = (files as f64) / (config.l0_file_threshold.max(1) as f64);

        depth_score.max(file_score)
    }

    /// L0 compacts as a whole into the base level; when that is blocked,
    /// an intra-L0 compaction at least collapses runs to keep read
    /// amplification in check.
    fn pick_l0(
        &self,
        version: &Version,
        env: &mut PickerEnv,
        score: f64,
    ) -> Option<PickedCompaction> {
        let l0 = version.level(0)?;

        if l0.is_empty() {
            return None;
        }

        let base = version.base_level_index();

        if !l0.iter_tables().any(Table::is_compacting) {
            let tables: Vec<Table> = l0.iter_tables().cloned().collect();
            let bounds = KeyRange::aggregate(tables.iter().map(|x| &x.key_range))?;

            let mut pc = PickedCompaction::from_seed(
                CompactionKind::Default,
                0,
                base,
                tables,
                bounds,
            );
            pc.score = score;

            if pc.setup_inputs(env.config, version, 0)
                && !env.state.conflicts_with_output(base, &pc.bounds)
            {
                return Some(pc);
            }
        }

        // Intra-L0
        let free: Vec<Table> = l0
            .iter_tables()
            .filter(|x| !x.is_compacting())
            .cloned()
            .collect();

        if free.len() < env.config.intra_l0_min_tables {
            return None;
        }

        let bounds = KeyRange::aggregate(free.iter().map(|x| &x.key_range))?;

        if env.state.conflicts_with_output(0, &bounds) {
            return None;
        }

        let mut pc = PickedCompaction::from_seed(CompactionKind::Default, 0, 0, free, bounds);
        pc.score = score;

        if pc.setup_inputs(env.config, version, 0) {
            Some(pc)
        } else {
            None
        }
    }

    fn pick_scored_level(
        &self,
        version: &Version,
        env: &mut PickerEnv,
        level: usize,
        score: f64,
    ) -> Option<PickedCompaction> {
        let output_level = level + 1;

        let seed = Self::pick_seed_file(version, level, output_level, env.snapshots)?;

        let mut pc = PickedCompaction::from_seed(
            CompactionKind::Default,
            level,
            output_level,
            vec![seed.clone()],
            seed.key_range.clone(),
        );
        pc.score = score;

        if !pc.setup_inputs(env.config, version, 0) {
            return None;
        }

        if env.state.conflicts_with_output(output_level, &pc.bounds) {
            return None;
        }

        // Trivial move: no output overlap and not too much grandparent
        // overlap means re-linking beats rewriting
        let is_single_file = pc.input_tables().count() == 1;

        let grandparent_overlap: u64 = pc.grandparents.iter().map(Table::file_size).sum();

        if is_single_file && grandparent_overlap <= env.config.max_grandparent_overlap_bytes() {
            pc.kind = CompactionKind::Move;
            return Some(pc);
        }

        Some(pc.maybe_add_level(env.config, version, &*self.multi_level))
    }

    /// Picks the table whose merge is cheapest per byte it gets rid of.
    ///
    /// Cost is the output-level bytes the merge has to rewrite, relative
    /// to the table's compensated size. Shadowed-garbage compensation
    /// only counts once no snapshot pins the garbage and the merge
    /// actually reaches the bottom level.
    fn pick_seed_file(
        version: &Version,
        level: usize,
        output_level: usize,
        snapshots: &[SeqNo],
    ) -> Option<Table> {
        let run = version.level(level).and_then(Level::first_run)?;

        let out_run: &[Table] = version
            .level(output_level)
            .and_then(Level::first_run)
            .map_or(&[], |x| x);

        let earliest = earliest_snapshot(snapshots);
        let reaches_bottom = output_level == version.last_level_index();

        let mut best: Option<(&Table, u128)> = None;
        let mut out_idx = 0;

        for table in run.iter() {
            while out_run
                .get(out_idx)
                .is_some_and(|x| x.key_range.max() < table.key_range.min())
            {
                out_idx += 1;
            }

            let mut overlapping: u64 = 0;
            let mut idx = out_idx;

            while let Some(out) = out_run.get(idx) {
                if out.key_range.min() > table.key_range.max() {
                    break;
                }
                overlapping += out.file_size();
                idx += 1;
            }

            if table.is_compacting() {
                continue;
            }

            let weight = if reaches_bottom && table.largest_seqno < earliest {
                table.compensated_size()
            } else {
                table.file_size()
            };

            let cost = u128::from(overlapping) * 1024 / u128::from(weight.max(1));

            if best.as_ref().is_none_or(|(_, best_cost)| cost < *best_cost) {
                best = Some((table, cost));
            }
        }

        best.map(|(table, _)| table.clone())
    }

    /// Turns resolved deletion hints into a delete-only compaction.
    fn pick_delete_only(version: &Version, env: &mut PickerEnv) -> Option<PickedCompaction> {
        let hints = env.state.take_resolved_hints(version, env.snapshots);

        if hints.is_empty() {
            return None;
        }

        let mut per_level: Vec<(usize, Vec<Table>)> = Vec::new();
        let mut bounds: Option<KeyRange> = None;
        let mut seen = HashSet::default();

        for hint in &hints {
            for (level, table) in hint.deletable_tables(version, env.snapshots) {
                if !seen.insert(table.id()) {
                    continue;
                }

                match &mut bounds {
                    Some(b) => b.expand_with(&table.key_range),
                    None => bounds = Some(table.key_range.clone()),
                }

                if let Some((_, tables)) =
                    per_level.iter_mut().find(|(lvl, _)| *lvl == level)
                {
                    tables.push(table);
                } else {
                    per_level.push((level, vec![table]));
                }
            }
        }

        // Resolved hints are consumed either way; tables that escaped
        // (moved, compacting) will be covered by fresh hints if their
        // deletions survive another compaction
        let bounds = bounds?;

        per_level.sort_by_key(|(level, _)| *level);

        let start_level = per_level.first().map(|(level, _)| *level)?;
        let output_level = per_level.last().map(|(level, _)| *level)?;

        log::debug!(
            "delete-only compaction of {} tables from {} resolved hints",
            seen.len(),
            hints.len(),
        );

        Some(PickedCompaction {
            kind: CompactionKind::DeleteOnly,
            inputs: per_level
                .into_iter()
                .map(|(level, tables)| CompactionInput::new(level, tables))
                .collect(),
            start_level,
            output_level,
            bounds,
            grandparents: Vec::new(),
            score: 0.0,
        })
    }

    /// Picks a bottom-level table worth rewriting purely to shed its own
    /// dead weight.
    #[allow(clippy::cast_precision_loss)]
    fn pick_elision_only(version: &Version, env: &mut PickerEnv) -> Option<PickedCompaction> {
        let last = version.last_level_index();
        let level = version.level(last)?;

        let earliest = earliest_snapshot(env.snapshots);

        let mut best: Option<&Table> = None;

        for table in level.iter_tables() {
            // A snapshot below the table's newest key could still read
            // what the rewrite would drop
            if table.is_compacting() || table.largest_seqno >= earliest {
                continue;
            }

            let stats = &table.stats;

            let reclaimable = (stats.reclaimable_bytes() as f64)
                >= env.config.tombstone_reclaim_ratio * (table.file_size() as f64);

            let tombstone_heavy = stats.item_count > 0
                && (stats.tombstone_count as f64)
                    >= env.config.tombstone_reclaim_ratio * (stats.item_count as f64);

            if !reclaimable && !tombstone_heavy {
                continue;
            }

            // Oldest data first, so reclaim proceeds front to back
            if best.is_none_or(|b| table.largest_seqno < b.largest_seqno) {
                best = Some(table);
            }
        }

        let seed = best?;

        let mut pc = PickedCompaction::from_seed(
            CompactionKind::ElisionOnly,
            last,
            last,
            vec![seed.clone()],
            seed.key_range.clone(),
        );

        if !pc.setup_inputs(env.config, version, 0) {
            return None;
        }

        if env.state.conflicts_with_output(last, &pc.bounds) {
            return None;
        }

        Some(pc)
    }

    /// Drains the read-compaction queue until a still-valid entry is found.
    fn pick_read_triggered(version: &Version, env: &mut PickerEnv) -> Option<PickedCompaction> {
        while let Some(rc) = env.state.pop_read_compaction() {
            if rc.level >= version.last_level_index() {
                continue;
            }

            let Some(level) = version.level(rc.level) else {
                continue;
            };

            let tables: Vec<Table> = level.get_overlapping(&rc.key_range).cloned().collect();

            // The tree may have shifted under the queued entry
            if !tables.iter().any(|x| x.id() == rc.table_id) {
                continue;
            }

            if tables.iter().any(Table::is_compacting) {
                continue;
            }

            let output_level = rc.level + 1;

            let start_size: u64 = tables.iter().map(Table::file_size).sum();

            let output_size: u64 = version
                .level(output_level)
                .map(|lvl| lvl.get_overlapping(&rc.key_range).map(Table::file_size).sum())
                .unwrap_or(0);

            // Reads tolerate the overhead better than a lopsided merge
            if output_size > env.config.expanded_compaction_byte_size_limit()
                || output_size > 35 * start_size.max(1)
            {
                continue;
            }

            let Some(hull) = KeyRange::aggregate(tables.iter().map(|x| &x.key_range)) else {
                continue;
            };

            let mut pc = PickedCompaction::from_seed(
                CompactionKind::Default,
                rc.level,
                output_level,
                tables,
                hull,
            );

            if !pc.setup_inputs(env.config, version, 0) {
                continue;
            }

            if env.state.conflicts_with_output(output_level, &pc.bounds) {
                continue;
            }

            log::debug!(
                "read-triggered compaction of table {} in L{}",
                rc.table_id,
                rc.level,
            );

            return Some(pc);
        }

        None
    }

    /// Picks a table flagged for rewrite, deepest level first.
    fn pick_rewrite(version: &Version, env: &mut PickerEnv) -> Option<PickedCompaction> {
        for level_idx in (0..version.level_count()).rev() {
            let Some(level) = version.level(level_idx) else {
                continue;
            };

            for table in level.iter_tables() {
                if !table.is_marked_for_compaction() || table.is_compacting() {
                    continue;
                }

                let mut pc = PickedCompaction::from_seed(
                    CompactionKind::Rewrite,
                    level_idx,
                    level_idx,
                    vec![table.clone()],
                    table.key_range.clone(),
                );

                if !pc.setup_inputs(env.config, version, 0) {
                    continue;
                }

                if env.state.conflicts_with_output(level_idx, &pc.bounds) {
                    continue;
                }

                return Some(pc);
            }
        }

        None
    }
}
