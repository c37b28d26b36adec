// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Compaction configuration
///
/// Tuning knobs for picking and executing compactions.
#[derive(Clone, Debug)]
pub struct Config {
    /// The target table size on disk (possibly compressed).
    pub target_table_size: u64,

    /// Number of levels of the LSM tree (depth of tree)
    pub level_count: u8,

    /// Size ratio between levels of the LSM tree (a.k.a. fanout, growth rate)
    pub level_ratio: f64,

    /// L0 run count that makes L0 score 1.0
    pub l0_threshold: u8,

    /// L0 file count that makes L0 score 1.0
    pub l0_file_threshold: usize,

    /// Minimum number of L0 tables for an intra-L0 compaction
    pub intra_l0_min_tables: usize,

    /// How many multiples of the target table size a compaction
    /// may grow to when absorbing extra start-level tables
    pub expansion_factor: u64,

    /// How many multiples of the target table size an output table
    /// may overlap in the grandparent level
    pub grandparent_overlap_factor: u64,

    /// L0 read amplification allowed per in-progress compaction
    /// before another one is admitted
    pub l0_compaction_concurrency: usize,

    /// Compaction debt (bytes) allowed per in-progress compaction
    /// before another one is admitted
    pub compaction_debt_concurrency: u64,

    /// Upper bound on compactions running at the same time
    pub max_concurrent_compactions: usize,

    /// Fraction of a table's size that must be reclaimable garbage
    /// for an elision-only rewrite to be worthwhile (0.0 - 1.0)
    pub tombstone_reclaim_ratio: f64,

    /// Free disk space, used to cap compaction expansion
    ///
    /// 0 disables the cap.
    pub available_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_table_size: /* 64 MiB */ 64 * 1_024 * 1_024,
            level_count: 7,
            level_ratio: 10.0,
            l0_threshold: 4,
            l0_file_threshold: 500,
            intra_l0_min_tables: 4,
            expansion_factor: 25,
            grandparent_overlap_factor: 10,
            l0_compaction_concurrency: 10,
            compaction_debt_concurrency: 1_024 * 1_024 * 1_024,
            max_concurrent_compactions: 1,
            tombstone_reclaim_ratio: 0.1,
            available_bytes: 0,
        }
    }
}

impl Config {
    /// Sets the table target size on disk (possibly compressed).
    ///
    /// Same as `target_file_size_base` in `RocksDB`.
    ///
    /// Default = 64 MiB
    #[must_use]
    pub fn with_target_table_size(mut self, bytes: u64) -> Self {
        self.target_table_size = bytes;
        self
    }

    /// Sets the growth ratio between levels.
    ///
    /// Same as `max_bytes_for_level_multiplier` in `RocksDB`.
    ///
    /// Default = 10.0
    #[must_use]
    pub fn with_level_ratio(mut self, ratio: f64) -> Self {
        self.level_ratio = ratio;
        self
    }

    /// Sets the L0 threshold.
    ///
    /// When the number of runs in L0 reaches this threshold,
    /// they are merged into the base level.
    ///
    /// Same as `level0_file_num_compaction_trigger` in `RocksDB`.
    ///
    /// Default = 4
    #[must_use]
    pub fn with_l0_threshold(mut self, threshold: u8) -> Self {
        self.l0_threshold = threshold;
        self
    }

    /// Sets the number of concurrent compactions allowed.
    ///
    /// Default = 1
    #[must_use]
    pub fn with_max_concurrent_compactions(mut self, n: usize) -> Self {
        self.max_concurrent_compactions = n.max(1);
        self
    }

    /// Returns the target byte size of `level` (1-based depth below L0).
    ///
    /// The base level targets `target_table_size * l0_threshold` bytes;
    /// every level below that is `level_ratio` times larger.
    #[must_use]
    pub fn level_target_size(&self, level: usize) -> u64 {
        debug_assert!(level >= 1, "L0 has no target size");

        let base_size = self.target_table_size * u64::from(self.l0_threshold);

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss,
            clippy::cast_sign_loss
        )]
        {
            (base_size as f64 * self.level_ratio.powi(level as i32 - 1)) as u64
        }
    }

    /// Returns the byte cap for compaction expansion ("grow").
    #[must_use]
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        let limit = self.expansion_factor * self.target_table_size;

        if self.available_bytes == 0 {
            return limit;
        }

        // Never expand past half the free space, shared across workers
        let disk_cap = self.available_bytes / 2 / self.max_concurrent_compactions.max(1) as u64;

        limit.min(disk_cap)
    }

    /// Returns the max grandparent overlap allowed per output table.
    #[must_use]
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        self.grandparent_overlap_factor * self.target_table_size
    }
}
