// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::picked::PickedCompaction;
use crate::{Config, Version};

/// Decides whether a picked compaction should be extended one level deeper
///
/// Compacting through multiple levels in one pass can reduce write
/// amplification when the intermediate level would soon be compacted
/// downwards anyway.
pub trait MultiLevelHeuristic {
    /// Returns either the original compaction or an extended variant of it.
    fn pick(&self, pc: PickedCompaction, config: &Config, version: &Version) -> PickedCompaction;

    /// Returns `true` if compactions starting in L0 may be extended.
    fn allow_l0(&self) -> bool;
}

/// Never extends a compaction
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMultiLevel;

impl MultiLevelHeuristic for NoMultiLevel {
    fn pick(&self, pc: PickedCompaction, _: &Config, _: &Version) -> PickedCompaction {
        pc
    }

    fn allow_l0(&self) -> bool {
        false
    }
}

/// Extends a compaction if doing so lowers its predicted write amplification
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteAmpHeuristic {
    /// Bias added to the single-level write amp before comparing
    ///
    /// Positive values make multi-level compactions more likely,
    /// negative values less likely.
    pub add_propensity: f64,

    /// Whether compactions starting in L0 may be extended
    pub allow_l0: bool,
}

impl MultiLevelHeuristic for WriteAmpHeuristic {
    fn pick(&self, pc: PickedCompaction, config: &Config, version: &Version) -> PickedCompaction {
        let mut multi = pc.clone();

        if !multi.setup_multi_level_candidate(config, version) {
            return pc;
        }

        if multi.predicted_write_amp() <= pc.predicted_write_amp() + self.add_propensity {
            log::trace!(
                "extending compaction to L{}, predicted write amp {:.2} <= {:.2}",
                multi.output_level,
                multi.predicted_write_amp(),
                pc.predicted_write_amp(),
            );
            multi
        } else {
            pc
        }
    }

    fn allow_l0(&self) -> bool {
        self.allow_l0
    }
}
