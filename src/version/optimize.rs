// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::run::{Ranged, Run};

/// Greedily packs tables into as few disjoint runs as possible.
///
/// Keeps relative order between overlapping tables, so newer runs
/// stay above older ones.
pub fn optimize_runs<T: Clone + Ranged>(runs: Vec<Run<T>>) -> Vec<Run<T>> {
    if runs.len() <= 1 {
        runs
    } else {
        let mut new_runs: Vec<Run<T>> = Vec::new();

        for run in runs.iter().rev() {
            'run: for table in run.iter().rev() {
                for existing_run in new_runs.iter_mut().rev() {
                    if existing_run
                        .iter()
                        .all(|x| !table.key_range().overlaps_with_key_range(x.key_range()))
                    {
                        existing_run.push(table.clone());
                        continue 'run;
                    }
                }

                new_runs.insert(0, Run::new(vec![table.clone()]));
            }
        }

        new_runs
    }
}
