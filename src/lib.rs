// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compaction machinery for leveled LSM-trees.
//!
//! ##### NOTE
//!
//! > This crate does not read or write table files itself; it decides
//! > *what* to compact and drives the merge, while the host storage engine
//! > provides table iterators and writers through trait seams.
//!
//! ##### About
//!
//! An LSM-tree accumulates immutable, sorted table files across a hierarchy
//! of levels. Level 0 may contain overlapping runs; every deeper level is a
//! single sorted, disjoint run. Left alone, the tree degrades: reads touch
//! more and more files, and obsolete versions and tombstones pile up.
//!
//! Compaction counteracts that by merging tables downwards. This crate
//! implements the two halves of that process:
//!
//! - the **picker**, which scores levels, chooses seed files, expands them
//!   into a consistent input set and decides between merge, trivial move,
//!   and deletion-only work, while respecting concurrently running
//!   compactions,
//! - the **executor**, which merges the chosen inputs, collapses versions
//!   that no snapshot can see, elides tombstones that shadow nothing, and
//!   splits its output into well-sized files.
//!
//! Deletion hints, discovered while compacting range tombstones, let
//! whole tables be dropped later without rewriting a single byte.

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![expect(
    clippy::missing_const_for_fn,
    reason = "const-ness is not part of the API contract and breaks on refactors"
)]
#![warn(clippy::multiple_crate_versions)]
#![expect(clippy::option_if_let_else, reason = "harder to read")]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[doc(hidden)]
pub type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;

pub(crate) type HashSet<K> = std::collections::HashSet<K, rustc_hash::FxBuildHasher>;

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        }
    };
}

mod binary_search;

pub mod compaction;

/// Configuration
pub mod config;

mod error;
mod io;
mod key;
mod key_range;

#[doc(hidden)]
pub mod merge;

mod metrics;
mod seqno;
mod slice;
mod span;

#[doc(hidden)]
pub mod stop_signal;

mod table;
mod value;
mod version;

/// User defined key (byte array)
pub type UserKey = Slice;

/// User defined data (byte array)
pub type UserValue = Slice;

#[doc(hidden)]
pub use {
    key::InternalKey,
    merge::BoxedIterator,
    value::{InternalValue, ValueType},
};

pub use {
    compaction::{
        hints::DeletionHint,
        multi_level::{MultiLevelHeuristic, NoMultiLevel, WriteAmpHeuristic},
        picked::PickedCompaction,
        picker::{ManualOutcome, Picker, PickerEnv},
        state::{CompactionId, CompactionState, ReadCompaction},
        worker::{CompactionJob, CompactionOutcome},
        CompactionInput, CompactionKind,
    },
    config::Config,
    error::{Error, Result},
    io::{TableSource, TableWriter, TableWriterFactory, WriterMeta},
    key_range::KeyRange,
    metrics::Metrics,
    seqno::{earliest_snapshot, snapshot_index},
    slice::Slice,
    span::{Fragment, Span, SpanKind},
    stop_signal::StopSignal,
    table::{CompactionStatus, Table, TableId, TableMetadata, TableStats},
    value::SeqNo,
    version::{AddedTable, DeletedTable, Level, Ranged, Run, Version, VersionEdit, VersionId},
};
