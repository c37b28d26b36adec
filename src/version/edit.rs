// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Table, TableId};

/// A table added to a level
#[derive(Clone, Debug)]
pub struct AddedTable {
    /// Destination level
    pub level: usize,

    /// The new table
    pub table: Table,
}

/// A table removed from a level
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeletedTable {
    /// Level the table lived in
    pub level: usize,

    /// The removed table's ID
    pub id: TableId,
}

/// The outcome of a compaction, to be applied to a [`Version`](super::Version)
///
/// Deletions and additions happen atomically; a reader either sees
/// the old tables or the new ones, never both.
#[derive(Clone, Debug, Default)]
pub struct VersionEdit {
    /// Tables to add
    pub added: Vec<AddedTable>,

    /// Tables to remove
    pub deleted: Vec<DeletedTable>,
}

impl VersionEdit {
    pub(crate) fn add(&mut self, level: usize, table: Table) {
        self.added.push(AddedTable { level, table });
    }

    pub(crate) fn delete(&mut self, level: usize, id: TableId) {
        self.deleted.push(DeletedTable { level, id });
    }

    /// Returns `true` if the edit neither adds nor removes tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }

    /// IDs of all deleted tables.
    pub fn deleted_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.deleted.iter().map(|x| x.id)
    }
}
