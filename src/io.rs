// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{merge::BoxedIterator, KeyRange, SeqNo, Span, Table, TableId};

/// Read access to table contents, provided by the host engine
///
/// The compaction executor never opens files itself; it pulls sorted
/// streams through this seam.
pub trait TableSource {
    /// Opens an iterator over the point keys of a table.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn point_iter(&self, table: &Table) -> crate::Result<BoxedIterator<'_>>;

    /// Returns the (possibly overlapping) deletion spans of a table.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn spans(&self, table: &Table) -> crate::Result<Vec<Span>>;
}

/// Metadata of a finished output table
#[derive(Clone, Debug)]
pub struct WriterMeta {
    /// ID assigned to the new table
    pub id: TableId,

    /// Size on disk in bytes
    pub file_size: u64,

    /// Key range of the written data, `None` if nothing was written
    pub key_range: Option<KeyRange>,

    /// Lowest written seqno
    pub smallest_seqno: SeqNo,

    /// Highest written seqno
    pub largest_seqno: SeqNo,

    /// Number of KV items written
    pub item_count: u64,

    /// Number of point tombstones written
    pub tombstone_count: u64,
}

/// A single output table in the making
pub trait TableWriter {
    /// Appends a KV item.
    ///
    /// Items arrive in ascending internal key order.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn write(&mut self, item: crate::InternalValue) -> crate::Result<()>;

    /// Appends a deletion span.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn write_span(&mut self, span: Span) -> crate::Result<()>;

    /// Returns the estimated file size so far.
    fn written_bytes(&self) -> u64;

    /// Finalizes the table and returns its metadata.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn finish(self: Box<Self>) -> crate::Result<WriterMeta>;

    /// Discards the table without finalizing it.
    ///
    /// Called when a compaction aborts while this table is still being
    /// written; outputs that were already finished are cleaned up
    /// through [`TableWriterFactory::remove`] instead.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn abort(self: Box<Self>) -> crate::Result<()>;
}

/// Creates and removes output tables
pub trait TableWriterFactory {
    /// Starts a new output table.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn create(&self) -> crate::Result<Box<dyn TableWriter>>;

    /// Removes a previously finished output again (cancellation cleanup).
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    fn remove(&self, id: TableId) -> crate::Result<()>;
}
