// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    hints::DeletionHint,
    picked::PickedCompaction,
    splitter::{GrandparentLimiter, SizeSplitter, SplitKeySplitter, Splitter, SplitterChain},
    stream::CompactionStream,
    CompactionKind,
};
use crate::{
    merge::{BoxedIterator, Merger},
    seqno::snapshot_index,
    span::{fragment, Fragment},
    table::{TableMetadata, TableStats},
    version::inuse::InUseKeyRanges,
    Config, Error, InternalValue, KeyRange, Metrics, SeqNo, Span, SpanKind, StopSignal,
    TableSource, TableWriter, TableWriterFactory, UserKey, Version, VersionEdit, WriterMeta,
};

/// What a finished compaction hands back to the caller
#[derive(Debug)]
pub struct CompactionOutcome {
    /// The version edit to install atomically
    pub edit: VersionEdit,

    /// Deletion hints discovered along the way, to be stored in the
    /// compaction state
    pub hints: Vec<DeletionHint>,

    /// Bytes written into output tables (0 for moves and deletions)
    pub bytes_written: u64,

    /// Whether seqnos were rewritten to 0
    ///
    /// The caller must invalidate deletion hints overlapping the
    /// compaction bounds, since they may rely on the old seqnos.
    pub zeroed_seqnos: bool,
}

/// An output table in the making
struct OpenOutput {
    writer: Box<dyn TableWriter>,

    /// First point key or deletion start handed to the writer
    first_key: UserKey,

    /// Upper bound of everything handed to the writer
    max_key: UserKey,

    first_point: Option<UserKey>,
    last_point: Option<UserKey>,
}

/// Accumulated results of a merge pass
#[derive(Default)]
struct OutputSet {
    finished: Vec<WriterMeta>,

    /// Key range per finished output, same order
    ///
    /// Tracked here instead of trusting [`WriterMeta`]: deletion span
    /// ends are exclusive, which the writer's reported range cannot
    /// express.
    ranges: Vec<KeyRange>,

    /// Surviving deletion pieces and the output slot carrying them
    attachments: Vec<(Fragment, usize)>,

    /// Largest key contained in the previous output
    prev_max: Option<UserKey>,
}

/// Executes one picked compaction
///
/// Merge compactions pull the inputs through the [`TableSource`] seam,
/// collapse obsolete versions per snapshot stripe, and write size-split
/// outputs through the [`TableWriterFactory`] seam. Moves and
/// delete-only compactions bypass all I/O and emit a bare version edit.
///
/// The job does no locking; the caller installs the resulting edit and
/// unregisters the compaction inside its own critical section.
pub struct CompactionJob<'a> {
    /// The proposal to execute
    pub picked: PickedCompaction,

    /// The version the proposal was picked from
    pub version: &'a Version,

    /// Compaction configuration
    pub config: &'a Config,

    /// Read seam
    pub source: &'a dyn TableSource,

    /// Write seam
    pub factory: &'a dyn TableWriterFactory,

    /// Ascending seqnos of open snapshots
    pub snapshots: &'a [SeqNo],

    /// Cooperative cancellation, polled at output boundaries
    pub stop: StopSignal,

    /// Compaction counters
    pub metrics: &'a Metrics,

    /// Precomputed split keys, only used by flushes
    pub flush_split_keys: Vec<UserKey>,
}

impl CompactionJob<'_> {
    /// Runs the compaction to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the stop signal fired; partial
    /// outputs have been removed and the work can be re-picked.
    /// I/O errors abort the compaction the same way.
    pub fn run(self) -> crate::Result<CompactionOutcome> {
        if self.stop.is_stopped() {
            return Err(Error::Cancelled);
        }

        match self.picked.kind {
            CompactionKind::Move => Ok(self.run_move()),
            CompactionKind::DeleteOnly => Ok(self.run_delete_only()),
            _ => self.run_merge(),
        }
    }

    /// Re-links the input tables into the output level, no I/O at all.
    fn run_move(&self) -> CompactionOutcome {
        let mut edit = VersionEdit::default();
        let mut moved_bytes = 0;

        for input in &self.picked.inputs {
            for table in &input.tables {
                log::debug!(
                    "moving table {} from L{} to L{}",
                    table.id(),
                    input.level,
                    self.picked.output_level,
                );

                edit.delete(input.level, table.id());
                edit.add(self.picked.output_level, table.clone());

                moved_bytes += table.file_size();

                self.metrics.remove_tables(input.level, 1);
                self.metrics.add_tables(self.picked.output_level, 1);
            }
        }

        self.metrics
            .add_moved_bytes(self.picked.output_level, moved_bytes);

        CompactionOutcome {
            edit,
            hints: Vec::new(),
            bytes_written: 0,
            zeroed_seqnos: false,
        }
    }

    /// Drops the input tables outright, without reading a single byte.
    fn run_delete_only(&self) -> CompactionOutcome {
        let mut edit = VersionEdit::default();

        for input in &self.picked.inputs {
            for table in &input.tables {
                log::debug!(
                    "dropping fully shadowed table {} in L{}",
                    table.id(),
                    input.level,
                );

                edit.delete(input.level, table.id());
                self.metrics.remove_tables(input.level, 1);
            }
        }

        CompactionOutcome {
            edit,
            hints: Vec::new(),
            bytes_written: 0,
            zeroed_seqnos: false,
        }
    }

    fn run_merge(&self) -> crate::Result<CompactionOutcome> {
        let table_count = self.picked.input_tables().count();

        log::debug!(
            "merging {table_count} tables, {:?} L{}=>L{}",
            self.picked.kind,
            self.picked.start_level,
            self.picked.output_level,
        );

        let mut iters: Vec<BoxedIterator<'_>> = Vec::with_capacity(table_count);
        let mut spans: Vec<Span> = Vec::new();

        for table in self.picked.input_tables() {
            iters.push(self.source.point_iter(table)?);
            spans.extend(self.source.spans(table)?);
        }

        let fragments = fragment(&spans);

        // Key ranges of tables deeper than the output level; anything a
        // deletion covers there must keep being shadowed
        let in_use = InUseKeyRanges::calculate(
            self.version,
            self.picked.output_level + 1,
            &self.picked.bounds,
        );

        // Flushed data shadows sibling flushables the in-use ranges know
        // nothing about, so flushes keep every deletion
        let elide = self.picked.kind != CompactionKind::Flush;
        let zero_seqnos = elide && in_use.is_empty();

        let mut span_in_use = in_use.clone();

        let survivors: Vec<Fragment> = fragments
            .iter()
            .filter(|frag| {
                let covers_deeper_data = span_in_use.overlaps_range(&frag.start, &frag.end);

                // A snapshot below the deletion still sees covered input
                // data that outlives this merge in an older stripe
                let pinned = snapshot_index(frag.smallest_seqno, self.snapshots) > 0;

                !elide || covers_deeper_data || pinned
            })
            .cloned()
            .collect();

        let mut stream = CompactionStream::new(Merger::new(iters), self.snapshots)
            .with_fragments(fragments)
            .zero_seqnos(zero_seqnos);

        if elide {
            stream = stream.with_tombstone_elision(in_use);
        }

        let mut splitters: Vec<Splitter> = vec![
            SizeSplitter::new(self.config.target_table_size, &self.picked.grandparents).into(),
            GrandparentLimiter::new(
                self.config.max_grandparent_overlap_bytes(),
                self.picked.grandparents.clone(),
            )
            .into(),
        ];

        if !self.flush_split_keys.is_empty() {
            splitters.push(SplitKeySplitter::new(self.flush_split_keys.clone()).into());
        }

        let mut chain = SplitterChain::new(splitters);

        let mut outputs = OutputSet::default();

        if let Err(e) = self.merge_loop(stream, &mut chain, &survivors, &mut outputs) {
            self.remove_outputs(&outputs.finished);
            return Err(e);
        }

        if self.stop.is_stopped() {
            self.remove_outputs(&outputs.finished);
            return Err(Error::Cancelled);
        }

        let mut edit = VersionEdit::default();

        for input in &self.picked.inputs {
            for table in &input.tables {
                edit.delete(input.level, table.id());
            }
            self.metrics
                .remove_tables(input.level, input.tables.len() as u64);
        }

        let mut bytes_written = 0;

        for (meta, range) in outputs.finished.iter().zip(&outputs.ranges) {
            bytes_written += meta.file_size;

            let table = TableMetadata::new(
                meta.id,
                range.clone(),
                meta.file_size,
                (meta.smallest_seqno, meta.largest_seqno),
            )
            .with_stats(TableStats {
                item_count: meta.item_count,
                tombstone_count: meta.tombstone_count,
                ..TableStats::default()
            });

            edit.add(self.picked.output_level, table.into());
        }

        self.metrics
            .add_compacted_bytes(self.picked.output_level, bytes_written);
        self.metrics
            .add_tables(self.picked.output_level, outputs.finished.len() as u64);

        let mut hints = Vec::new();

        for (frag, slot) in &outputs.attachments {
            let Some(meta) = outputs.finished.get(*slot) else {
                continue;
            };

            if let Some(hint) = self.hint_for_fragment(frag, meta.id) {
                hints.push(hint);
            }
        }

        log::debug!(
            "compaction done, {} outputs, {bytes_written} bytes written, {} hints",
            outputs.finished.len(),
            hints.len(),
        );

        Ok(CompactionOutcome {
            edit,
            hints,
            bytes_written,
            zeroed_seqnos: zero_seqnos,
        })
    }

    /// The inner merge pass; finished outputs accumulate in `out` so
    /// the caller can clean them up on error, and the output that is
    /// still open when an error strikes is discarded here.
    fn merge_loop<I: Iterator<Item = crate::Result<InternalValue>>>(
        &self,
        stream: CompactionStream<'_, I>,
        chain: &mut SplitterChain,
        survivors: &[Fragment],
        out: &mut OutputSet,
    ) -> crate::Result<()> {
        let mut open: Option<OpenOutput> = None;

        let result = self.merge_inner(stream, chain, survivors, &mut open, out);

        if result.is_err() {
            if let Some(o) = open.take() {
                if let Err(e) = o.writer.abort() {
                    log::warn!("failed to discard open compaction output: {e}");
                }
            }
        }

        result
    }

    fn merge_inner<I: Iterator<Item = crate::Result<InternalValue>>>(
        &self,
        stream: CompactionStream<'_, I>,
        chain: &mut SplitterChain,
        survivors: &[Fragment],
        open: &mut Option<OpenOutput>,
        out: &mut OutputSet,
    ) -> crate::Result<()> {
        let mut active: Vec<Fragment> = Vec::new();
        let mut span_idx = 0;

        for item in stream {
            let item = item?;
            let user_key = item.key.user_key.clone();

            let at_boundary = open
                .as_ref()
                .is_none_or(|o| o.last_point.as_ref() != Some(&user_key));

            let written = open.as_ref().map_or(0, |o| o.writer.written_bytes());

            // Splitters track the key stream even while no split is
            // possible, so always consult them
            let wants_split = chain.should_split_before(&user_key, written);

            if at_boundary && wants_split {
                if let Some(o) = open.take() {
                    // Pending deletions are clipped just past the last
                    // written key; their remainder carries over into the
                    // next output
                    let cut = o.last_point.as_ref().map(|k| key_successor(k));
                    self.close_output(o, cut, &mut active, out)?;
                }
            }

            if open.is_none() {
                if self.stop.is_stopped() {
                    return Err(Error::Cancelled);
                }

                chain.on_new_output(&user_key);

                *open = Some(OpenOutput {
                    writer: self.factory.create()?,
                    first_key: user_key.clone(),
                    max_key: user_key.clone(),
                    first_point: None,
                    last_point: None,
                });
            }

            let Some(o) = open.as_mut() else {
                continue;
            };

            // Surviving deletions start traveling with the output that
            // is current when the stream passes their start key
            while let Some(frag) = survivors.get(span_idx) {
                if frag.start > user_key {
                    break;
                }

                active.push(frag.clone());
                span_idx += 1;
            }

            if o.first_point.is_none() {
                o.first_point = Some(user_key.clone());
            }
            if user_key > o.max_key {
                o.max_key = user_key.clone();
            }
            o.last_point = Some(user_key);

            o.writer.write(item)?;
        }

        // Deletions past the last point key still need a home
        active.extend(
            survivors
                .get(span_idx..)
                .unwrap_or_default()
                .iter()
                .cloned(),
        );

        if open.is_none() && !active.is_empty() {
            if self.stop.is_stopped() {
                return Err(Error::Cancelled);
            }

            let Some(first) = active.first() else {
                return Ok(());
            };

            chain.on_new_output(&first.start);

            *open = Some(OpenOutput {
                writer: self.factory.create()?,
                first_key: first.start.clone(),
                max_key: first.start.clone(),
                first_point: None,
                last_point: None,
            });
        }

        if let Some(o) = open.take() {
            self.close_output(o, None, &mut active, out)?;
        }

        Ok(())
    }

    /// Finalizes one output, enforcing the cross-output invariants.
    ///
    /// Pending deletions in `active` are written clipped to `cut`, so
    /// no output reaches past the split point; fragments extending
    /// beyond it stay active and resume at the cut in the next output.
    /// A `cut` of `None` writes them out in full.
    ///
    /// # Panics
    ///
    /// Panics if outputs are unordered, overlap, split a user key, or
    /// escape the compaction bounds; these are logic defects, never
    /// environmental faults.
    fn close_output(
        &self,
        mut open: OpenOutput,
        cut: Option<UserKey>,
        active: &mut Vec<Fragment>,
        out: &mut OutputSet,
    ) -> crate::Result<()> {
        let bounds = &self.picked.bounds;

        let mut remaining = Vec::new();

        for mut frag in active.drain(..) {
            let piece_end = match &cut {
                Some(cut) if *cut < frag.end => cut.clone(),
                _ => frag.end.clone(),
            };

            if frag.start < piece_end {
                let mut piece = frag.clone();
                piece.end = piece_end;

                if piece.start < open.first_key {
                    open.first_key = piece.start.clone();
                }

                // A clipped piece ends just past the output's last point
                // key, so only an unclipped piece moves the upper bound
                if cut.is_none() && piece.end > open.max_key {
                    open.max_key = piece.end.clone();
                }

                for span in Self::fragment_spans(&piece) {
                    open.writer.write_span(span)?;
                }

                out.attachments.push((piece, out.finished.len()));
            }

            if let Some(cut) = &cut {
                if frag.end > *cut {
                    frag.start = cut.clone();
                    remaining.push(frag);
                }
            }
        }

        *active = remaining;

        if let Some(prev) = &out.prev_max {
            assert!(
                *prev < open.first_key,
                "output starting at {:?} out of order or splits a user key (previous output ended at {prev:?})",
                open.first_key,
            );
        }

        if let Some(first) = &open.first_point {
            assert!(
                bounds.contains_key(first),
                "output key {first:?} escapes compaction bounds {bounds:?}",
            );
        }

        if let Some(last) = &open.last_point {
            assert!(
                bounds.contains_key(last),
                "output key {last:?} escapes compaction bounds {bounds:?}",
            );
        }

        out.prev_max = Some(open.max_key.clone());

        let range = KeyRange::new((open.first_key, open.max_key));

        let meta = open.writer.finish()?;

        out.ranges.push(range);
        out.finished.push(meta);

        Ok(())
    }

    fn fragment_spans(frag: &Fragment) -> Vec<Span> {
        let mut spans = Vec::with_capacity(2);

        if frag.deletes_points {
            spans.push(Span::new(
                frag.start.clone(),
                frag.end.clone(),
                frag.largest_seqno,
                SpanKind::RangeTombstone,
            ));
        }

        if frag.deletes_range_keys {
            spans.push(Span::new(
                frag.start.clone(),
                frag.end.clone(),
                frag.largest_seqno,
                SpanKind::RangeKeyDelete,
            ));
        }

        spans
    }

    /// Records that the tables fully covered by a surviving deletion may
    /// be dropped once no snapshot separates them from it.
    fn hint_for_fragment(&self, frag: &Fragment, table_id: crate::TableId) -> Option<DeletionHint> {
        let mut file_smallest_seqno = SeqNo::MAX;
        let mut any = false;

        for level in self
            .version
            .iter_levels()
            .skip(self.picked.output_level + 1)
        {
            for table in level.iter_tables() {
                let contained = frag.start <= *table.key_range.min()
                    && *table.key_range.max() < frag.end;

                if !contained || table.largest_seqno >= frag.smallest_seqno {
                    continue;
                }

                any = true;
                file_smallest_seqno = file_smallest_seqno.min(table.smallest_seqno);
            }
        }

        if !any {
            return None;
        }

        Some(DeletionHint {
            start: frag.start.clone(),
            end: frag.end.clone(),
            deletes_points: frag.deletes_points,
            deletes_range_keys: frag.deletes_range_keys,
            tombstone_smallest_seqno: frag.smallest_seqno,
            tombstone_largest_seqno: frag.largest_seqno,
            tombstone_level: self.picked.output_level,
            tombstone_table: table_id,
            file_smallest_seqno,
        })
    }

    fn remove_outputs(&self, outputs: &[WriterMeta]) {
        for meta in outputs {
            if let Err(e) = self.factory.remove(meta.id) {
                log::warn!("failed to remove partial compaction output {}: {e}", meta.id);
            }
        }
    }
}

// The immediate successor in byte order; no key sorts between the two
fn key_successor(key: &[u8]) -> UserKey {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next.into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        compaction::CompactionInput, version::Level, version::Run, HashMap, Table, TableId,
        ValueType,
    };
    use std::sync::{Arc, Mutex};
    use test_log::test;

    fn kr(min: &str, max: &str) -> KeyRange {
        KeyRange::new((min.as_bytes().into(), max.as_bytes().into()))
    }

    fn t(id: u64, min: &str, max: &str, size: u64, seqnos: (SeqNo, SeqNo)) -> Table {
        TableMetadata::new(id, kr(min, max), size, seqnos).into()
    }

    fn v(key: &str, seqno: SeqNo) -> InternalValue {
        InternalValue::from_components(key, "xxxxx", seqno, ValueType::Value)
    }

    fn tomb(key: &str, seqno: SeqNo) -> InternalValue {
        InternalValue::new_tombstone(key, seqno)
    }

    #[derive(Default)]
    struct MemSource {
        points: HashMap<TableId, Vec<InternalValue>>,
        spans: HashMap<TableId, Vec<Span>>,
    }

    impl TableSource for MemSource {
        fn point_iter(&self, table: &Table) -> crate::Result<BoxedIterator<'_>> {
            let items = self.points.get(&table.id()).cloned().unwrap_or_default();
            Ok(Box::new(items.into_iter().map(Ok)))
        }

        fn spans(&self, table: &Table) -> crate::Result<Vec<Span>> {
            Ok(self.spans.get(&table.id()).cloned().unwrap_or_default())
        }
    }

    /// Yields `fail_after` items, then an I/O error.
    struct FailingSource {
        items: Vec<InternalValue>,
        fail_after: usize,
    }

    impl TableSource for FailingSource {
        fn point_iter(&self, _table: &Table) -> crate::Result<BoxedIterator<'_>> {
            let ok = self.items.iter().take(self.fail_after).cloned().map(Ok);
            let err = std::iter::once(Err(Error::Io(std::io::Error::other("lost disk"))));

            Ok(Box::new(ok.chain(err)))
        }

        fn spans(&self, _table: &Table) -> crate::Result<Vec<Span>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct SinkInner {
        next_id: TableId,
        outputs: Vec<(TableId, Vec<InternalValue>, Vec<Span>)>,
        removed: Vec<TableId>,
        aborted: Vec<TableId>,
    }

    #[derive(Clone, Default)]
    struct MemFactory(Arc<Mutex<SinkInner>>);

    struct MemWriter {
        id: TableId,
        items: Vec<InternalValue>,
        spans: Vec<Span>,
        sink: Arc<Mutex<SinkInner>>,
    }

    impl TableWriter for MemWriter {
        fn write(&mut self, item: InternalValue) -> crate::Result<()> {
            self.items.push(item);
            Ok(())
        }

        fn write_span(&mut self, span: Span) -> crate::Result<()> {
            self.spans.push(span);
            Ok(())
        }

        fn written_bytes(&self) -> u64 {
            self.items
                .iter()
                .map(|x| (x.key.user_key.len() + x.value.len()) as u64)
                .sum()
        }

        fn finish(self: Box<Self>) -> crate::Result<WriterMeta> {
            let mut min: Option<UserKey> = None;
            let mut max: Option<UserKey> = None;
            let mut smallest_seqno = SeqNo::MAX;
            let mut largest_seqno = 0;

            for item in &self.items {
                let key = &item.key.user_key;
                if min.as_ref().is_none_or(|m| key < m) {
                    min = Some(key.clone());
                }
                if max.as_ref().is_none_or(|m| key > m) {
                    max = Some(key.clone());
                }
                smallest_seqno = smallest_seqno.min(item.key.seqno);
                largest_seqno = largest_seqno.max(item.key.seqno);
            }

            for span in &self.spans {
                if min.as_ref().is_none_or(|m| span.start < *m) {
                    min = Some(span.start.clone());
                }
                if max.as_ref().is_none_or(|m| span.end > *m) {
                    max = Some(span.end.clone());
                }
                smallest_seqno = smallest_seqno.min(span.seqno);
                largest_seqno = largest_seqno.max(span.seqno);
            }

            let meta = WriterMeta {
                id: self.id,
                file_size: self.written_bytes(),
                key_range: match (min, max) {
                    (Some(lo), Some(hi)) => Some(KeyRange::new((lo, hi))),
                    _ => None,
                },
                smallest_seqno: if smallest_seqno == SeqNo::MAX {
                    0
                } else {
                    smallest_seqno
                },
                largest_seqno,
                item_count: self.items.len() as u64,
                tombstone_count: self
                    .items
                    .iter()
                    .filter(|x| x.is_tombstone())
                    .count() as u64,
            };

            self.sink
                .lock()
                .expect("lock poisoned")
                .outputs
                .push((self.id, self.items, self.spans));

            Ok(meta)
        }

        fn abort(self: Box<Self>) -> crate::Result<()> {
            self.sink
                .lock()
                .expect("lock poisoned")
                .aborted
                .push(self.id);

            Ok(())
        }
    }

    impl TableWriterFactory for MemFactory {
        fn create(&self) -> crate::Result<Box<dyn TableWriter>> {
            let mut inner = self.0.lock().expect("lock poisoned");
            inner.next_id += 1;

            Ok(Box::new(MemWriter {
                id: 100 + inner.next_id,
                items: Vec::new(),
                spans: Vec::new(),
                sink: Arc::clone(&self.0),
            }))
        }

        fn remove(&self, id: TableId) -> crate::Result<()> {
            self.0.lock().expect("lock poisoned").removed.push(id);
            Ok(())
        }
    }

    fn level_of(tables: Vec<Table>) -> Level {
        let mut tables = tables;
        tables.sort_by(|a, b| a.key_range.min().cmp(b.key_range.min()));
        Level::from_runs(vec![Arc::new(Run::new(tables))])
    }

    fn version_with(levels: Vec<Level>) -> Version {
        let mut levels = levels;
        while levels.len() < 7 {
            levels.push(Level::empty());
        }
        Version::from_levels(0, levels)
    }

    fn picked(
        kind: CompactionKind,
        inputs: Vec<CompactionInput>,
        bounds: KeyRange,
    ) -> PickedCompaction {
        let start_level = inputs.first().map_or(0, |x| x.level);
        let output_level = inputs.last().map_or(0, |x| x.level);

        PickedCompaction {
            kind,
            inputs,
            start_level,
            output_level,
            bounds,
            grandparents: Vec::new(),
            score: 0.0,
        }
    }

    #[test]
    fn worker_move() {
        let table = t(1, "a", "c", 500, (0, 10));

        let version = version_with(vec![Level::empty(), level_of(vec![table.clone()])]);
        let config = Config::default();
        let source = MemSource::default();
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Move,
                vec![
                    CompactionInput::new(1, vec![table]),
                    CompactionInput::new(2, vec![]),
                ],
                kr("a", "c"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        assert_eq!(0, outcome.bytes_written);
        assert_eq!(1, outcome.edit.deleted.len());
        assert_eq!(1, outcome.edit.added.len());
        assert_eq!(2, outcome.edit.added.first().unwrap().level);
        assert_eq!(500, metrics.moved_bytes(2));
        assert!(factory.0.lock().unwrap().outputs.is_empty());
    }

    #[test]
    fn worker_delete_only() {
        let table = t(5, "d", "g", 500, (20, 30));

        let version = version_with(vec![Level::empty(), Level::empty(), level_of(vec![table.clone()])]);
        let config = Config::default();
        let source = MemSource::default();
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::DeleteOnly,
                vec![CompactionInput::new(2, vec![table])],
                kr("d", "g"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        assert!(outcome.edit.added.is_empty());
        assert_eq!(1, outcome.edit.deleted.len());
        assert_eq!(1, metrics.tables_removed(2));
    }

    #[test]
    fn worker_merge_collapses_and_zeroes() {
        let upper = t(1, "a", "c", 100, (3, 5));
        let lower = t(2, "a", "b", 100, (1, 2));

        let version = version_with(vec![
            Level::empty(),
            level_of(vec![upper.clone()]),
            level_of(vec![lower.clone()]),
        ]);

        let mut source = MemSource::default();
        source.points.insert(
            1,
            vec![
                InternalValue::from_components("a", "new", 5, ValueType::Value),
                tomb("c", 4),
            ],
        );
        source.points.insert(
            2,
            vec![
                InternalValue::from_components("a", "old", 1, ValueType::Value),
                v("b", 2),
            ],
        );

        let config = Config::default();
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Default,
                vec![
                    CompactionInput::new(1, vec![upper]),
                    CompactionInput::new(2, vec![lower]),
                ],
                kr("a", "c"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        // Nothing below L2, so seqnos were zeroed and the tombstone
        // plus everything it shadowed disappeared
        assert!(outcome.zeroed_seqnos);
        assert_eq!(2, outcome.edit.deleted.len());
        assert_eq!(1, outcome.edit.added.len());

        let sink = factory.0.lock().unwrap();
        let (_, items, spans) = sink.outputs.first().unwrap();

        assert!(spans.is_empty());
        assert_eq!(2, items.len());

        let a = items.first().unwrap();
        assert_eq!(b"a", a.key.user_key.as_ref());
        assert_eq!(0, a.key.seqno);
        assert_eq!(b"new", a.value.as_ref());

        let b = items.get(1).unwrap();
        assert_eq!(b"b", b.key.user_key.as_ref());
        assert_eq!(0, b.key.seqno);

        assert_eq!(outcome.bytes_written, metrics.compacted_bytes(2));
    }

    #[test]
    fn worker_splits_outputs_at_target_size() {
        let table = t(1, "a", "f", 100, (0, 6));

        let version = version_with(vec![Level::empty(), level_of(vec![table.clone()])]);

        let mut source = MemSource::default();
        source.points.insert(
            1,
            vec![v("a", 1), v("b", 2), v("c", 3), v("d", 4), v("e", 5), v("f", 6)],
        );

        // 6 bytes per item, target 10: two items fit, the third forces
        // a new output
        let config = Config::default().with_target_table_size(10);
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Default,
                vec![
                    CompactionInput::new(1, vec![table]),
                    CompactionInput::new(2, vec![]),
                ],
                kr("a", "f"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        assert_eq!(3, outcome.edit.added.len());

        // Outputs are ordered and disjoint
        let added = &outcome.edit.added;
        for pair in added.windows(2) {
            let (a, b) = (pair.first().unwrap(), pair.get(1).unwrap());
            assert!(a.table.key_range.max() < b.table.key_range.min());
        }

        assert_eq!(3, metrics.tables_added(2));
    }

    #[test]
    fn worker_truncates_surviving_deletions_at_splits() {
        let table = t(1, "a", "f", 100, (1, 80));

        let version = version_with(vec![Level::empty(), level_of(vec![table.clone()])]);

        let mut source = MemSource::default();
        source.points.insert(
            1,
            vec![v("a", 1), v("b", 2), v("c", 3), v("d", 4), v("e", 5), v("f", 6)],
        );
        source.spans.insert(
            1,
            vec![Span::new("a", "zzz", 80, SpanKind::RangeTombstone)],
        );

        // The snapshot pins the deletion; the tiny target size forces
        // splits while it is still pending
        let config = Config::default().with_target_table_size(10);
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Default,
                vec![
                    CompactionInput::new(1, vec![table]),
                    CompactionInput::new(2, vec![]),
                ],
                kr("a", "zzz"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[50],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        let added = &outcome.edit.added;
        assert_eq!(3, added.len());

        // The deletion must not drag an output's range over its
        // successors
        for pair in added.windows(2) {
            let (a, b) = (pair.first().unwrap(), pair.get(1).unwrap());
            assert!(
                a.table.key_range.max() < b.table.key_range.min(),
                "outputs overlap: {:?} vs {:?}",
                a.table.key_range,
                b.table.key_range,
            );
        }

        // Each output carries its clipped piece, and the pieces line up
        // into the original deletion without gaps
        let sink = factory.0.lock().unwrap();
        assert_eq!(3, sink.outputs.len());

        let mut cursor: UserKey = b"a".into();

        for (_, _, spans) in &sink.outputs {
            let span = spans.first().unwrap();
            assert_eq!(cursor, span.start, "deletion coverage has a gap");
            assert_eq!(80, span.seqno);
            cursor = span.end.clone();
        }

        assert_eq!(b"zzz", cursor.as_ref());
    }

    #[test]
    fn worker_aborts_open_output_on_error() {
        let table = t(1, "a", "f", 100, (0, 6));

        let version = version_with(vec![Level::empty(), level_of(vec![table.clone()])]);

        let source = FailingSource {
            items: vec![v("a", 1), v("b", 2), v("c", 3), v("d", 4)],
            fail_after: 4,
        };

        let config = Config::default().with_target_table_size(10);
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Default,
                vec![
                    CompactionInput::new(1, vec![table]),
                    CompactionInput::new(2, vec![]),
                ],
                kr("a", "f"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let err = job.run().unwrap_err();
        assert!(!err.is_retryable());

        // The first output finished before the error and is removed; the
        // second was still open and is discarded through the writer
        let sink = factory.0.lock().unwrap();
        assert_eq!(vec![101], sink.removed);
        assert_eq!(vec![102], sink.aborted);
    }

    #[test]
    fn worker_elision_only_drops_dead_tombstone() {
        let table = t(9, "a", "c", 100, (1, 2));

        let mut levels = Vec::new();
        for _ in 0..6 {
            levels.push(Level::empty());
        }
        levels.push(level_of(vec![table.clone()]));

        let version = version_with(levels);

        let mut source = MemSource::default();
        source.points.insert(9, vec![v("a", 1), tomb("b", 2)]);

        let config = Config::default();
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::ElisionOnly,
                vec![CompactionInput::new(6, vec![table])],
                kr("a", "c"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        // A rewrite in place: one table out, one back into the same level
        assert_eq!(1, outcome.edit.deleted.len());
        assert_eq!(1, outcome.edit.added.len());
        assert_eq!(6, outcome.edit.added.first().unwrap().level);
        assert!(outcome.zeroed_seqnos);

        // The tombstone shadowed nothing at the bottom and is gone
        let sink = factory.0.lock().unwrap();
        let (_, items, spans) = sink.outputs.first().unwrap();

        assert!(spans.is_empty());
        assert_eq!(1, items.len());

        let item = items.first().unwrap();
        assert!(!item.is_tombstone());
        assert_eq!(b"a", item.key.user_key.as_ref());
        assert_eq!(0, item.key.seqno);
    }

    #[test]
    fn worker_records_deletion_hint() {
        let upper = t(1, "d", "k", 100, (80, 81));
        let covered = t(3, "e", "g", 100, (20, 30));

        let version = version_with(vec![
            Level::empty(),
            level_of(vec![upper.clone()]),
            Level::empty(),
            level_of(vec![covered]),
        ]);

        let mut source = MemSource::default();
        source.points.insert(1, vec![v("d", 81)]);
        source.spans.insert(
            1,
            vec![Span::new("d", "k", 80, SpanKind::RangeTombstone)],
        );

        let config = Config::default();
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Default,
                vec![
                    CompactionInput::new(1, vec![upper]),
                    CompactionInput::new(2, vec![]),
                ],
                kr("d", "k"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[50],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        // The deletion survives (table 3 below still holds covered data)
        let sink = factory.0.lock().unwrap();
        let (id, items, spans) = sink.outputs.first().unwrap();
        assert_eq!(1, items.len());
        assert_eq!(1, spans.len());

        assert!(!outcome.zeroed_seqnos);

        let hint = outcome.hints.first().unwrap();
        assert_eq!(b"d", hint.start.as_ref());
        assert_eq!(b"k", hint.end.as_ref());
        assert_eq!((80, 80), (hint.tombstone_smallest_seqno, hint.tombstone_largest_seqno));
        assert_eq!(2, hint.tombstone_level);
        assert_eq!(*id, hint.tombstone_table);
        assert_eq!(20, hint.file_smallest_seqno);
    }

    #[test]
    fn worker_cancellation() {
        let table = t(1, "a", "c", 100, (0, 5));
        let version = version_with(vec![Level::empty(), level_of(vec![table.clone()])]);

        let mut source = MemSource::default();
        source.points.insert(1, vec![v("a", 1)]);

        let config = Config::default();
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let stop = StopSignal::default();
        stop.send();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Default,
                vec![
                    CompactionInput::new(1, vec![table]),
                    CompactionInput::new(2, vec![]),
                ],
                kr("a", "c"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop,
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let err = job.run().unwrap_err();
        assert!(err.is_retryable());
        assert!(factory.0.lock().unwrap().outputs.is_empty());
    }

    #[test]
    fn worker_flush_keeps_tombstones() {
        let memtable = t(1, "a", "c", 100, (0, 5));

        // Deeper data exists, but flushes must not elide regardless
        let version = version_with(vec![Level::empty()]);

        let mut source = MemSource::default();
        source.points.insert(1, vec![v("a", 1), tomb("b", 2)]);

        let config = Config::default();
        let factory = MemFactory::default();
        let metrics = Metrics::default();

        let job = CompactionJob {
            picked: picked(
                CompactionKind::Flush,
                vec![CompactionInput::new(0, vec![memtable])],
                kr("a", "c"),
            ),
            version: &version,
            config: &config,
            source: &source,
            factory: &factory,
            snapshots: &[],
            stop: StopSignal::default(),
            metrics: &metrics,
            flush_split_keys: Vec::new(),
        };

        let outcome = job.run().unwrap();

        assert!(!outcome.zeroed_seqnos);

        let sink = factory.0.lock().unwrap();
        let (_, items, _) = sink.outputs.first().unwrap();

        assert_eq!(2, items.len());
        assert!(items.get(1).unwrap().is_tombstone());
        assert_eq!(2, items.get(1).unwrap().key.seqno, "flushes keep seqnos");
    }
}
