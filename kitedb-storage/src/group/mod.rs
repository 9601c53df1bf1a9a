//! Node groups: bounded-row storage units spanning all columns of a
//! table.
//!
//! Rows arrive in transient [`ChunkedNodeGroup`] batches and are
//! stamped in the group's [`VersionInfo`]. Checkpoint merges the
//! batches into per-column persistent segments, in place when the
//! edits fit the allocated pages and by rewriting otherwise. The
//! persisted form is a field-tagged blob with a magic/version/flags
//! header and a crc32 trailer.

pub mod csr;

use crate::chunk::{ColumnChunk, ResidencyState};
use crate::column::{CheckpointOptions, CheckpointOutcome, Column};
use crate::error::{Error, Result};
use crate::page::{PageStore, PAGE_SIZE};
use crate::serde::{expect_field_tag, field_tag_len, ser_field_tag, Deser, Ser, Serde};
use crate::version::{TrxView, VersionInfo};
use crate::vector::{SelectionVector, ValueVector};
use bitflags::bitflags;
use kitedb_datatype::LogicalType;
use semistr::SemiStr;
use std::mem;

pub(crate) const NODE_GROUP_MAGIC: [u8; 4] = *b"KNGP";
pub(crate) const NODE_GROUP_VERSION: u8 = 1;

bitflags! {
    /// Feature bits in the persisted node group header.
    pub struct NodeGroupFlags: u32 {
        // whether a version tracker follows the column segments.
        const VERSIONS = 0x01;
        // whether CSR adjacency chunks follow the columns.
        const CSR = 0x02;
    }
}

/// Persisted part of one column: an on-disk chunk and the group row
/// it starts at.
pub struct ColumnSegment {
    start_row: u64,
    chunk: ColumnChunk,
    dirty: bool,
}

impl ColumnSegment {
    fn new(start_row: u64, chunk: ColumnChunk) -> Self {
        ColumnSegment {
            start_row,
            chunk,
            dirty: false,
        }
    }

    #[inline]
    pub fn start_row(&self) -> u64 {
        self.start_row
    }

    #[inline]
    pub fn chunk(&self) -> &ColumnChunk {
        &self.chunk
    }
}

/// One transient batch of rows appended since the last checkpoint.
pub struct ChunkedNodeGroup {
    start_row: u64,
    num_rows: usize,
    chunks: Vec<ColumnChunk>,
}

impl ChunkedNodeGroup {
    fn new(columns: &[Column], start_row: u64, capacity: usize) -> Self {
        ChunkedNodeGroup {
            start_row,
            num_rows: 0,
            chunks: columns.iter().map(|c| c.new_chunk(capacity, true)).collect(),
        }
    }

    #[inline]
    pub fn start_row(&self) -> u64 {
        self.start_row
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[inline]
    pub fn chunk(&self, col: usize) -> &ColumnChunk {
        &self.chunks[col]
    }

    fn append_range(
        &mut self,
        vectors: &[ValueVector],
        start: usize,
        count: usize,
    ) -> Result<()> {
        for (chunk, vector) in self.chunks.iter_mut().zip(vectors) {
            chunk.append_range(vector, start, count)?;
        }
        self.num_rows += count;
        Ok(())
    }
}

/// The row group: per-column persistent segments, transient batches,
/// and row-level version state.
pub struct NodeGroup {
    columns: Vec<Column>,
    /// Per column, persisted chunks ordered by start row.
    segments: Vec<Vec<ColumnSegment>>,
    /// Batches appended since the last checkpoint.
    transient: Vec<ChunkedNodeGroup>,
    versions: VersionInfo,
    flags: NodeGroupFlags,
    chunk_capacity: usize,
    num_rows: usize,
}

impl NodeGroup {
    pub fn new(columns: Vec<Column>, chunk_capacity: usize) -> Self {
        debug_assert!(chunk_capacity > 0);
        let segments = columns.iter().map(|_| Vec::new()).collect();
        NodeGroup {
            columns,
            segments,
            transient: Vec::new(),
            versions: VersionInfo::new(),
            flags: NodeGroupFlags::empty(),
            chunk_capacity,
            num_rows: 0,
        }
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[inline]
    pub fn column(&self, col: usize) -> &Column {
        &self.columns[col]
    }

    #[inline]
    pub fn segments(&self, col: usize) -> &[ColumnSegment] {
        &self.segments[col]
    }

    #[inline]
    pub fn versions(&self) -> &VersionInfo {
        &self.versions
    }

    /// Appends rows [start, start+count) of the batch across all
    /// columns, stamping them with the writing transaction. Returns
    /// the group row the batch starts at.
    pub fn append(
        &mut self,
        ts: u64,
        vectors: &[ValueVector],
        start: usize,
        count: usize,
    ) -> Result<u64> {
        debug_assert_eq!(vectors.len(), self.columns.len());
        if vectors.iter().any(|v| v.len() < start + count) {
            return Err(Error::ValueCountMismatch);
        }
        let first_row = self.num_rows as u64;
        let mut offset = start;
        let mut remaining = count;
        while remaining > 0 {
            if self
                .transient
                .last()
                .map_or(true, |g| g.num_rows == self.chunk_capacity)
            {
                let group_start = self.num_rows as u64;
                self.transient.push(ChunkedNodeGroup::new(
                    &self.columns,
                    group_start,
                    self.chunk_capacity,
                ));
            }
            let capacity = self.chunk_capacity;
            let group = match self.transient.last_mut() {
                Some(group) => group,
                None => unreachable!(),
            };
            let rows = remaining.min(capacity - group.num_rows);
            group.append_range(vectors, offset, rows)?;
            self.num_rows += rows;
            offset += rows;
            remaining -= rows;
        }
        self.versions.append(first_row as usize, count, ts);
        Ok(first_row)
    }

    /// Marks one row deleted by the transaction. False if the row is
    /// out of range or already carries a deletion version.
    pub fn delete(&mut self, ts: u64, row: u64) -> bool {
        if row as usize >= self.num_rows {
            return false;
        }
        self.versions.delete(row as usize, ts)
    }

    pub fn commit_append(&mut self, start_row: u64, num_rows: usize, commit_ts: u64) {
        self.versions
            .commit_append(start_row as usize, num_rows, commit_ts);
    }

    pub fn rollback_append(&mut self, start_row: u64, num_rows: usize) {
        self.versions.rollback_append(start_row as usize, num_rows);
    }

    pub fn commit_delete(&mut self, row: u64, commit_ts: u64) {
        self.versions.commit_delete(row as usize, commit_ts);
    }

    pub fn rollback_delete(&mut self, row: u64) {
        self.versions.rollback_delete(row as usize);
    }

    #[inline]
    pub fn is_visible(&self, view: &TrxView, row: u64) -> bool {
        (row as usize) < self.num_rows && self.versions.is_visible(view, row as usize)
    }

    /// Reads rows [start, start+count) of every column and deselects
    /// the rows the view cannot see.
    pub fn scan(
        &self,
        store: &dyn PageStore,
        view: &TrxView,
        start: usize,
        count: usize,
        out: &mut [ValueVector],
        sel: &mut SelectionVector,
    ) -> Result<()> {
        debug_assert_eq!(out.len(), self.columns.len());
        if start + count > self.num_rows {
            return Err(Error::IndexOutOfBound);
        }
        for (col, out_vec) in out.iter_mut().enumerate() {
            out_vec.reset();
            out_vec.set_len(count);
            self.scan_column(store, col, start, count, out_vec)?;
        }
        *sel = SelectionVector::all(count);
        self.versions.select_visible(view, start, count, sel);
        Ok(())
    }

    /// Reads one row of every column, without visibility filtering.
    pub fn lookup(
        &self,
        store: &dyn PageStore,
        row: usize,
        out: &mut [ValueVector],
        out_idx: usize,
    ) -> Result<()> {
        debug_assert_eq!(out.len(), self.columns.len());
        if row >= self.num_rows {
            return Err(Error::IndexOutOfBound);
        }
        for (col, out_vec) in out.iter_mut().enumerate() {
            let (chunk, chunk_start) = self.locate(col, row)?;
            self.columns[col].lookup(store, chunk, row - chunk_start, out_vec, out_idx)?;
        }
        Ok(())
    }

    fn scan_column(
        &self,
        store: &dyn PageStore,
        col: usize,
        start: usize,
        count: usize,
        out: &mut ValueVector,
    ) -> Result<()> {
        let column = &self.columns[col];
        let mut done = 0;
        while done < count {
            let row = start + done;
            let (chunk, chunk_start) = self.locate(col, row)?;
            let in_chunk = row - chunk_start;
            let rows = (chunk.num_values() - in_chunk).min(count - done);
            column.scan(store, chunk, in_chunk, rows, out, done)?;
            done += rows;
        }
        Ok(())
    }

    /// Finds the chunk holding a row and the group row it starts at.
    fn locate(&self, col: usize, row: usize) -> Result<(&ColumnChunk, usize)> {
        for seg in &self.segments[col] {
            let seg_start = seg.start_row as usize;
            if row >= seg_start && row < seg_start + seg.chunk.num_values() {
                return Ok((&seg.chunk, seg_start));
            }
        }
        for group in &self.transient {
            let group_start = group.start_row as usize;
            if row >= group_start && row < group_start + group.num_rows {
                return Ok((&group.chunks[col], group_start));
            }
        }
        Err(Error::IndexOutOfBound)
    }

    /// Random-access update of one value. A row in a persisted
    /// segment loads that segment back into memory first.
    pub fn update(
        &mut self,
        store: &dyn PageStore,
        col: usize,
        row: usize,
        vector: &ValueVector,
        idx: usize,
    ) -> Result<()> {
        if row >= self.num_rows {
            return Err(Error::IndexOutOfBound);
        }
        for group in &mut self.transient {
            let group_start = group.start_row as usize;
            if row >= group_start && row < group_start + group.num_rows {
                return group.chunks[col].write_value(row - group_start, vector, idx);
            }
        }
        for seg in &mut self.segments[col] {
            let seg_start = seg.start_row as usize;
            if row >= seg_start && row < seg_start + seg.chunk.num_values() {
                if seg.chunk.residency() == ResidencyState::OnDisk {
                    seg.chunk.load(store)?;
                }
                seg.chunk.write_value(row - seg_start, vector, idx)?;
                seg.dirty = true;
                return Ok(());
            }
        }
        Err(Error::IndexOutOfBound)
    }

    /// Reconciles every column with the page store: merges transient
    /// batches into the persisted segments, writing in place when the
    /// edits fit their pages and rewriting otherwise.
    pub fn checkpoint(&mut self, store: &dyn PageStore, opts: &CheckpointOptions) -> Result<()> {
        let transient = mem::take(&mut self.transient);
        log::debug!(
            "node group checkpoint: {} rows, {} columns, {} transient batches",
            self.num_rows,
            self.columns.len(),
            transient.len()
        );
        for col in 0..self.columns.len() {
            let dirty = self.segments[col].iter().any(|s| s.dirty);
            if transient.is_empty() && !dirty {
                continue;
            }
            self.checkpoint_column(store, col, &transient, opts)?;
        }
        Ok(())
    }

    fn checkpoint_column(
        &mut self,
        store: &dyn PageStore,
        col: usize,
        transient: &[ChunkedNodeGroup],
        opts: &CheckpointOptions,
    ) -> Result<()> {
        let old = mem::take(&mut self.segments[col]);
        let column = &self.columns[col];
        let (mut merged, consolidated) = if old.is_empty() {
            (column.new_chunk(self.num_rows.max(1), true), Vec::new())
        } else if old.len() == 1 {
            let mut iter = old.into_iter();
            let seg = match iter.next() {
                Some(seg) => seg,
                None => unreachable!(),
            };
            debug_assert_eq!(seg.start_row, 0);
            let mut chunk = seg.chunk;
            if chunk.residency() == ResidencyState::OnDisk && !transient.is_empty() {
                chunk.load(store)?;
            }
            (chunk, Vec::new())
        } else {
            // several segments consolidate into one chunk; their pages
            // are freed once the rewrite sticks.
            let mut old = old;
            let mut chunk = column.new_chunk(self.num_rows.max(1), true);
            for seg in &mut old {
                if seg.chunk.residency() == ResidencyState::OnDisk {
                    seg.chunk.load(store)?;
                }
                chunk.write_chunk(seg.start_row as usize, &seg.chunk, 0, seg.chunk.num_values())?;
            }
            (chunk, old)
        };
        for group in transient {
            merged.write_chunk(group.start_row as usize, &group.chunks[col], 0, group.num_rows)?;
        }
        let outcome = column.checkpoint(store, merged, opts)?;
        let new_segments = match outcome {
            CheckpointOutcome::InPlace(chunk) => vec![ColumnSegment::new(0, chunk)],
            CheckpointOutcome::OutOfPlace(chunks) => {
                let mut segments = Vec::with_capacity(chunks.len());
                let mut row = 0u64;
                for chunk in chunks {
                    let rows = chunk.num_values() as u64;
                    segments.push(ColumnSegment::new(row, chunk));
                    row += rows;
                }
                segments
            }
        };
        for seg in &consolidated {
            let mut runs = Vec::new();
            seg.chunk.collect_page_runs(&mut runs);
            for (page_idx, num_pages) in runs {
                store.free_pages(page_idx, num_pages as u64);
            }
        }
        self.segments[col] = new_segments;
        Ok(())
    }

    /// Drops the buffers of every clean persisted segment.
    pub fn evict(&mut self) {
        for segments in &mut self.segments {
            for seg in segments {
                if seg.chunk.residency() == ResidencyState::InMemory
                    && seg.chunk.metadata().is_some()
                    && !seg.dirty
                {
                    seg.chunk.evict();
                }
            }
        }
    }

    /// Visits every physical chunk of the group with its column name.
    pub fn for_each_chunk<F: FnMut(&str, &ColumnChunk)>(&self, mut f: F) {
        for (col, segments) in self.columns.iter().zip(&self.segments) {
            for seg in segments {
                f(col.name(), &seg.chunk);
            }
        }
        for group in &self.transient {
            for (col, chunk) in self.columns.iter().zip(&group.chunks) {
                f(col.name(), chunk);
            }
        }
    }

    pub fn estimated_memory_usage(&self) -> usize {
        let segments: usize = self
            .segments
            .iter()
            .flatten()
            .map(|s| s.chunk.in_mem_size())
            .sum();
        let transient: usize = self
            .transient
            .iter()
            .flat_map(|g| g.chunks.iter().map(|c| c.in_mem_size()))
            .sum();
        segments + transient + self.versions.in_mem_size()
    }

    pub fn size_on_disk(&self) -> u64 {
        self.segments
            .iter()
            .flatten()
            .map(|s| s.chunk.num_disk_pages() * PAGE_SIZE as u64)
            .sum()
    }

    /// Frees every page owned by the group's segments. The group holds
    /// no persistent data afterwards and should be dropped.
    pub fn reclaim_storage(&mut self, store: &dyn PageStore) {
        for segments in &mut self.segments {
            for seg in segments.drain(..) {
                let mut runs = Vec::new();
                seg.chunk.collect_page_runs(&mut runs);
                for (page_idx, num_pages) in runs {
                    store.free_pages(page_idx, num_pages as u64);
                }
            }
        }
    }

    fn header_flags(&self) -> NodeGroupFlags {
        let mut flags = self.flags;
        if !self.versions.is_empty() {
            flags |= NodeGroupFlags::VERSIONS;
        }
        flags
    }

    /// Serializes the group with its envelope: header, columns and
    /// segments, versions, crc32 trailer.
    pub fn write_blob(&self) -> Vec<u8> {
        write_blob(self)
    }

    /// Parses a serialized group, validating the checksum and every
    /// field tag. Chunks come back on disk.
    pub fn read_blob(bytes: &[u8]) -> Result<NodeGroup> {
        read_blob(bytes)
    }
}

pub(crate) fn write_blob<'a, T: Ser<'a>>(value: &T) -> Vec<u8> {
    let len = value.ser_len();
    let mut buf = vec![0u8; len + mem::size_of::<u32>()];
    let out = &mut buf[..];
    let idx = value.ser(out, 0);
    debug_assert_eq!(idx, len);
    let crc = crc32fast::hash(&buf[..len]);
    let out = &mut buf[..];
    out.ser_u32(len, crc);
    buf
}

pub(crate) fn read_blob<T: Deser>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < mem::size_of::<u32>() {
        return Err(Error::InvalidFormat);
    }
    let body_len = bytes.len() - mem::size_of::<u32>();
    let (_, stored) = bytes.deser_u32(body_len)?;
    if crc32fast::hash(&bytes[..body_len]) != stored {
        return Err(Error::ChecksumMismatch);
    }
    let (idx, value) = T::deser(bytes, 0)?;
    if idx != body_len {
        return Err(Error::InvalidFormat);
    }
    Ok(value)
}

impl Ser<'_> for NodeGroup {
    fn ser_len(&self) -> usize {
        debug_assert!(
            self.transient.is_empty(),
            "serializing node group with unflushed batches"
        );
        let mut len = NODE_GROUP_MAGIC.len() + mem::size_of::<u8>() + mem::size_of::<u32>();
        len += field_tag_len("nrow") + mem::size_of::<u64>();
        len += field_tag_len("ccap") + mem::size_of::<u64>();
        len += field_tag_len("cols") + mem::size_of::<u64>();
        for (col, segments) in self.columns.iter().zip(&self.segments) {
            len += SemiStr::new(col.name()).ser_len();
            len += col.logical_type().ser_len();
            len += mem::size_of::<u8>();
            len += mem::size_of::<u64>();
            for seg in segments {
                len += mem::size_of::<u64>() + seg.chunk.ser_len();
            }
        }
        if self.header_flags().contains(NodeGroupFlags::VERSIONS) {
            len += self.versions.ser_len();
        }
        len
    }

    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        debug_assert!(
            self.versions.is_fully_committed(),
            "serializing node group with active transactions"
        );
        let mut idx = NODE_GROUP_MAGIC.ser(out, start_idx);
        idx = out.ser_u8(idx, NODE_GROUP_VERSION);
        let flags = self.header_flags();
        idx = out.ser_u32(idx, flags.bits());
        idx = ser_field_tag(out, idx, "nrow");
        idx = out.ser_u64(idx, self.num_rows as u64);
        idx = ser_field_tag(out, idx, "ccap");
        idx = out.ser_u64(idx, self.chunk_capacity as u64);
        idx = ser_field_tag(out, idx, "cols");
        idx = out.ser_u64(idx, self.columns.len() as u64);
        for (col, segments) in self.columns.iter().zip(&self.segments) {
            idx = SemiStr::new(col.name()).ser(out, idx);
            idx = col.logical_type().ser(out, idx);
            idx = out.ser_bool(idx, col.enable_compression());
            idx = out.ser_u64(idx, segments.len() as u64);
            for seg in segments {
                idx = out.ser_u64(idx, seg.start_row);
                idx = seg.chunk.ser(out, idx);
            }
        }
        if flags.contains(NodeGroupFlags::VERSIONS) {
            idx = self.versions.ser(out, idx);
        }
        idx
    }
}

impl Deser for NodeGroup {
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, magic) = <[u8; 4]>::deser(input, start_idx)?;
        if magic != NODE_GROUP_MAGIC {
            return Err(Error::InvalidFormat);
        }
        let (idx, version) = input.deser_u8(idx)?;
        if version != NODE_GROUP_VERSION {
            return Err(Error::InvalidFormat);
        }
        let (idx, bits) = input.deser_u32(idx)?;
        let mut flags = NodeGroupFlags::from_bits(bits).ok_or(Error::InvalidFormat)?;
        let idx = expect_field_tag(input, idx, "nrow")?;
        let (idx, num_rows) = input.deser_u64(idx)?;
        let idx = expect_field_tag(input, idx, "ccap")?;
        let (idx, chunk_capacity) = input.deser_u64(idx)?;
        let idx = expect_field_tag(input, idx, "cols")?;
        let (mut idx, num_cols) = input.deser_u64(idx)?;
        let mut columns = Vec::with_capacity(num_cols as usize);
        let mut segments = Vec::with_capacity(num_cols as usize);
        for _ in 0..num_cols {
            let (i, name) = SemiStr::deser(input, idx)?;
            let (i, ty) = LogicalType::deser(input, i)?;
            let (i, enable_compression) = input.deser_bool(i)?;
            let (mut i, num_segs) = input.deser_u64(i)?;
            let mut segs = Vec::with_capacity(num_segs as usize);
            for _ in 0..num_segs {
                let (j, start_row) = input.deser_u64(i)?;
                let (j, chunk) = ColumnChunk::deser(input, j)?;
                if chunk.logical_type() != &ty {
                    return Err(Error::InvalidFormat);
                }
                i = j;
                segs.push(ColumnSegment::new(start_row, chunk));
            }
            idx = i;
            columns.push(Column::new(&name, &ty, enable_compression));
            segments.push(segs);
        }
        let (idx, versions) = if flags.contains(NodeGroupFlags::VERSIONS) {
            VersionInfo::deser(input, idx)?
        } else {
            (idx, VersionInfo::new())
        };
        flags.remove(NodeGroupFlags::VERSIONS);
        Ok((
            idx,
            NodeGroup {
                columns,
                segments,
                transient: Vec::new(),
                versions,
                flags,
                chunk_capacity: chunk_capacity as usize,
                num_rows: num_rows as usize,
            },
        ))
    }
}
