//! List chunk: per-row spans over a child data chunk.
//!
//! Offsets record each row's span end, sizes its length, so the span
//! start is always `offset - size` no matter how rows were written.
//! Writes append the new span at the data chunk's end; overwrites
//! abandon the old span, which finalize may compact away.

use crate::chunk::null::NullChunk;
use crate::chunk::{
    can_slots_fit, flush_slots, flush_slots_at, load_slots, ColumnChunk, ColumnChunkMetadata,
};
use crate::error::{Error, Result};
use crate::page::{PageId, PageStore};
use crate::serde::{expect_field_tag, field_tag_len, ser_field_tag, Deser, Ser, Serde};
use crate::vector::{ListEntry, ValueVector};
use kitedb_datatype::{LogicalType, PhysicalType};
use std::mem;

pub struct ListChunk {
    /// End offset of each row's span in the data chunk.
    offsets: Vec<u64>,
    /// Span length per row.
    sizes: Vec<u32>,
    data: Box<ColumnChunk>,
    sizes_meta: Option<ColumnChunkMetadata>,
    /// Armed by any overwrite. Abandoned spans accumulate in the data
    /// chunk until finalize decides to compact.
    random_write: bool,
}

impl ListChunk {
    pub fn new(child_ty: &LogicalType, capacity: usize) -> Self {
        ListChunk {
            offsets: Vec::new(),
            sizes: Vec::new(),
            data: Box::new(ColumnChunk::new(child_ty, capacity, true)),
            sizes_meta: None,
            random_write: false,
        }
    }

    #[inline]
    pub fn data(&self) -> &ColumnChunk {
        &self.data
    }

    #[inline]
    pub(crate) fn sizes_meta(&self) -> Option<&ColumnChunkMetadata> {
        self.sizes_meta.as_ref()
    }

    /// Span of one row as (start, length) in data chunk rows.
    #[inline]
    pub fn span(&self, row: usize) -> (u64, u32) {
        let len = self.sizes[row];
        (self.offsets[row] - len as u64, len)
    }

    pub fn put_row(
        &mut self,
        row: usize,
        num_values: usize,
        child: &ValueVector,
        entry: ListEntry,
    ) -> Result<()> {
        if row < num_values {
            self.random_write = true;
        }
        let len = entry.len as usize;
        let needed = self.data.num_values() + len;
        if needed > self.data.capacity() {
            let new_cap = needed.max(self.data.capacity() * 2);
            self.data.resize(new_cap);
        }
        let start = self.data.num_values() as u64;
        self.data.append_range(child, entry.offset as usize, len)?;
        self.record_row(row, start + entry.len as u64, entry.len);
        Ok(())
    }

    pub fn put_null_row(&mut self, row: usize, num_values: usize) {
        if row < num_values {
            self.random_write = true;
            self.sizes[row] = 0;
            return;
        }
        let end = self.data.num_values() as u64;
        if row >= self.offsets.len() {
            self.offsets.resize(row + 1, end);
            self.sizes.resize(row + 1, 0);
        }
    }

    pub fn copy_row_from(
        &mut self,
        row: usize,
        num_values: usize,
        src: &ListChunk,
        src_row: usize,
    ) -> Result<()> {
        if row < num_values {
            self.random_write = true;
        }
        let (src_start, len) = src.span(src_row);
        let start = self.data.num_values();
        self.data
            .write_chunk(start, &src.data, src_start as usize, len as usize)?;
        self.record_row(row, start as u64 + len as u64, len);
        Ok(())
    }

    fn record_row(&mut self, row: usize, end: u64, len: u32) {
        if row >= self.offsets.len() {
            // gap rows get empty spans at the previous data end.
            let fill = end - len as u64;
            self.offsets.resize(row, fill);
            self.sizes.resize(row, 0);
            self.offsets.push(end);
            self.sizes.push(len);
        } else {
            self.offsets[row] = end;
            self.sizes[row] = len;
        }
    }

    pub fn scan(
        &self,
        nulls: Option<&NullChunk>,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if self.offsets_ascending(start, start + count) {
            // Back-to-back spans cover one contiguous data range, so the
            // whole range moves with a single child copy.
            let (range_start, _) = self.span(start);
            let total = (self.offsets[start + count - 1] - range_start) as usize;
            let mut child_base = 0;
            for k in 0..count {
                let offset = out.set_list_entry(out_start + k, self.sizes[start + k]);
                if k == 0 {
                    child_base = offset;
                }
            }
            if total > 0 {
                self.data.scan(
                    range_start as usize,
                    total,
                    out.list_child_mut(),
                    child_base as usize,
                )?;
            }
            return Ok(());
        }
        for k in 0..count {
            let row = start + k;
            if nulls.map_or(false, |n| n.is_null(row)) {
                out.set_list_entry(out_start + k, 0);
                continue;
            }
            let (span_start, len) = self.span(row);
            let child_offset = out.set_list_entry(out_start + k, len);
            if len > 0 {
                self.data.scan(
                    span_start as usize,
                    len as usize,
                    out.list_child_mut(),
                    child_offset as usize,
                )?;
            }
        }
        Ok(())
    }

    /// Whether rows in `start..end` carve back-to-back spans out of the
    /// data chunk, each row's span ending where the next one starts.
    pub fn offsets_ascending(&self, start: usize, end: usize) -> bool {
        if start == end {
            return true;
        }
        let mut expected = self.span(start).0;
        for row in start..end {
            expected += self.sizes[row] as u64;
            if self.offsets[row] != expected {
                return false;
            }
        }
        true
    }

    /// Compacts abandoned spans by rebuilding the data chunk in row
    /// order. Runs only after random writes, once the data chunk is
    /// more than half full, and only if spans are out of order.
    pub fn finalize(&mut self, num_values: usize, nulls: Option<&NullChunk>) -> Result<()> {
        if !self.random_write {
            return Ok(());
        }
        if self.data.num_values() * 2 <= self.data.capacity() {
            return Ok(());
        }
        if self.offsets_ascending(0, num_values) {
            return Ok(());
        }
        let live: u64 = (0..num_values)
            .filter(|row| !nulls.map_or(false, |n| n.is_null(*row)))
            .map(|row| self.sizes[row] as u64)
            .sum();
        let mut fresh = ColumnChunk::new(self.data.logical_type(), live as usize, true);
        let mut offsets = Vec::with_capacity(num_values);
        let mut sizes = Vec::with_capacity(num_values);
        let mut end = 0u64;
        for row in 0..num_values {
            let is_null = nulls.map_or(false, |n| n.is_null(row));
            let len = self.sizes[row];
            if is_null || len == 0 {
                offsets.push(end);
                sizes.push(0);
                continue;
            }
            let (start, _) = self.span(row);
            fresh.write_chunk(end as usize, &self.data, start as usize, len as usize)?;
            end += len as u64;
            offsets.push(end);
            sizes.push(len);
        }
        self.offsets = offsets;
        self.sizes = sizes;
        self.data = Box::new(fresh);
        self.random_write = false;
        Ok(())
    }

    pub fn flush(
        &mut self,
        store: &dyn PageStore,
        num_values: usize,
        enable_compression: bool,
    ) -> Result<ColumnChunkMetadata> {
        let meta = flush_slots(
            store,
            PhysicalType::UInt64,
            bytemuck::cast_slice(&self.offsets[..num_values]),
            num_values,
            enable_compression,
        )?;
        self.sizes_meta = Some(flush_slots(
            store,
            PhysicalType::UInt32,
            bytemuck::cast_slice(&self.sizes[..num_values]),
            num_values,
            enable_compression,
        )?);
        self.data.flush(store, enable_compression)?;
        Ok(meta)
    }

    pub fn can_flush_in_place(&self, num_values: usize, meta: &ColumnChunkMetadata) -> bool {
        if !can_slots_fit(
            PhysicalType::UInt64,
            bytemuck::cast_slice(&self.offsets[..num_values]),
            num_values,
            meta,
        ) {
            return false;
        }
        let sizes_meta = match &self.sizes_meta {
            Some(meta) => meta,
            None => return false,
        };
        if !can_slots_fit(
            PhysicalType::UInt32,
            bytemuck::cast_slice(&self.sizes[..num_values]),
            num_values,
            sizes_meta,
        ) {
            return false;
        }
        self.data.can_flush_in_place()
    }

    pub fn flush_in_place(
        &mut self,
        store: &dyn PageStore,
        num_values: usize,
        meta: &ColumnChunkMetadata,
    ) -> Result<ColumnChunkMetadata> {
        let new_meta = flush_slots_at(
            store,
            PhysicalType::UInt64,
            bytemuck::cast_slice(&self.offsets[..num_values]),
            num_values,
            meta,
        )?;
        let sizes_meta = match &self.sizes_meta {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        self.sizes_meta = Some(flush_slots_at(
            store,
            PhysicalType::UInt32,
            bytemuck::cast_slice(&self.sizes[..num_values]),
            num_values,
            &sizes_meta,
        )?);
        self.data.flush_in_place(store)?;
        Ok(new_meta)
    }

    pub fn load(&mut self, store: &dyn PageStore, meta: &ColumnChunkMetadata) -> Result<()> {
        let sizes_meta = match &self.sizes_meta {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let num_values = meta.num_values as usize;
        self.offsets.clear();
        self.offsets.resize(num_values, 0);
        load_slots(
            store,
            PhysicalType::UInt64,
            meta,
            bytemuck::cast_slice_mut(&mut self.offsets),
        )?;
        self.sizes.clear();
        self.sizes.resize(num_values, 0);
        load_slots(
            store,
            PhysicalType::UInt32,
            &sizes_meta,
            bytemuck::cast_slice_mut(&mut self.sizes),
        )?;
        self.data.load(store)?;
        self.random_write = false;
        Ok(())
    }

    pub fn evict(&mut self) {
        self.offsets = Vec::new();
        self.sizes = Vec::new();
        self.data.evict();
        self.random_write = false;
    }

    pub fn reset(&mut self) {
        self.offsets.clear();
        self.sizes.clear();
        let capacity = self.data.capacity();
        self.data.resize_without_preserve(capacity);
        self.sizes_meta = None;
        self.random_write = false;
    }

    #[inline]
    pub fn in_mem_size(&self) -> usize {
        self.offsets.len() * mem::size_of::<u64>()
            + self.sizes.len() * mem::size_of::<u32>()
            + self.data.in_mem_size()
    }

    pub fn collect_page_runs(&self, out: &mut Vec<(PageId, u32)>) {
        if let Some(meta) = &self.sizes_meta {
            if meta.num_pages > 0 {
                out.push((meta.page_idx, meta.num_pages));
            }
        }
        self.data.collect_page_runs(out);
    }

    pub fn ser_extra_len(&self) -> usize {
        field_tag_len("size")
            + self.sizes_meta.ser_len()
            + field_tag_len("data")
            + self.data.ser_len()
    }

    pub fn ser_extra<S: Serde + ?Sized>(&self, out: &mut S, idx: usize) -> usize {
        let idx = ser_field_tag(out, idx, "size");
        let idx = self.sizes_meta.ser(out, idx);
        let idx = ser_field_tag(out, idx, "data");
        self.data.ser(out, idx)
    }

    pub fn deser_extra<S: Serde + ?Sized>(input: &S, idx: usize) -> Result<(usize, Self)> {
        let idx = expect_field_tag(input, idx, "size")?;
        let (idx, sizes_meta) = Option::<ColumnChunkMetadata>::deser(input, idx)?;
        let idx = expect_field_tag(input, idx, "data")?;
        let (idx, data) = ColumnChunk::deser(input, idx)?;
        Ok((
            idx,
            ListChunk {
                offsets: Vec::new(),
                sizes: Vec::new(),
                data: Box::new(data),
                sizes_meta,
                random_write: false,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkBody, ResidencyState};
    use crate::page::MemPageStore;

    fn list_i64_vector(rows: &[Option<&[i64]>]) -> ValueVector {
        let mut vec = ValueVector::new(&LogicalType::list(LogicalType::Int64));
        vec.set_len(rows.len());
        for (i, row) in rows.iter().enumerate() {
            match row {
                Some(items) => {
                    let off = vec.set_list_entry(i, items.len() as u32) as usize;
                    for (j, v) in items.iter().enumerate() {
                        vec.list_child_mut().set_i64(off + j, *v);
                    }
                }
                None => {
                    vec.set_null(i, true);
                    vec.set_list_entry(i, 0);
                }
            }
        }
        vec
    }

    fn scan_lists(chunk: &ColumnChunk, count: usize) -> Vec<Option<Vec<i64>>> {
        let mut out = ValueVector::new(&LogicalType::list(LogicalType::Int64));
        out.set_len(count);
        chunk.scan(0, count, &mut out, 0).unwrap();
        (0..count)
            .map(|i| {
                if out.is_null(i) {
                    None
                } else {
                    let entry = out.list_entry(i);
                    Some(
                        (0..entry.len as usize)
                            .map(|j| out.list_child().get_i64(entry.offset as usize + j))
                            .collect(),
                    )
                }
            })
            .collect()
    }

    #[test]
    fn test_list_chunk_append_scan() {
        let mut chunk = ColumnChunk::new(&LogicalType::list(LogicalType::Int64), 2048, true);
        let vec = list_i64_vector(&[Some(&[1, 2]), Some(&[]), None, Some(&[3])]);
        chunk.append_all(&vec).unwrap();
        assert_eq!(chunk.num_values(), 4);

        match &chunk.body {
            ChunkBody::List(l) => {
                assert_eq!(&l.offsets, &[2, 2, 2, 3]);
                assert_eq!(&l.sizes, &[2, 0, 0, 1]);
                assert_eq!(l.data.num_values(), 3);
                assert!(l.offsets_ascending(0, 4));
            }
            _ => unreachable!(),
        }

        let lists = scan_lists(&chunk, 4);
        assert_eq!(lists[0], Some(vec![1, 2]));
        assert_eq!(lists[1], Some(vec![]));
        assert_eq!(lists[2], None);
        assert_eq!(lists[3], Some(vec![3]));
    }

    #[test]
    fn test_list_chunk_write_beyond_count() {
        let mut chunk = ColumnChunk::new(&LogicalType::list(LogicalType::Int64), 2048, true);
        chunk
            .append_all(&list_i64_vector(&[Some(&[1]), Some(&[2, 2]), Some(&[3])]))
            .unwrap();

        let upd = list_i64_vector(&[Some(&[9, 9])]);
        chunk.write_value(5, &upd, 0).unwrap();
        assert_eq!(chunk.num_values(), 6);

        let lists = scan_lists(&chunk, 6);
        assert_eq!(lists[2], Some(vec![3]));
        assert_eq!(lists[3], None);
        assert_eq!(lists[4], None);
        assert_eq!(lists[5], Some(vec![9, 9]));
    }

    #[test]
    fn test_list_overwrite_appends_span() {
        let mut chunk = ColumnChunk::new(&LogicalType::list(LogicalType::Int64), 2048, true);
        chunk
            .append_all(&list_i64_vector(&[Some(&[1, 2]), Some(&[3])]))
            .unwrap();

        let upd = list_i64_vector(&[Some(&[7, 8, 9])]);
        chunk.write_value(0, &upd, 0).unwrap();
        assert_eq!(chunk.num_values(), 2);

        match &chunk.body {
            ChunkBody::List(l) => {
                assert!(l.random_write);
                // old span [0, 2) is abandoned, the new one sits at the end.
                assert_eq!(l.data.num_values(), 6);
                assert_eq!(l.span(0), (3, 3));
                assert!(!l.offsets_ascending(0, 2));
                // a range opens at its own first span, so the untouched
                // suffix still counts as ascending.
                assert!(l.offsets_ascending(1, 2));
            }
            _ => unreachable!(),
        }

        let lists = scan_lists(&chunk, 2);
        assert_eq!(lists[0], Some(vec![7, 8, 9]));
        assert_eq!(lists[1], Some(vec![3]));
    }

    #[test]
    fn test_list_finalize_compacts() {
        // small capacity so abandoned spans cross the half-full mark.
        let mut chunk = ColumnChunk::new(&LogicalType::list(LogicalType::Int64), 4, true);
        chunk
            .append_all(&list_i64_vector(&[Some(&[1, 2]), Some(&[3])]))
            .unwrap();
        let upd = list_i64_vector(&[Some(&[9])]);
        chunk.write_value(0, &upd, 0).unwrap();

        match &chunk.body {
            ChunkBody::List(l) => assert_eq!(l.data.num_values(), 4),
            _ => unreachable!(),
        }
        chunk.finalize().unwrap();
        match &chunk.body {
            ChunkBody::List(l) => {
                assert!(!l.random_write);
                assert_eq!(l.data.num_values(), 2);
                assert_eq!(&l.offsets, &[1, 2]);
                assert_eq!(&l.sizes, &[1, 1]);
                assert!(l.offsets_ascending(0, 2));
            }
            _ => unreachable!(),
        }
        let lists = scan_lists(&chunk, 2);
        assert_eq!(lists[0], Some(vec![9]));
        assert_eq!(lists[1], Some(vec![3]));
    }

    #[test]
    fn test_list_chunk_flush_load() {
        let store = MemPageStore::new(8, 64);
        let mut chunk = ColumnChunk::new(&LogicalType::list(LogicalType::Int64), 2048, true);
        let rows: Vec<Option<Vec<i64>>> = (0..200)
            .map(|i| {
                if i % 13 == 0 {
                    None
                } else {
                    Some((0..i % 5).map(|j| (i * 10 + j) as i64).collect())
                }
            })
            .collect();
        let borrowed: Vec<Option<&[i64]>> = rows
            .iter()
            .map(|r| r.as_ref().map(|v| v.as_slice()))
            .collect();
        chunk.append_all(&list_i64_vector(&borrowed)).unwrap();
        chunk.finalize().unwrap();
        chunk.flush(&store, true).unwrap();

        let mut buf = vec![0u8; chunk.ser_len()];
        let idx = chunk.ser(&mut buf[..], 0);
        assert_eq!(idx, buf.len());
        let (_, mut restored) = ColumnChunk::deser(&buf[..], 0).unwrap();
        assert_eq!(restored.residency(), ResidencyState::OnDisk);
        restored.load(&store).unwrap();

        let lists = scan_lists(&restored, 200);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(&lists[i], row);
        }
    }

    #[test]
    fn test_nested_list_flush_load() {
        let store = MemPageStore::new(8, 64);
        let ty = LogicalType::list(LogicalType::list(LogicalType::Int64));
        let mut chunk = ColumnChunk::new(&ty, 64, true);

        let mut vec = ValueVector::new(&ty);
        vec.set_len(2);
        // [[1], [2, 3]] and [[]]
        let off = vec.set_list_entry(0, 2) as usize;
        let child = vec.list_child_mut();
        let inner_off = child.set_list_entry(off, 1) as usize;
        child.list_child_mut().set_i64(inner_off, 1);
        let inner_off = child.set_list_entry(off + 1, 2) as usize;
        child.list_child_mut().set_i64(inner_off, 2);
        child.list_child_mut().set_i64(inner_off + 1, 3);
        let off = vec.set_list_entry(1, 1) as usize;
        vec.list_child_mut().set_list_entry(off, 0);
        chunk.append_all(&vec).unwrap();
        chunk.flush(&store, true).unwrap();

        let mut buf = vec![0u8; chunk.ser_len()];
        chunk.ser(&mut buf[..], 0);
        let (_, mut restored) = ColumnChunk::deser(&buf[..], 0).unwrap();
        restored.load(&store).unwrap();

        let mut out = ValueVector::new(&ty);
        out.set_len(2);
        restored.scan(0, 2, &mut out, 0).unwrap();
        let entry = out.list_entry(0);
        assert_eq!(entry.len, 2);
        let inner = out.list_child().list_entry(entry.offset as usize);
        assert_eq!(inner.len, 1);
        assert_eq!(
            out.list_child().list_child().get_i64(inner.offset as usize),
            1
        );
        let inner = out.list_child().list_entry(entry.offset as usize + 1);
        assert_eq!(inner.len, 2);
        assert_eq!(
            out.list_child().list_child().get_i64(inner.offset as usize),
            2
        );
        let entry = out.list_entry(1);
        assert_eq!(entry.len, 1);
        assert_eq!(
            out.list_child().list_entry(entry.offset as usize).len,
            0
        );
    }
}
