//! Disk scan path for list columns.

use crate::chunk::list::ListChunk;
use crate::chunk::null::NullChunk;
use crate::chunk::{load_slot_range, ColumnChunkMetadata};
use crate::column::Column;
use crate::error::{Error, Result};
use crate::page::PageStore;
use crate::vector::ValueVector;
use kitedb_datatype::PhysicalType;

/// Reads rows [start, start+count) of a persisted list chunk.
///
/// Loads the offset and size windows, then fetches children. When the
/// requested spans sit back to back in the data chunk they are fetched
/// with a single recursive scan, otherwise row by row.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_disk(
    data: &Column,
    store: &dyn PageStore,
    chunk: &ListChunk,
    meta: &ColumnChunkMetadata,
    nulls: Option<&NullChunk>,
    start: usize,
    count: usize,
    out: &mut ValueVector,
    out_start: usize,
) -> Result<()> {
    let sizes_meta = match chunk.sizes_meta() {
        Some(meta) => *meta,
        None => return Err(Error::InvalidState),
    };
    let mut offsets = vec![0u64; count];
    load_slot_range(
        store,
        PhysicalType::UInt64,
        meta,
        start,
        count,
        bytemuck::cast_slice_mut(&mut offsets),
    )?;
    let mut sizes = vec![0u32; count];
    load_slot_range(
        store,
        PhysicalType::UInt32,
        &sizes_meta,
        start,
        count,
        bytemuck::cast_slice_mut(&mut sizes),
    )?;

    let is_null = |k: usize| nulls.map_or(false, |n| n.is_null(start + k));

    let mut contiguous = true;
    let mut first_span = None;
    let mut expected = 0u64;
    let mut total = 0usize;
    for k in 0..count {
        if is_null(k) || sizes[k] == 0 {
            continue;
        }
        let span_start = offsets[k] - sizes[k] as u64;
        if first_span.is_none() {
            first_span = Some(span_start);
        } else if span_start != expected {
            contiguous = false;
            break;
        }
        expected = offsets[k];
        total += sizes[k] as usize;
    }

    if contiguous {
        let mut base = None;
        for k in 0..count {
            if is_null(k) {
                out.set_list_entry(out_start + k, 0);
                continue;
            }
            let child_offset = out.set_list_entry(out_start + k, sizes[k]);
            if base.is_none() && sizes[k] > 0 {
                base = Some(child_offset);
            }
        }
        if let (Some(first), Some(base)) = (first_span, base) {
            data.scan(
                store,
                chunk.data(),
                first as usize,
                total,
                out.list_child_mut(),
                base as usize,
            )?;
        }
        return Ok(());
    }

    // spans scattered by random writes, fetch them row by row.
    for k in 0..count {
        if is_null(k) {
            out.set_list_entry(out_start + k, 0);
            continue;
        }
        let len = sizes[k];
        let span_start = offsets[k] - len as u64;
        let child_offset = out.set_list_entry(out_start + k, len);
        if len > 0 {
            data.scan(
                store,
                chunk.data(),
                span_start as usize,
                len as usize,
                out.list_child_mut(),
                child_offset as usize,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::column::Column;
    use crate::page::MemPageStore;
    use crate::vector::ValueVector;
    use kitedb_datatype::LogicalType;

    fn list_i64_vector(rows: &[Option<&[i64]>]) -> ValueVector {
        let ty = LogicalType::list(LogicalType::Int64);
        let mut vector = ValueVector::new(&ty);
        vector.set_len(rows.len());
        for (i, row) in rows.iter().enumerate() {
            match row {
                Some(items) => {
                    let child_offset = vector.set_list_entry(i, items.len() as u32);
                    let child = vector.list_child_mut();
                    for (j, item) in items.iter().enumerate() {
                        child.set_i64(child_offset as usize + j, *item);
                    }
                }
                None => {
                    vector.set_null(i, true);
                }
            }
        }
        vector
    }

    fn read_list(out: &ValueVector, idx: usize) -> Option<Vec<i64>> {
        if out.is_null(idx) {
            return None;
        }
        let entry = out.list_entry(idx);
        let child = out.list_child();
        Some(
            (0..entry.len as usize)
                .map(|j| child.get_i64(entry.offset as usize + j))
                .collect(),
        )
    }

    #[test]
    fn test_list_disk_scan_window() {
        let store = MemPageStore::new(1, 16);
        let ty = LogicalType::list(LogicalType::Int64);
        let col = Column::new("edges", &ty, true);
        let n = 100;
        let rows: Vec<Vec<i64>> = (0..n).map(|i| vec![i as i64, i as i64 + 1]).collect();
        let mut chunk = col.new_chunk(n, true);
        for row in &rows {
            chunk
                .append_all(&list_i64_vector(&[Some(row.as_slice())]))
                .unwrap();
        }
        chunk.flush(&store, true).unwrap();
        chunk.evict();

        let mut out = ValueVector::new(&ty);
        out.set_len(20);
        col.scan(&store, &chunk, 40, 20, &mut out, 0).unwrap();
        for k in 0..20 {
            assert_eq!(read_list(&out, k).unwrap(), rows[40 + k]);
        }
    }

    #[test]
    fn test_list_disk_scan_with_nulls_and_empties() {
        let store = MemPageStore::new(1, 16);
        let ty = LogicalType::list(LogicalType::Int64);
        let col = Column::new("edges", &ty, true);
        let mut chunk = col.new_chunk(8, true);
        chunk
            .append_all(&list_i64_vector(&[
                Some(&[1, 2]),
                Some(&[]),
                None,
                Some(&[3]),
            ]))
            .unwrap();
        chunk.flush(&store, true).unwrap();
        chunk.evict();

        let mut out = ValueVector::new(&ty);
        out.set_len(4);
        col.scan(&store, &chunk, 0, 4, &mut out, 0).unwrap();
        assert_eq!(read_list(&out, 0).unwrap(), vec![1, 2]);
        assert_eq!(read_list(&out, 1).unwrap(), Vec::<i64>::new());
        assert!(read_list(&out, 2).is_none());
        assert_eq!(read_list(&out, 3).unwrap(), vec![3]);
    }

    #[test]
    fn test_list_disk_scan_scattered_spans() {
        let store = MemPageStore::new(1, 16);
        let ty = LogicalType::list(LogicalType::Int64);
        let col = Column::new("edges", &ty, true);
        let mut chunk = col.new_chunk(8, true);
        chunk
            .append_all(&list_i64_vector(&[
                Some(&[1, 2]),
                Some(&[3]),
                Some(&[4, 5, 6]),
            ]))
            .unwrap();
        // overwriting row 0 appends its new span at the data tail, so
        // the persisted spans are no longer back to back.
        chunk
            .write_value(0, &list_i64_vector(&[Some(&[7, 8])]), 0)
            .unwrap();
        chunk.flush(&store, true).unwrap();
        chunk.evict();

        let mut out = ValueVector::new(&ty);
        out.set_len(3);
        col.scan(&store, &chunk, 0, 3, &mut out, 0).unwrap();
        assert_eq!(read_list(&out, 0).unwrap(), vec![7, 8]);
        assert_eq!(read_list(&out, 1).unwrap(), vec![3]);
        assert_eq!(read_list(&out, 2).unwrap(), vec![4, 5, 6]);
    }

    #[test]
    fn test_nested_list_disk_scan() {
        let store = MemPageStore::new(1, 16);
        let ty = LogicalType::list(LogicalType::list(LogicalType::Int64));
        let col = Column::new("paths", &ty, true);
        let mut vector = ValueVector::new(&ty);
        vector.set_len(2);
        // row 0: [[1], [2, 3]], row 1: [[4]]
        let o0 = vector.set_list_entry(0, 2) as usize;
        let o1 = vector.set_list_entry(1, 1) as usize;
        {
            let inner = vector.list_child_mut();
            let i0 = inner.set_list_entry(o0, 1) as usize;
            let i1 = inner.set_list_entry(o0 + 1, 2) as usize;
            let i2 = inner.set_list_entry(o1, 1) as usize;
            let leaf = inner.list_child_mut();
            leaf.set_i64(i0, 1);
            leaf.set_i64(i1, 2);
            leaf.set_i64(i1 + 1, 3);
            leaf.set_i64(i2, 4);
        }
        let mut chunk = col.new_chunk(4, true);
        chunk.append_all(&vector).unwrap();
        chunk.flush(&store, true).unwrap();
        chunk.evict();

        let mut out = ValueVector::new(&ty);
        out.set_len(2);
        col.scan(&store, &chunk, 0, 2, &mut out, 0).unwrap();
        let outer0 = out.list_entry(0);
        assert_eq!(outer0.len, 2);
        let inner = out.list_child();
        let first = inner.list_entry(outer0.offset as usize);
        let second = inner.list_entry(outer0.offset as usize + 1);
        assert_eq!(first.len, 1);
        assert_eq!(second.len, 2);
        let leaf = inner.list_child();
        assert_eq!(leaf.get_i64(first.offset as usize), 1);
        assert_eq!(leaf.get_i64(second.offset as usize), 2);
        assert_eq!(leaf.get_i64(second.offset as usize + 1), 3);
        let outer1 = out.list_entry(1);
        assert_eq!(outer1.len, 1);
        let third = inner.list_entry(outer1.offset as usize);
        assert_eq!(leaf.get_i64(third.offset as usize), 4);
    }
}
