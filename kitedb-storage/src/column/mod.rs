//! Column engines.
//!
//! A [`Column`] is the stateless counterpart of a [`ColumnChunk`]: it
//! knows the data type, the compression policy and, for nested types,
//! the child columns, but no row data. Chunks are passed into every
//! call, so a single column drives all row groups of a table.
//!
//! Scans served from an in-memory chunk read its buffers directly.
//! Scans against an evicted chunk read straight from the page store,
//! touching only the pages that cover the requested rows.

mod dictionary;
mod list;
mod string;
mod strukt;

use crate::chunk::null::NullChunk;
use crate::chunk::{
    load_slot_range, slot_width, ChunkBody, ColumnChunk, ColumnChunkMetadata, ResidencyState,
};
use crate::error::{Error, Result};
use crate::page::PageStore;
use crate::vector::ValueVector;
use kitedb_datatype::{InternalId, LogicalType, PhysicalType, TableId};
use semistr::SemiStr;

/// Policy knobs for [`Column::checkpoint`].
pub struct CheckpointOptions {
    /// Whether an out-of-place rewrite may split the chunk into
    /// several smaller ones.
    pub can_split: bool,
    /// Maximum rows per output chunk when splitting.
    pub split_rows: usize,
}

/// Result of reconciling a chunk with its persisted pages.
pub enum CheckpointOutcome {
    /// The existing pages were rewritten in place. The chunk keeps its
    /// page run, with refreshed statistics.
    InPlace(ColumnChunk),
    /// The chunk moved to freshly allocated pages, possibly split into
    /// several. The old pages have been returned to the store.
    OutOfPlace(Vec<ColumnChunk>),
}

enum Variant {
    Plain,
    String,
    List { data: Box<Column> },
    Struct { children: Vec<Column> },
}

pub struct Column {
    name: SemiStr,
    ty: LogicalType,
    physical: PhysicalType,
    enable_compression: bool,
    variant: Variant,
}

impl Column {
    pub fn new(name: &str, ty: &LogicalType, enable_compression: bool) -> Self {
        let variant = match ty {
            LogicalType::String => Variant::String,
            LogicalType::List(..) | LogicalType::Array(..) => Variant::List {
                data: Box::new(Column::new(
                    &format!("{}.data", name),
                    ty.child_type(),
                    enable_compression,
                )),
            },
            LogicalType::Struct(fields) => Variant::Struct {
                children: fields
                    .iter()
                    .map(|f| {
                        Column::new(&format!("{}.{}", name, f.name), &f.ty, enable_compression)
                    })
                    .collect(),
            },
            _ => Variant::Plain,
        };
        Column {
            name: SemiStr::new(name),
            physical: ty.physical_type(),
            ty: ty.clone(),
            enable_compression,
            variant,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn logical_type(&self) -> &LogicalType {
        &self.ty
    }

    #[inline]
    pub fn enable_compression(&self) -> bool {
        self.enable_compression
    }

    /// Whether an out-of-place checkpoint may split this column's
    /// chunks. String and nested chunks move as one unit.
    #[inline]
    pub fn can_split_segment(&self) -> bool {
        matches!(self.variant, Variant::Plain)
    }

    /// Creates an empty chunk of this column's type.
    #[inline]
    pub fn new_chunk(&self, capacity: usize, nullable: bool) -> ColumnChunk {
        ColumnChunk::new(&self.ty, capacity, nullable)
    }

    /// Reads rows [start, start+count) of chunk into out at out_start,
    /// from memory or from disk depending on residency.
    pub fn scan(
        &self,
        store: &dyn PageStore,
        chunk: &ColumnChunk,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) -> Result<()> {
        if chunk.residency() == ResidencyState::InMemory {
            return chunk.scan(start, count, out, out_start);
        }
        if start + count > chunk.num_values() {
            return Err(Error::IndexOutOfBound);
        }
        if count == 0 {
            return Ok(());
        }
        let meta = match chunk.metadata() {
            Some(meta) => meta,
            None => return Err(Error::InvalidState),
        };
        let nulls = self.scan_null_mask(store, chunk, start, count, out, out_start)?;
        match (&self.variant, chunk.body()) {
            (Variant::Plain, ChunkBody::Fixed(f)) => self.scan_fixed_disk(
                store,
                meta,
                f.common_table(),
                start,
                count,
                out,
                out_start,
            )?,
            (Variant::String, ChunkBody::String(s)) => {
                string::scan_disk(store, s, meta, nulls.as_ref(), start, count, out, out_start)?
            }
            (Variant::List { data }, ChunkBody::List(l)) => list::scan_disk(
                data,
                store,
                l,
                meta,
                nulls.as_ref(),
                start,
                count,
                out,
                out_start,
            )?,
            (Variant::Struct { children }, ChunkBody::Struct(st)) => {
                strukt::scan_disk(children, store, st, start, count, out, out_start)?
            }
            _ => unreachable!("column/chunk type mismatch"),
        }
        Ok(())
    }

    /// Reads a single row.
    #[inline]
    pub fn lookup(
        &self,
        store: &dyn PageStore,
        chunk: &ColumnChunk,
        row: usize,
        out: &mut ValueVector,
        out_idx: usize,
    ) -> Result<()> {
        self.scan(store, chunk, row, 1, out, out_idx)
    }

    /// Loads the persisted null mask, marks nulls in out and hands the
    /// mask back for the body scan to skip those rows.
    fn scan_null_mask(
        &self,
        store: &dyn PageStore,
        chunk: &ColumnChunk,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) -> Result<Option<NullChunk>> {
        let nulls = match chunk.nulls() {
            Some(nulls) => nulls,
            None => return Ok(None),
        };
        let meta = match nulls.metadata() {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let mut mask = NullChunk::from_metadata(meta);
        mask.load(store, chunk.num_values())?;
        for k in 0..count {
            if mask.is_null(start + k) {
                out.set_null(out_start + k, true);
            }
        }
        Ok(Some(mask))
    }

    fn scan_fixed_disk(
        &self,
        store: &dyn PageStore,
        meta: &ColumnChunkMetadata,
        common_table: TableId,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) -> Result<()> {
        let width = slot_width(self.physical);
        let mut slots = vec![0u8; count * width];
        load_slot_range(store, self.physical, meta, start, count, &mut slots)?;
        if self.physical == PhysicalType::InternalId {
            // disk slots hold offsets only, the table id is shared.
            for k in 0..count {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&slots[k * 8..(k + 1) * 8]);
                let offset = u64::from_le_bytes(bytes);
                out.set_internal_id(out_start + k, InternalId::new(common_table, offset));
            }
        } else {
            out.fixed_buf_mut()[out_start * width..(out_start + count) * width]
                .copy_from_slice(&slots);
        }
        Ok(())
    }

    /// Reconciles an edited chunk with its pages.
    ///
    /// A chunk whose buffers still fit the persisted encoding is
    /// rewritten over its own pages. Anything else is finalized and
    /// flushed to fresh pages, splitting into `split_rows`-sized
    /// chunks when allowed, and the old pages are freed afterwards.
    pub fn checkpoint(
        &self,
        store: &dyn PageStore,
        mut chunk: ColumnChunk,
        opts: &CheckpointOptions,
    ) -> Result<CheckpointOutcome> {
        if chunk.residency() == ResidencyState::OnDisk {
            // no in-memory divergence to reconcile.
            return Ok(CheckpointOutcome::InPlace(chunk));
        }
        if chunk.metadata().is_some() && chunk.can_flush_in_place() {
            chunk.flush_in_place(store)?;
            return Ok(CheckpointOutcome::InPlace(chunk));
        }
        log::debug!(
            "column {} checkpoints {} rows out of place",
            self.name,
            chunk.num_values()
        );
        // Collect the old page runs before flushing: they are freed
        // only once the rewrite has fully succeeded.
        let mut reclaim = Vec::new();
        chunk.collect_page_runs(&mut reclaim);
        chunk.finalize()?;
        let mut chunks = Vec::new();
        if opts.can_split && self.can_split_segment() && chunk.num_values() > opts.split_rows {
            let nullable = chunk.nulls().is_some();
            let mut row = 0;
            while row < chunk.num_values() {
                let rows = opts.split_rows.min(chunk.num_values() - row);
                let mut split = ColumnChunk::new(&self.ty, opts.split_rows, nullable);
                split.write_chunk(0, &chunk, row, rows)?;
                split.flush(store, self.enable_compression)?;
                chunks.push(split);
                row += rows;
            }
        } else {
            chunk.flush(store, self.enable_compression)?;
            chunks.push(chunk);
        }
        for (page_idx, num_pages) in reclaim {
            store.free_pages(page_idx, num_pages as u64);
        }
        Ok(CheckpointOutcome::OutOfPlace(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MemPageStore;
    use crate::vector::SelectionVector;

    fn int64_column() -> Column {
        Column::new("score", &LogicalType::Int64, true)
    }

    fn int64_vector(values: &[Option<i64>]) -> ValueVector {
        let mut vector = ValueVector::new(&LogicalType::Int64);
        vector.set_len(values.len());
        for (i, v) in values.iter().enumerate() {
            match v {
                Some(v) => vector.set_i64(i, *v),
                None => vector.set_null(i, true),
            }
        }
        vector
    }

    #[test]
    fn test_fixed_disk_scan_matches_memory() {
        let store = MemPageStore::new(4, 64);
        let col = Column::new("score", &LogicalType::Int64, false);
        let n = 20_000;
        let values: Vec<Option<i64>> = (0..n)
            .map(|i| {
                if i % 97 == 0 {
                    None
                } else {
                    Some(i as i64 * 7 - 3)
                }
            })
            .collect();
        let mut chunk = col.new_chunk(n, true);
        chunk.append_all(&int64_vector(&values)).unwrap();
        chunk.flush(&store, false).unwrap();

        let mut from_mem = ValueVector::new(&LogicalType::Int64);
        from_mem.set_len(300);
        // window straddling the 8192-row page boundary.
        chunk.scan(8150, 300, &mut from_mem, 0).unwrap();

        chunk.evict();
        let mut from_disk = ValueVector::new(&LogicalType::Int64);
        from_disk.set_len(300);
        col.scan(&store, &chunk, 8150, 300, &mut from_disk, 0).unwrap();

        for k in 0..300 {
            assert_eq!(from_mem.is_null(k), from_disk.is_null(k));
            if !from_mem.is_null(k) {
                assert_eq!(from_mem.get_i64(k), from_disk.get_i64(k));
                assert_eq!(from_disk.get_i64(k), (8150 + k) as i64 * 7 - 3);
            }
        }
    }

    #[test]
    fn test_packed_disk_scan() {
        let store = MemPageStore::new(4, 16);
        let col = int64_column();
        let n = 3000;
        let values: Vec<Option<i64>> = (0..n).map(|i| Some(100 + (i % 16) as i64)).collect();
        let mut chunk = col.new_chunk(n, true);
        chunk.append_all(&int64_vector(&values)).unwrap();
        chunk.flush(&store, true).unwrap();
        let meta = chunk.metadata().unwrap();
        assert_eq!(meta.compression.n_bits, 4);

        chunk.evict();
        let mut out = ValueVector::new(&LogicalType::Int64);
        out.set_len(100);
        col.scan(&store, &chunk, 1000, 100, &mut out, 0).unwrap();
        for k in 0..100 {
            assert_eq!(out.get_i64(k), 100 + ((1000 + k) % 16) as i64);
        }
    }

    #[test]
    fn test_constant_disk_scan() {
        let store = MemPageStore::new(1, 4);
        let col = int64_column();
        let values: Vec<Option<i64>> = vec![Some(7); 500];
        let mut chunk = col.new_chunk(500, true);
        chunk.append_all(&int64_vector(&values)).unwrap();
        chunk.flush(&store, true).unwrap();
        assert_eq!(chunk.metadata().unwrap().num_pages, 0);

        chunk.evict();
        let mut out = ValueVector::new(&LogicalType::Int64);
        out.set_len(50);
        col.scan(&store, &chunk, 100, 50, &mut out, 0).unwrap();
        for k in 0..50 {
            assert_eq!(out.get_i64(k), 7);
        }
    }

    #[test]
    fn test_checkpoint_in_place() {
        let store = MemPageStore::new(4, 16);
        let col = int64_column();
        let values: Vec<Option<i64>> = (0..1000).map(|i| Some(100 + (i % 50) as i64)).collect();
        let mut chunk = col.new_chunk(1000, true);
        chunk.append_all(&int64_vector(&values)).unwrap();
        chunk.flush(&store, true).unwrap();
        let page_idx = chunk.metadata().unwrap().page_idx;
        let allocated = store.allocated_pages();

        // rewrite within the persisted delta window.
        chunk.write_value(10, &int64_vector(&[Some(130)]), 0).unwrap();
        let opts = CheckpointOptions {
            can_split: false,
            split_rows: 1000,
        };
        let chunk = match col.checkpoint(&store, chunk, &opts).unwrap() {
            CheckpointOutcome::InPlace(chunk) => chunk,
            CheckpointOutcome::OutOfPlace(_) => panic!("expected in-place checkpoint"),
        };
        assert_eq!(chunk.metadata().unwrap().page_idx, page_idx);
        assert_eq!(store.allocated_pages(), allocated);

        let mut out = ValueVector::new(&LogicalType::Int64);
        out.set_len(1);
        col.scan(&store, &chunk, 10, 1, &mut out, 0).unwrap();
        assert_eq!(out.get_i64(0), 130);
    }

    #[test]
    fn test_checkpoint_out_of_place_reclaims_pages() {
        let store = MemPageStore::new(4, 16);
        let col = int64_column();
        let values: Vec<Option<i64>> = (0..1000).map(|i| Some(100 + (i % 50) as i64)).collect();
        let mut chunk = col.new_chunk(1000, true);
        chunk.append_all(&int64_vector(&values)).unwrap();
        chunk.flush(&store, true).unwrap();
        let page_idx = chunk.metadata().unwrap().page_idx;
        let allocated = store.allocated_pages();

        // widening write breaks the delta window.
        chunk
            .write_value(10, &int64_vector(&[Some(1 << 40)]), 0)
            .unwrap();
        assert!(!chunk.can_flush_in_place());
        let opts = CheckpointOptions {
            can_split: false,
            split_rows: 1000,
        };
        let chunks = match col.checkpoint(&store, chunk, &opts).unwrap() {
            CheckpointOutcome::OutOfPlace(chunks) => chunks,
            CheckpointOutcome::InPlace(_) => panic!("expected out-of-place checkpoint"),
        };
        assert_eq!(chunks.len(), 1);
        assert_ne!(chunks[0].metadata().unwrap().page_idx, page_idx);
        // the rewrite allocated new pages and freed the old run.
        assert_eq!(store.allocated_pages(), allocated);

        let mut out = ValueVector::new(&LogicalType::Int64);
        out.set_len(1000);
        col.scan(&store, &chunks[0], 0, 1000, &mut out, 0).unwrap();
        assert_eq!(out.get_i64(10), 1 << 40);
        assert_eq!(out.get_i64(11), 100 + 11 % 50);
    }

    #[test]
    fn test_checkpoint_split() {
        let store = MemPageStore::new(4, 16);
        let col = int64_column();
        let values: Vec<Option<i64>> = (0..2500)
            .map(|i| if i % 100 == 0 { None } else { Some(i as i64) })
            .collect();
        let mut chunk = col.new_chunk(2500, true);
        chunk.append_all(&int64_vector(&values)).unwrap();

        let opts = CheckpointOptions {
            can_split: true,
            split_rows: 1000,
        };
        let chunks = match col.checkpoint(&store, chunk, &opts).unwrap() {
            CheckpointOutcome::OutOfPlace(chunks) => chunks,
            CheckpointOutcome::InPlace(_) => panic!("expected out-of-place checkpoint"),
        };
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].num_values(), 1000);
        assert_eq!(chunks[1].num_values(), 1000);
        assert_eq!(chunks[2].num_values(), 500);

        // read the middle chunk back from disk.
        let mut middle = chunks.into_iter().nth(1).unwrap();
        middle.evict();
        let mut out = ValueVector::new(&LogicalType::Int64);
        out.set_len(1000);
        col.scan(&store, &middle, 0, 1000, &mut out, 0).unwrap();
        for k in 0..1000 {
            let row = 1000 + k;
            if row % 100 == 0 {
                assert!(out.is_null(k));
            } else {
                assert_eq!(out.get_i64(k), row as i64);
            }
        }
    }

    #[test]
    fn test_scan_selected_append_then_disk_lookup() {
        let store = MemPageStore::new(1, 8);
        let col = int64_column();
        let vector = int64_vector(&[Some(1), Some(2), Some(3), Some(4)]);
        let mut sel = SelectionVector::all(4);
        sel.deselect(2);
        let mut chunk = col.new_chunk(16, true);
        chunk.append(&vector, &sel).unwrap();
        assert_eq!(chunk.num_values(), 3);
        chunk.flush(&store, true).unwrap();
        chunk.evict();

        let mut out = ValueVector::new(&LogicalType::Int64);
        out.set_len(1);
        col.lookup(&store, &chunk, 2, &mut out, 0).unwrap();
        assert_eq!(out.get_i64(0), 4);
    }
}
