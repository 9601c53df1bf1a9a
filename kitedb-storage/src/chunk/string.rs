//! String chunk: per-row dictionary ids plus an interned blob.
//!
//! Three persisted streams back one chunk: the id stream (the chunk's
//! primary metadata), the dictionary blob and the dictionary offsets.
//! Overwrites can strand blob entries, so the first overwrite arms a
//! finalize pass that rebuilds the dictionary from the surviving rows.

use crate::chunk::dictionary::DictionaryChunk;
use crate::chunk::null::NullChunk;
use crate::chunk::{
    can_slots_fit, flush_slots, flush_slots_at, load_slots, read_byte_pages, write_byte_pages,
    write_bytes_at, ColumnChunkMetadata,
};
use crate::compression::CompressionMeta;
use crate::error::{Error, Result};
use crate::page::{PageId, PageStore, PAGE_SIZE};
use crate::serde::{expect_field_tag, field_tag_len, ser_field_tag, Deser, Ser, Serde};
use crate::vector::ValueVector;
use kitedb_datatype::PhysicalType;
use std::mem;

pub struct StringChunk {
    /// Per-row dictionary entry id. Null rows hold id zero.
    indices: Vec<u32>,
    dict: DictionaryChunk,
    /// Armed by the first overwrite. Until finalize runs, the
    /// dictionary may hold entries no row references anymore.
    needs_finalize: bool,
    dict_data_meta: Option<ColumnChunkMetadata>,
    dict_offsets_meta: Option<ColumnChunkMetadata>,
}

impl StringChunk {
    pub fn new() -> Self {
        StringChunk {
            indices: Vec::new(),
            dict: DictionaryChunk::new(),
            needs_finalize: false,
            dict_data_meta: None,
            dict_offsets_meta: None,
        }
    }

    #[inline]
    pub fn dict(&self) -> &DictionaryChunk {
        &self.dict
    }

    #[inline]
    pub(crate) fn dict_data_meta(&self) -> Option<&ColumnChunkMetadata> {
        self.dict_data_meta.as_ref()
    }

    #[inline]
    pub(crate) fn dict_offsets_meta(&self) -> Option<&ColumnChunkMetadata> {
        self.dict_offsets_meta.as_ref()
    }

    pub fn put_row(&mut self, row: usize, num_values: usize, bytes: &[u8]) {
        if row < num_values {
            self.needs_finalize = true;
        }
        if row >= self.indices.len() {
            self.indices.resize(row + 1, 0);
        }
        self.indices[row] = self.dict.add(bytes);
    }

    pub fn put_null_row(&mut self, row: usize, num_values: usize) {
        if row < num_values {
            // overwriting a value with null can strand its entry.
            self.needs_finalize = true;
        }
        if row >= self.indices.len() {
            self.indices.resize(row + 1, 0);
        }
        self.indices[row] = 0;
    }

    #[inline]
    pub fn read_row(&self, row: usize) -> &[u8] {
        self.dict.entry(self.indices[row])
    }

    pub fn scan(
        &self,
        nulls: Option<&NullChunk>,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) {
        for k in 0..count {
            if nulls.map_or(false, |n| n.is_null(start + k)) {
                continue;
            }
            out.set_string(out_start + k, self.read_row(start + k));
        }
    }

    /// Rebuilds the dictionary from the rows that survive, dropping
    /// dangling entries and remapping ids. No-op unless an overwrite
    /// armed it.
    pub fn finalize(&mut self, num_values: usize, nulls: Option<&NullChunk>) {
        if !self.needs_finalize {
            return;
        }
        let mut fresh = DictionaryChunk::new();
        for row in 0..num_values {
            if nulls.map_or(false, |n| n.is_null(row)) {
                self.indices[row] = 0;
                continue;
            }
            let id = fresh.add(self.dict.entry(self.indices[row]));
            self.indices[row] = id;
        }
        self.dict = fresh;
        self.needs_finalize = false;
    }

    pub fn flush(
        &mut self,
        store: &dyn PageStore,
        num_values: usize,
        enable_compression: bool,
    ) -> Result<ColumnChunkMetadata> {
        let meta = flush_slots(
            store,
            PhysicalType::UInt32,
            bytemuck::cast_slice(&self.indices[..num_values]),
            num_values,
            enable_compression,
        )?;
        let (blob_page, blob_pages) = write_byte_pages(store, self.dict.blob())?;
        self.dict_data_meta = Some(ColumnChunkMetadata {
            page_idx: blob_page,
            num_pages: blob_pages,
            num_values: self.dict.blob_len() as u64,
            compression: CompressionMeta::flat(),
        });
        self.dict_offsets_meta = Some(flush_slots(
            store,
            PhysicalType::UInt64,
            bytemuck::cast_slice(self.dict.offsets()),
            self.dict.num_entries(),
            enable_compression,
        )?);
        Ok(meta)
    }

    pub fn can_flush_in_place(&self, num_values: usize, meta: &ColumnChunkMetadata) -> bool {
        if !can_slots_fit(
            PhysicalType::UInt32,
            bytemuck::cast_slice(&self.indices[..num_values]),
            num_values,
            meta,
        ) {
            return false;
        }
        let (data_meta, offsets_meta) = match (&self.dict_data_meta, &self.dict_offsets_meta) {
            (Some(d), Some(o)) => (d, o),
            _ => return false,
        };
        if self.dict.blob_len() > data_meta.num_pages as usize * PAGE_SIZE {
            return false;
        }
        can_slots_fit(
            PhysicalType::UInt64,
            bytemuck::cast_slice(self.dict.offsets()),
            self.dict.num_entries(),
            offsets_meta,
        )
    }

    pub fn flush_in_place(
        &mut self,
        store: &dyn PageStore,
        num_values: usize,
        meta: &ColumnChunkMetadata,
    ) -> Result<ColumnChunkMetadata> {
        let new_meta = flush_slots_at(
            store,
            PhysicalType::UInt32,
            bytemuck::cast_slice(&self.indices[..num_values]),
            num_values,
            meta,
        )?;
        let (data_meta, offsets_meta) = match (&self.dict_data_meta, &self.dict_offsets_meta) {
            (Some(d), Some(o)) => (*d, *o),
            _ => return Err(Error::InvalidState),
        };
        if self.dict.blob_len() > data_meta.num_pages as usize * PAGE_SIZE {
            return Err(Error::InvalidState);
        }
        if !self.dict.blob().is_empty() {
            write_bytes_at(store, self.dict.blob(), data_meta.page_idx)?;
        }
        self.dict_data_meta = Some(ColumnChunkMetadata {
            num_values: self.dict.blob_len() as u64,
            ..data_meta
        });
        self.dict_offsets_meta = Some(flush_slots_at(
            store,
            PhysicalType::UInt64,
            bytemuck::cast_slice(self.dict.offsets()),
            self.dict.num_entries(),
            &offsets_meta,
        )?);
        Ok(new_meta)
    }

    pub fn load(&mut self, store: &dyn PageStore, meta: &ColumnChunkMetadata) -> Result<()> {
        let (data_meta, offsets_meta) = match (&self.dict_data_meta, &self.dict_offsets_meta) {
            (Some(d), Some(o)) => (*d, *o),
            _ => return Err(Error::InvalidState),
        };
        let num_values = meta.num_values as usize;
        self.indices.clear();
        self.indices.resize(num_values, 0);
        load_slots(
            store,
            PhysicalType::UInt32,
            meta,
            bytemuck::cast_slice_mut(&mut self.indices),
        )?;
        let num_entries = offsets_meta.num_values as usize;
        let mut offsets = vec![0u64; num_entries];
        load_slots(
            store,
            PhysicalType::UInt64,
            &offsets_meta,
            bytemuck::cast_slice_mut(&mut offsets),
        )?;
        let mut blob = vec![0u8; data_meta.num_values as usize];
        read_byte_pages(store, data_meta.page_idx, data_meta.num_pages, &mut blob)?;
        self.dict = DictionaryChunk::from_parts(blob, offsets);
        self.needs_finalize = false;
        Ok(())
    }

    pub fn evict(&mut self) {
        self.indices = Vec::new();
        self.dict = DictionaryChunk::new();
        self.needs_finalize = false;
    }

    pub fn reset(&mut self) {
        self.evict();
        self.dict_data_meta = None;
        self.dict_offsets_meta = None;
    }

    #[inline]
    pub fn in_mem_size(&self) -> usize {
        self.indices.len() * mem::size_of::<u32>() + self.dict.in_mem_size()
    }

    pub fn collect_page_runs(&self, out: &mut Vec<(PageId, u32)>) {
        for meta in [&self.dict_data_meta, &self.dict_offsets_meta].into_iter().flatten() {
            if meta.num_pages > 0 {
                out.push((meta.page_idx, meta.num_pages));
            }
        }
    }

    pub fn ser_extra_len(&self) -> usize {
        field_tag_len("dict")
            + self.dict_data_meta.ser_len()
            + field_tag_len("doff")
            + self.dict_offsets_meta.ser_len()
    }

    pub fn ser_extra<S: Serde + ?Sized>(&self, out: &mut S, idx: usize) -> usize {
        let idx = ser_field_tag(out, idx, "dict");
        let idx = self.dict_data_meta.ser(out, idx);
        let idx = ser_field_tag(out, idx, "doff");
        self.dict_offsets_meta.ser(out, idx)
    }

    pub fn deser_extra<S: Serde + ?Sized>(input: &S, idx: usize) -> Result<(usize, Self)> {
        let idx = expect_field_tag(input, idx, "dict")?;
        let (idx, dict_data_meta) = Option::<ColumnChunkMetadata>::deser(input, idx)?;
        let idx = expect_field_tag(input, idx, "doff")?;
        let (idx, dict_offsets_meta) = Option::<ColumnChunkMetadata>::deser(input, idx)?;
        Ok((
            idx,
            StringChunk {
                indices: Vec::new(),
                dict: DictionaryChunk::new(),
                needs_finalize: false,
                dict_data_meta,
                dict_offsets_meta,
            },
        ))
    }
}
