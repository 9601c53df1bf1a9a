//! Null mask stored as a 1-bit stream.
//!
//! The in-memory bitmap words double as the packed on-disk form, an
//! all-valid or all-null mask collapses to a zero-page constant run.

use crate::bitmap::Bitmap;
use crate::chunk::{read_byte_pages, write_byte_pages, write_bytes_at, ColumnChunkMetadata};
use crate::compression::{CompressionKind, CompressionMeta, MinMax};
use crate::error::{Error, Result};
use crate::page::{PageStore, INVALID_PAGE_ID, PAGE_SIZE};
use kitedb_datatype::StorageValue;

pub struct NullChunk {
    /// Bit set means null. Bits beyond the value count stay zero.
    bits: Vec<u64>,
    metadata: Option<ColumnChunkMetadata>,
}

impl NullChunk {
    pub fn new(capacity: usize) -> Self {
        NullChunk {
            bits: vec![0u64; capacity.div_ceil(64)],
            metadata: None,
        }
    }

    pub fn from_metadata(metadata: ColumnChunkMetadata) -> Self {
        NullChunk {
            bits: Vec::new(),
            metadata: Some(metadata),
        }
    }

    #[inline]
    pub fn metadata(&self) -> Option<&ColumnChunkMetadata> {
        self.metadata.as_ref()
    }

    #[inline]
    pub fn is_null(&self, idx: usize) -> bool {
        self.bits.bitmap_get(idx)
    }

    #[inline]
    pub fn set_null(&mut self, idx: usize, null: bool) {
        if null {
            self.bits.bitmap_set(idx);
        } else {
            self.bits.bitmap_unset(idx);
        }
    }

    #[inline]
    pub fn set_null_range(&mut self, start: usize, end: usize) {
        self.bits.bitmap_set_range(start, end);
    }

    #[inline]
    pub fn num_nulls(&self, len: usize) -> usize {
        self.bits.bitmap_count_ones(len)
    }

    #[inline]
    pub fn may_have_nulls(&self, len: usize) -> bool {
        self.num_nulls(len) != 0
    }

    pub fn resize(&mut self, new_capacity: usize) {
        self.bits.resize(new_capacity.div_ceil(64), 0);
    }

    pub fn reset(&mut self, new_capacity: usize) {
        self.bits.clear();
        self.bits.resize(new_capacity.div_ceil(64), 0);
    }

    #[inline]
    pub fn in_mem_size(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn evict(&mut self) {
        debug_assert!(self.metadata.is_some());
        self.bits = Vec::new();
    }

    /// Writes the mask to fresh pages, or to none at all when it is
    /// constant over the value count.
    pub fn flush(&mut self, store: &dyn PageStore, num_values: usize) -> Result<()> {
        let nulls = self.num_nulls(num_values);
        if nulls == 0 || nulls == num_values {
            self.metadata = Some(constant_metadata(num_values, nulls != 0));
            return Ok(());
        }
        let num_bytes = num_values.div_ceil(8);
        let bytes = &bytemuck::cast_slice::<u64, u8>(&self.bits)[..num_bytes];
        let (page_idx, num_pages) = write_byte_pages(store, bytes)?;
        self.metadata = Some(ColumnChunkMetadata {
            page_idx,
            num_pages,
            num_values: num_values as u64,
            compression: bit_stream_compression(),
        });
        Ok(())
    }

    pub fn can_flush_in_place(&self, num_values: usize) -> bool {
        let meta = match &self.metadata {
            Some(meta) => meta,
            None => return false,
        };
        let nulls = self.num_nulls(num_values);
        if meta.num_pages == 0 {
            // constant run must stay the same constant.
            let was_null = constant_is_null(meta);
            if was_null {
                nulls == num_values
            } else {
                nulls == 0
            }
        } else {
            num_values.div_ceil(8) <= meta.num_pages as usize * PAGE_SIZE
        }
    }

    pub fn flush_in_place(&mut self, store: &dyn PageStore, num_values: usize) -> Result<()> {
        let meta = match &self.metadata {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let nulls = self.num_nulls(num_values);
        if meta.num_pages == 0 {
            debug_assert!(nulls == 0 || nulls == num_values);
            self.metadata = Some(constant_metadata(num_values, nulls != 0));
            return Ok(());
        }
        let num_bytes = num_values.div_ceil(8);
        if num_bytes > meta.num_pages as usize * PAGE_SIZE {
            return Err(Error::InvalidState);
        }
        let bytes = &bytemuck::cast_slice::<u64, u8>(&self.bits)[..num_bytes];
        write_bytes_at(store, bytes, meta.page_idx)?;
        self.metadata = Some(ColumnChunkMetadata {
            num_values: num_values as u64,
            ..meta
        });
        Ok(())
    }

    pub fn load(&mut self, store: &dyn PageStore, capacity: usize) -> Result<()> {
        let meta = match &self.metadata {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let num_values = meta.num_values as usize;
        self.reset(capacity.max(num_values));
        if meta.num_pages == 0 {
            if constant_is_null(&meta) {
                self.bits.bitmap_set_range(0, num_values);
            }
            return Ok(());
        }
        let num_bytes = num_values.div_ceil(8);
        let bytes = &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.bits)[..num_bytes];
        read_byte_pages(store, meta.page_idx, meta.num_pages, bytes)
    }
}

fn constant_metadata(num_values: usize, all_null: bool) -> ColumnChunkMetadata {
    ColumnChunkMetadata {
        page_idx: INVALID_PAGE_ID,
        num_pages: 0,
        num_values: num_values as u64,
        compression: CompressionMeta {
            kind: CompressionKind::ForBitpacking,
            n_bits: 0,
            min_max: Some(MinMax {
                min: StorageValue::Bool(all_null),
                max: StorageValue::Bool(all_null),
            }),
        },
    }
}

fn bit_stream_compression() -> CompressionMeta {
    CompressionMeta {
        kind: CompressionKind::ForBitpacking,
        n_bits: 1,
        min_max: Some(MinMax {
            min: StorageValue::Bool(false),
            max: StorageValue::Bool(true),
        }),
    }
}

#[inline]
fn constant_is_null(meta: &ColumnChunkMetadata) -> bool {
    match meta.compression.min_max {
        Some(MinMax {
            min: StorageValue::Bool(b),
            ..
        }) => b,
        _ => false,
    }
}
