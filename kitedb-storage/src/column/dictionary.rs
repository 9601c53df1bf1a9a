//! Read side of the persisted string dictionary.
//!
//! The write side lives in the string chunk: an in-memory hash table
//! interning entry bytes. Once flushed, the dictionary is an offsets
//! stream plus a blob page run. This state loads the offsets once per
//! scan, then reads only the blob bytes the scanned rows point at.

use crate::chunk::string::StringChunk;
use crate::chunk::{load_slots, read_byte_range, ColumnChunkMetadata};
use crate::error::{Error, Result};
use crate::page::PageStore;
use kitedb_datatype::PhysicalType;

pub(crate) struct DictionaryState {
    data_meta: ColumnChunkMetadata,
    /// End offset of each entry within the blob.
    offsets: Vec<u64>,
}

impl DictionaryState {
    pub(crate) fn load(store: &dyn PageStore, chunk: &StringChunk) -> Result<Self> {
        let data_meta = match chunk.dict_data_meta() {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let offsets_meta = match chunk.dict_offsets_meta() {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let mut offsets = vec![0u64; offsets_meta.num_values as usize];
        load_slots(
            store,
            PhysicalType::UInt64,
            &offsets_meta,
            bytemuck::cast_slice_mut(&mut offsets),
        )?;
        Ok(DictionaryState { data_meta, offsets })
    }

    #[inline]
    pub(crate) fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    /// Reads the bytes of one entry into buf.
    pub(crate) fn read_entry(
        &self,
        store: &dyn PageStore,
        id: u32,
        buf: &mut Vec<u8>,
    ) -> Result<()> {
        let id = id as usize;
        if id >= self.offsets.len() {
            return Err(Error::IndexOutOfBound);
        }
        let end = self.offsets[id] as usize;
        let start = if id == 0 {
            0
        } else {
            self.offsets[id - 1] as usize
        };
        buf.clear();
        buf.resize(end - start, 0);
        read_byte_range(store, self.data_meta.page_idx, start, end - start, buf)
    }
}
