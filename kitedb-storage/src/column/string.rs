//! Disk scan path for string columns.

use crate::chunk::null::NullChunk;
use crate::chunk::string::StringChunk;
use crate::chunk::{load_slot_range, ColumnChunkMetadata};
use crate::column::dictionary::DictionaryState;
use crate::error::Result;
use crate::page::PageStore;
use crate::vector::ValueVector;
use kitedb_datatype::PhysicalType;

/// Reads rows [start, start+count) of a persisted string chunk.
///
/// Loads the index window and the dictionary offsets, then fetches
/// each referenced entry from the blob pages.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_disk(
    store: &dyn PageStore,
    chunk: &StringChunk,
    meta: &ColumnChunkMetadata,
    nulls: Option<&NullChunk>,
    start: usize,
    count: usize,
    out: &mut ValueVector,
    out_start: usize,
) -> Result<()> {
    let mut indices = vec![0u32; count];
    load_slot_range(
        store,
        PhysicalType::UInt32,
        meta,
        start,
        count,
        bytemuck::cast_slice_mut(&mut indices),
    )?;
    let dict = DictionaryState::load(store, chunk)?;
    let mut buf = Vec::new();
    for k in 0..count {
        if nulls.map_or(false, |n| n.is_null(start + k)) {
            continue;
        }
        dict.read_entry(store, indices[k], &mut buf)?;
        out.set_string(out_start + k, &buf);
    }
    Ok(())
}
