//! Disk scan path for struct columns.

use crate::chunk::strukt::StructChunk;
use crate::column::Column;
use crate::error::Result;
use crate::page::PageStore;
use crate::vector::ValueVector;

/// Reads rows [start, start+count) of a persisted struct chunk by
/// fanning out to the field columns. The struct level itself stores
/// nothing beyond its null mask.
pub(crate) fn scan_disk(
    children: &[Column],
    store: &dyn PageStore,
    chunk: &StructChunk,
    start: usize,
    count: usize,
    out: &mut ValueVector,
    out_start: usize,
) -> Result<()> {
    debug_assert_eq!(children.len(), chunk.children().len());
    for (f, (col, child)) in children.iter().zip(chunk.children()).enumerate() {
        col.scan(
            store,
            child,
            start,
            count,
            out.struct_child_mut(f),
            out_start,
        )?;
    }
    Ok(())
}
