//! Columnar chunks: in-memory buffers of one logical type that flush
//! to page runs and reload on demand.
//!
//! A chunk owns up to capacity rows. Nested types fan out into
//! sub-chunks: strings into a dictionary plus an index stream, lists
//! into offset/size streams plus a child chunk, structs into one chunk
//! per field. The null mask is a 1-bit sub-chunk shared by all shapes.

pub mod dictionary;
pub mod list;
pub mod null;
pub mod string;
pub mod strukt;

use crate::compression::{pack_slots, unpack_slots, CompressionKind, CompressionMeta, MinMax};
use crate::error::{Error, Result};
use crate::page::{PageId, PageStore, INVALID_PAGE_ID, PAGE_SIZE};
use crate::serde::{expect_field_tag, field_tag_len, ser_field_tag, Deser, Ser, Serde};
use crate::vector::{SelectionVector, ValueVector};
use kitedb_datatype::{InternalId, LogicalType, PhysicalType, TableId, INVALID_TABLE_ID};
use list::ListChunk;
use null::NullChunk;
use std::mem;
use string::StringChunk;
use strukt::StructChunk;

/// Whether chunk buffers are materialized or only reachable through
/// the page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyState {
    InMemory,
    OnDisk,
}

/// Persisted location and encoding of one flushed stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnChunkMetadata {
    /// First page of the allocated run. INVALID_PAGE_ID when the
    /// stream occupies no pages.
    pub page_idx: PageId,
    /// Pages allocated for the run. May exceed the pages currently
    /// used, the slack absorbs in-place growth.
    pub num_pages: u32,
    pub num_values: u64,
    pub compression: CompressionMeta,
}

impl Ser<'_> for ColumnChunkMetadata {
    #[inline]
    fn ser_len(&self) -> usize {
        field_tag_len("page")
            + mem::size_of::<u64>()
            + field_tag_len("npag")
            + mem::size_of::<u32>()
            + field_tag_len("nval")
            + mem::size_of::<u64>()
            + field_tag_len("comp")
            + self.compression.ser_len()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let idx = ser_field_tag(out, start_idx, "page");
        let idx = out.ser_u64(idx, self.page_idx);
        let idx = ser_field_tag(out, idx, "npag");
        let idx = out.ser_u32(idx, self.num_pages);
        let idx = ser_field_tag(out, idx, "nval");
        let idx = out.ser_u64(idx, self.num_values);
        let idx = ser_field_tag(out, idx, "comp");
        self.compression.ser(out, idx)
    }
}

impl Deser for ColumnChunkMetadata {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let idx = expect_field_tag(input, start_idx, "page")?;
        let (idx, page_idx) = input.deser_u64(idx)?;
        let idx = expect_field_tag(input, idx, "npag")?;
        let (idx, num_pages) = input.deser_u32(idx)?;
        let idx = expect_field_tag(input, idx, "nval")?;
        let (idx, num_values) = input.deser_u64(idx)?;
        let idx = expect_field_tag(input, idx, "comp")?;
        let (idx, compression) = CompressionMeta::deser(input, idx)?;
        Ok((
            idx,
            ColumnChunkMetadata {
                page_idx,
                num_pages,
                num_values,
                compression,
            },
        ))
    }
}

/// Writes a raw byte stream to freshly allocated pages.
pub(crate) fn write_byte_pages(store: &dyn PageStore, bytes: &[u8]) -> Result<(PageId, u32)> {
    if bytes.is_empty() {
        return Ok((INVALID_PAGE_ID, 0));
    }
    let num_pages = bytes.len().div_ceil(PAGE_SIZE);
    let page_idx = store.allocate_pages(num_pages as u64)?;
    write_bytes_at(store, bytes, page_idx)?;
    Ok((page_idx, num_pages as u32))
}

/// Rewrites a byte stream into an already allocated page run.
pub(crate) fn write_bytes_at(store: &dyn PageStore, bytes: &[u8], page_idx: PageId) -> Result<()> {
    let num_pages = bytes.len().div_ceil(PAGE_SIZE);
    let mut page = vec![0u8; PAGE_SIZE];
    for p in 0..num_pages {
        let start = p * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(bytes.len());
        if end - start == PAGE_SIZE {
            store.write_page(page_idx + p as u64, &bytes[start..end])?;
        } else {
            page.fill(0);
            page[..end - start].copy_from_slice(&bytes[start..end]);
            store.write_page(page_idx + p as u64, &page)?;
        }
    }
    Ok(())
}

/// Reads a byte stream back from a page run. Out may be shorter than
/// the run, trailing page bytes are padding.
pub(crate) fn read_byte_pages(
    store: &dyn PageStore,
    page_idx: PageId,
    num_pages: u32,
    out: &mut [u8],
) -> Result<()> {
    let mut page = vec![0u8; PAGE_SIZE];
    for p in 0..num_pages as usize {
        let start = p * PAGE_SIZE;
        if start >= out.len() {
            break;
        }
        let end = (start + PAGE_SIZE).min(out.len());
        if end - start == PAGE_SIZE {
            store.read_page(page_idx + p as u64, &mut out[start..end])?;
        } else {
            store.read_page(page_idx + p as u64, &mut page)?;
            out[start..end].copy_from_slice(&page[..end - start]);
        }
    }
    Ok(())
}

/// Analyzes and flushes a fixed-width slot buffer to fresh pages.
pub(crate) fn flush_slots(
    store: &dyn PageStore,
    ty: PhysicalType,
    buf: &[u8],
    num_values: usize,
    enable_compression: bool,
) -> Result<ColumnChunkMetadata> {
    let width = slot_width(ty);
    let compression = CompressionMeta::analyze(ty, buf, num_values, enable_compression);
    let num_pages = compression.num_pages_for(num_values as u64, width);
    if num_pages == 0 {
        return Ok(ColumnChunkMetadata {
            page_idx: INVALID_PAGE_ID,
            num_pages: 0,
            num_values: num_values as u64,
            compression,
        });
    }
    let page_idx = store.allocate_pages(num_pages)?;
    write_slot_pages(store, ty, &compression, buf, num_values, page_idx, num_pages)?;
    Ok(ColumnChunkMetadata {
        page_idx,
        num_pages: num_pages as u32,
        num_values: num_values as u64,
        compression,
    })
}

/// Rewrites a slot buffer into its existing page run, preserving the
/// encoding and refreshing statistics.
///
/// The caller must have verified the fit with [`can_slots_fit`]. The
/// packed minimum stays untouched since it is the encoding reference;
/// only the recorded maximum tracks the data.
pub(crate) fn flush_slots_at(
    store: &dyn PageStore,
    ty: PhysicalType,
    buf: &[u8],
    num_values: usize,
    old: &ColumnChunkMetadata,
) -> Result<ColumnChunkMetadata> {
    let width = slot_width(ty);
    let mut compression = old.compression;
    if let Some(new_mm) = CompressionMeta::analyze(ty, buf, num_values, false).min_max {
        match (&mut compression.min_max, compression.kind) {
            (Some(mm), CompressionKind::ForBitpacking) => mm.max = new_mm.max,
            (Some(mm), CompressionKind::Flat) => *mm = new_mm,
            (None, _) => {}
        }
    }
    let used_pages = compression.num_pages_for(num_values as u64, width);
    if used_pages > old.num_pages as u64 {
        return Err(Error::InvalidState);
    }
    if used_pages > 0 {
        write_slot_pages(store, ty, &compression, buf, num_values, old.page_idx, used_pages)?;
    }
    Ok(ColumnChunkMetadata {
        page_idx: old.page_idx,
        num_pages: old.num_pages,
        num_values: num_values as u64,
        compression,
    })
}

fn write_slot_pages(
    store: &dyn PageStore,
    ty: PhysicalType,
    compression: &CompressionMeta,
    buf: &[u8],
    num_values: usize,
    page_idx: PageId,
    num_pages: u64,
) -> Result<()> {
    let width = slot_width(ty);
    let vpp = compression.values_per_page(width) as usize;
    let mut page = vec![0u8; PAGE_SIZE];
    for p in 0..num_pages as usize {
        let start = p * vpp;
        let end = ((p + 1) * vpp).min(num_values);
        page.fill(0);
        pack_slots(ty, compression, buf, start, end, &mut page);
        store.write_page(page_idx + p as u64, &page)?;
    }
    Ok(())
}

/// Reloads a slot buffer persisted by [`flush_slots`]. Dst must hold
/// at least num_values slots.
pub(crate) fn load_slots(
    store: &dyn PageStore,
    ty: PhysicalType,
    meta: &ColumnChunkMetadata,
    dst: &mut [u8],
) -> Result<()> {
    load_slot_range(store, ty, meta, 0, meta.num_values as usize, dst)
}

/// Reads slots [start, start+count) of a persisted stream into dst,
/// touching only the pages that cover the range.
pub(crate) fn load_slot_range(
    store: &dyn PageStore,
    ty: PhysicalType,
    meta: &ColumnChunkMetadata,
    start: usize,
    count: usize,
    dst: &mut [u8],
) -> Result<()> {
    let width = slot_width(ty);
    debug_assert!(start + count <= meta.num_values as usize);
    debug_assert!(dst.len() >= count * width);
    if count == 0 {
        return Ok(());
    }
    if meta.num_pages == 0 {
        // constant run, no pages to read.
        unpack_slots(ty, &meta.compression, &[], dst, 0, count);
        return Ok(());
    }
    let vpp = meta.compression.values_per_page(width) as usize;
    let first = start / vpp;
    let last = (start + count - 1) / vpp;
    let mut page = vec![0u8; PAGE_SIZE];
    let mut slots = Vec::new();
    for p in first..=last {
        let page_start = p * vpp;
        let page_end = ((p + 1) * vpp).min(meta.num_values as usize);
        store.read_page(meta.page_idx + p as u64, &mut page)?;
        // unpack the page's full value run, then copy the overlap.
        let n = page_end - page_start;
        slots.clear();
        slots.resize(n * width, 0);
        unpack_slots(ty, &meta.compression, &page, &mut slots, 0, n);
        let lo = start.max(page_start);
        let hi = (start + count).min(page_end);
        dst[(lo - start) * width..(hi - start) * width]
            .copy_from_slice(&slots[(lo - page_start) * width..(hi - page_start) * width]);
    }
    Ok(())
}

/// Reads bytes [start, start+len) of a flat byte stream.
pub(crate) fn read_byte_range(
    store: &dyn PageStore,
    page_idx: PageId,
    start: usize,
    len: usize,
    out: &mut [u8],
) -> Result<()> {
    let mut page = vec![0u8; PAGE_SIZE];
    let mut copied = 0;
    while copied < len {
        let byte = start + copied;
        let p = byte / PAGE_SIZE;
        let offset = byte % PAGE_SIZE;
        let n = (PAGE_SIZE - offset).min(len - copied);
        store.read_page(page_idx + p as u64, &mut page)?;
        out[copied..copied + n].copy_from_slice(&page[offset..offset + n]);
        copied += n;
    }
    Ok(())
}

/// Returns whether a slot buffer can be rewritten into the page run
/// described by meta without changing the encoding.
pub(crate) fn can_slots_fit(
    ty: PhysicalType,
    buf: &[u8],
    num_values: usize,
    meta: &ColumnChunkMetadata,
) -> bool {
    let width = slot_width(ty);
    if meta.compression.num_pages_for(num_values as u64, width) > meta.num_pages as u64 {
        return false;
    }
    match meta.compression.kind {
        CompressionKind::Flat => true,
        CompressionKind::ForBitpacking => {
            // extremes inside the delta window cover every value.
            match CompressionMeta::analyze(ty, buf, num_values, false).min_max {
                Some(mm) => {
                    meta.compression.can_represent(mm.min) && meta.compression.can_represent(mm.max)
                }
                None => true,
            }
        }
    }
}

#[inline]
pub(crate) fn slot_width(ty: PhysicalType) -> usize {
    match ty.fixed_len() {
        Some(w) => w,
        None => unreachable!("slot width of nested type"),
    }
}

/// Leaf chunk: fixed-width slots, zeroed where null.
pub(crate) struct FixedChunk {
    width: usize,
    buf: Vec<u8>,
    /// Internal id chunks remember the table shared by all rows.
    common_table: TableId,
}

impl FixedChunk {
    fn new(ty: PhysicalType, capacity: usize) -> Self {
        let width = slot_width(ty);
        FixedChunk {
            width,
            buf: vec![0u8; capacity * width],
            common_table: INVALID_TABLE_ID,
        }
    }

    fn from_metadata(ty: PhysicalType, common_table: TableId) -> Self {
        FixedChunk {
            width: slot_width(ty),
            buf: Vec::new(),
            common_table,
        }
    }

    #[inline]
    fn write_row(&mut self, ty: PhysicalType, row: usize, vector: &ValueVector, idx: usize) {
        if ty == PhysicalType::InternalId {
            let id = vector.get_internal_id(idx);
            if self.common_table == INVALID_TABLE_ID {
                self.common_table = id.table;
            }
            debug_assert!(self.common_table == id.table);
            self.buf[row * 8..row * 8 + 8].copy_from_slice(&id.offset.to_le_bytes());
        } else {
            self.buf[row * self.width..(row + 1) * self.width]
                .copy_from_slice(vector.read_fixed(idx));
        }
    }

    #[inline]
    fn write_null(&mut self, row: usize) {
        self.buf[row * self.width..(row + 1) * self.width].fill(0);
    }

    #[inline]
    pub(crate) fn common_table(&self) -> TableId {
        self.common_table
    }

    fn copy_rows(&mut self, src: &FixedChunk, dst_row: usize, src_row: usize, num_rows: usize) {
        debug_assert!(self.width == src.width);
        if self.common_table == INVALID_TABLE_ID {
            self.common_table = src.common_table;
        }
        let w = self.width;
        self.buf[dst_row * w..(dst_row + num_rows) * w]
            .copy_from_slice(&src.buf[src_row * w..(src_row + num_rows) * w]);
    }

    fn scan(
        &self,
        ty: PhysicalType,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) {
        if ty == PhysicalType::InternalId {
            for k in 0..count {
                let mut b = [0u8; 8];
                b.copy_from_slice(&self.buf[(start + k) * 8..(start + k + 1) * 8]);
                let offset = u64::from_le_bytes(b);
                out.set_internal_id(out_start + k, InternalId::new(self.common_table, offset));
            }
        } else {
            let w = self.width;
            out.fixed_buf_mut()[out_start * w..(out_start + count) * w]
                .copy_from_slice(&self.buf[start * w..(start + count) * w]);
        }
    }
}

pub(crate) enum ChunkBody {
    Fixed(FixedChunk),
    String(StringChunk),
    List(ListChunk),
    Struct(StructChunk),
}

impl ChunkBody {
    fn new(ty: &LogicalType, capacity: usize) -> Self {
        match ty {
            LogicalType::String => ChunkBody::String(StringChunk::new()),
            LogicalType::List(..) | LogicalType::Array(..) => {
                ChunkBody::List(ListChunk::new(ty.child_type(), capacity))
            }
            LogicalType::Struct(fields) => ChunkBody::Struct(StructChunk::new(fields, capacity)),
            _ => ChunkBody::Fixed(FixedChunk::new(ty.physical_type(), capacity)),
        }
    }

    fn ser_extra_len(&self) -> usize {
        match self {
            ChunkBody::Fixed(_) => field_tag_len("ctab") + mem::size_of::<u64>(),
            ChunkBody::String(s) => s.ser_extra_len(),
            ChunkBody::List(l) => l.ser_extra_len(),
            ChunkBody::Struct(st) => st.ser_extra_len(),
        }
    }

    fn ser_extra<S: Serde + ?Sized>(&self, out: &mut S, idx: usize) -> usize {
        match self {
            ChunkBody::Fixed(f) => {
                let idx = ser_field_tag(out, idx, "ctab");
                out.ser_u64(idx, f.common_table)
            }
            ChunkBody::String(s) => s.ser_extra(out, idx),
            ChunkBody::List(l) => l.ser_extra(out, idx),
            ChunkBody::Struct(st) => st.ser_extra(out, idx),
        }
    }
}

/// Buffer of up to capacity values of one logical type.
///
/// The chunk is exclusively owned by the node group containing it.
/// Flushing writes to freshly allocated pages and records metadata;
/// rewriting previously flushed pages is the column's checkpoint
/// decision, not an implicit side effect of any write.
pub struct ColumnChunk {
    ty: LogicalType,
    physical: PhysicalType,
    num_values: usize,
    capacity: usize,
    residency: ResidencyState,
    metadata: Option<ColumnChunkMetadata>,
    nulls: Option<NullChunk>,
    body: ChunkBody,
}

impl ColumnChunk {
    pub fn new(ty: &LogicalType, capacity: usize, nullable: bool) -> Self {
        ColumnChunk {
            ty: ty.clone(),
            physical: ty.physical_type(),
            num_values: 0,
            capacity,
            residency: ResidencyState::InMemory,
            metadata: None,
            nulls: if nullable {
                Some(NullChunk::new(capacity))
            } else {
                None
            },
            body: ChunkBody::new(ty, capacity),
        }
    }

    #[inline]
    pub fn logical_type(&self) -> &LogicalType {
        &self.ty
    }

    #[inline]
    pub fn physical_type(&self) -> PhysicalType {
        self.physical
    }

    #[inline]
    pub fn num_values(&self) -> usize {
        self.num_values
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn residency(&self) -> ResidencyState {
        self.residency
    }

    #[inline]
    pub fn metadata(&self) -> Option<&ColumnChunkMetadata> {
        self.metadata.as_ref()
    }

    #[inline]
    pub fn nulls(&self) -> Option<&NullChunk> {
        self.nulls.as_ref()
    }

    #[inline]
    pub(crate) fn body(&self) -> &ChunkBody {
        &self.body
    }

    #[inline]
    pub fn is_null(&self, row: usize) -> bool {
        self.nulls.as_ref().map_or(false, |n| n.is_null(row))
    }

    /// Current min/max statistics: persisted ones when flushed, else
    /// computed from the live buffer of leaf chunks.
    pub fn min_max(&self) -> Option<MinMax> {
        if let Some(meta) = &self.metadata {
            return meta.compression.min_max;
        }
        match &self.body {
            ChunkBody::Fixed(f) if self.residency == ResidencyState::InMemory => {
                CompressionMeta::analyze(self.physical, &f.buf, self.num_values, false).min_max
            }
            _ => None,
        }
    }

    /// Appends the selected rows of a vector. The caller must have
    /// resized the chunk to hold them.
    pub fn append(&mut self, vector: &ValueVector, sel: &SelectionVector) -> Result<()> {
        debug_assert!(sel.len() == vector.len());
        for idx in sel.iter() {
            self.append_one(vector, idx)?;
        }
        Ok(())
    }

    pub fn append_all(&mut self, vector: &ValueVector) -> Result<()> {
        self.append_range(vector, 0, vector.len())
    }

    pub(crate) fn append_range(
        &mut self,
        vector: &ValueVector,
        start: usize,
        count: usize,
    ) -> Result<()> {
        for idx in start..start + count {
            self.append_one(vector, idx)?;
        }
        Ok(())
    }

    pub(crate) fn append_one(&mut self, vector: &ValueVector, idx: usize) -> Result<()> {
        let row = self.num_values;
        debug_assert!(row < self.capacity, "append beyond chunk capacity");
        let is_null = vector.is_null(idx);
        if let Some(nulls) = &mut self.nulls {
            nulls.set_null(row, is_null);
        } else if is_null {
            return Err(Error::InvalidArgument);
        }
        match &mut self.body {
            ChunkBody::Fixed(f) => {
                if is_null {
                    f.write_null(row);
                } else {
                    f.write_row(self.physical, row, vector, idx);
                }
            }
            ChunkBody::String(s) => {
                if is_null {
                    s.put_null_row(row, row);
                } else {
                    s.put_row(row, row, vector.get_string(idx));
                }
            }
            ChunkBody::List(l) => {
                if is_null {
                    l.put_null_row(row, row);
                } else {
                    l.put_row(row, row, vector.list_child(), vector.list_entry(idx))?;
                }
            }
            ChunkBody::Struct(st) => st.append_row(vector, idx)?,
        }
        self.num_values = row + 1;
        Ok(())
    }

    /// Random-access point write. A row beyond the current count
    /// materializes the intervening rows as null, a row beyond the
    /// capacity grows the chunk.
    pub fn write_value(&mut self, row: usize, vector: &ValueVector, idx: usize) -> Result<()> {
        if row >= self.capacity {
            let new_cap = (row + 1).max(self.capacity * 2);
            self.resize(new_cap);
        }
        let overwrite = row < self.num_values;
        let is_null = vector.is_null(idx);
        if !overwrite && row > self.num_values {
            match &mut self.nulls {
                Some(nulls) => nulls.set_null_range(self.num_values, row),
                None => return Err(Error::InvalidArgument),
            }
        }
        if let Some(nulls) = &mut self.nulls {
            nulls.set_null(row, is_null);
        } else if is_null {
            return Err(Error::InvalidArgument);
        }
        let num_values = self.num_values;
        match &mut self.body {
            ChunkBody::Fixed(f) => {
                if is_null {
                    f.write_null(row);
                } else {
                    f.write_row(self.physical, row, vector, idx);
                }
            }
            ChunkBody::String(s) => {
                if is_null {
                    s.put_null_row(row, num_values);
                } else {
                    s.put_row(row, num_values, vector.get_string(idx));
                }
            }
            ChunkBody::List(l) => {
                if is_null {
                    l.put_null_row(row, num_values);
                } else {
                    l.put_row(row, num_values, vector.list_child(), vector.list_entry(idx))?;
                }
            }
            ChunkBody::Struct(st) => st.write_row(row, vector, idx)?,
        }
        if !overwrite {
            self.num_values = row + 1;
        }
        Ok(())
    }

    /// Copies a contiguous row range from another chunk of the same
    /// type, growing capacity as needed.
    pub fn write_chunk(
        &mut self,
        dst_row: usize,
        src: &ColumnChunk,
        src_row: usize,
        num_rows: usize,
    ) -> Result<()> {
        debug_assert!(self.physical == src.physical);
        debug_assert!(dst_row <= self.num_values);
        if src.residency != ResidencyState::InMemory {
            return Err(Error::InvalidState);
        }
        if src_row + num_rows > src.num_values {
            return Err(Error::IndexOutOfBound);
        }
        if num_rows == 0 {
            return Ok(());
        }
        if dst_row + num_rows > self.capacity {
            let new_cap = (dst_row + num_rows).max(self.capacity * 2);
            self.resize(new_cap);
        }
        for k in 0..num_rows {
            let is_null = src.is_null(src_row + k);
            match &mut self.nulls {
                Some(nulls) => nulls.set_null(dst_row + k, is_null),
                None if is_null => return Err(Error::InvalidArgument),
                None => {}
            }
        }
        let num_values = self.num_values;
        match (&mut self.body, &src.body) {
            (ChunkBody::Fixed(dst), ChunkBody::Fixed(s)) => {
                dst.copy_rows(s, dst_row, src_row, num_rows)
            }
            (ChunkBody::String(dst), ChunkBody::String(s)) => {
                for k in 0..num_rows {
                    if src.is_null(src_row + k) {
                        dst.put_null_row(dst_row + k, num_values);
                    } else {
                        dst.put_row(dst_row + k, num_values, s.read_row(src_row + k));
                    }
                }
            }
            (ChunkBody::List(dst), ChunkBody::List(s)) => {
                for k in 0..num_rows {
                    if src.is_null(src_row + k) {
                        dst.put_null_row(dst_row + k, num_values);
                    } else {
                        dst.copy_row_from(dst_row + k, num_values, s, src_row + k)?;
                    }
                }
            }
            (ChunkBody::Struct(dst), ChunkBody::Struct(s)) => {
                dst.copy_rows_from(dst_row, s, src_row, num_rows)?
            }
            _ => unreachable!("chunk type mismatch"),
        }
        self.num_values = self.num_values.max(dst_row + num_rows);
        Ok(())
    }

    /// Copies rows [start, start+count) into out at out_start. The
    /// output vector must already be sized to hold them.
    pub fn scan(
        &self,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) -> Result<()> {
        if self.residency != ResidencyState::InMemory {
            return Err(Error::InvalidState);
        }
        if start + count > self.num_values {
            return Err(Error::IndexOutOfBound);
        }
        if let Some(nulls) = &self.nulls {
            for k in 0..count {
                if nulls.is_null(start + k) {
                    out.set_null(out_start + k, true);
                }
            }
        }
        match &self.body {
            ChunkBody::Fixed(f) => f.scan(self.physical, start, count, out, out_start),
            ChunkBody::String(s) => s.scan(self.nulls.as_ref(), start, count, out, out_start),
            ChunkBody::List(l) => l.scan(self.nulls.as_ref(), start, count, out, out_start)?,
            ChunkBody::Struct(st) => st.scan(start, count, out, out_start)?,
        }
        Ok(())
    }

    /// Single-row random read.
    pub fn lookup(&self, row: usize, out: &mut ValueVector, out_idx: usize) -> Result<()> {
        self.scan(row, 1, out, out_idx)
    }

    /// Grows capacity, preserving content.
    pub fn resize(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        if let Some(nulls) = &mut self.nulls {
            nulls.resize(new_capacity);
        }
        match &mut self.body {
            ChunkBody::Fixed(f) => f.buf.resize(new_capacity * f.width, 0),
            // offset/index streams grow with writes; the list data
            // chunk manages its own capacity.
            ChunkBody::String(_) | ChunkBody::List(_) => {}
            ChunkBody::Struct(st) => {
                for child in &mut st.children {
                    child.resize(new_capacity);
                }
            }
        }
        self.capacity = new_capacity;
    }

    /// Reallocates to the new capacity, dropping all content. The
    /// empty chunk is in memory afterwards even if it had been
    /// evicted; any persisted pages stay claimed by its metadata.
    pub fn resize_without_preserve(&mut self, new_capacity: usize) {
        self.residency = ResidencyState::InMemory;
        self.num_values = 0;
        if let Some(nulls) = &mut self.nulls {
            nulls.reset(new_capacity);
        }
        match &mut self.body {
            ChunkBody::Fixed(f) => {
                f.buf.clear();
                f.buf.resize(new_capacity * f.width, 0);
            }
            ChunkBody::String(s) => s.reset(),
            ChunkBody::List(l) => l.reset(),
            ChunkBody::Struct(st) => {
                for child in &mut st.children {
                    child.resize_without_preserve(new_capacity);
                }
            }
        }
        self.capacity = new_capacity;
    }

    /// Type-specific compaction before flushing: dictionary rebuild
    /// for strings, offset-sort rewrite for lists, no-op for leaves.
    pub fn finalize(&mut self) -> Result<()> {
        let num_values = self.num_values;
        match &mut self.body {
            ChunkBody::Fixed(_) => {}
            ChunkBody::String(s) => s.finalize(num_values, self.nulls.as_ref()),
            ChunkBody::List(l) => l.finalize(num_values, self.nulls.as_ref())?,
            ChunkBody::Struct(st) => {
                for child in &mut st.children {
                    child.finalize()?;
                }
            }
        }
        Ok(())
    }

    /// Writes the chunk and its sub-chunks to freshly allocated pages
    /// and records metadata. Never touches previously flushed pages.
    pub fn flush(&mut self, store: &dyn PageStore, enable_compression: bool) -> Result<()> {
        debug_assert!(self.residency == ResidencyState::InMemory);
        let num_values = self.num_values;
        if let Some(nulls) = &mut self.nulls {
            nulls.flush(store, num_values)?;
        }
        let meta = match &mut self.body {
            ChunkBody::Fixed(f) => flush_slots(
                store,
                self.physical,
                &f.buf[..num_values * f.width],
                num_values,
                enable_compression,
            )?,
            ChunkBody::String(s) => s.flush(store, num_values, enable_compression)?,
            ChunkBody::List(l) => l.flush(store, num_values, enable_compression)?,
            ChunkBody::Struct(st) => {
                for child in &mut st.children {
                    child.flush(store, enable_compression)?;
                }
                // pure fan-out, no pages of its own.
                ColumnChunkMetadata {
                    page_idx: INVALID_PAGE_ID,
                    num_pages: 0,
                    num_values: num_values as u64,
                    compression: CompressionMeta::flat(),
                }
            }
        };
        self.metadata = Some(meta);
        Ok(())
    }

    /// Returns whether the current content can be rewritten into the
    /// already allocated pages without re-encoding any stream.
    pub fn can_flush_in_place(&self) -> bool {
        let meta = match &self.metadata {
            Some(meta) => *meta,
            None => return false,
        };
        if let Some(nulls) = &self.nulls {
            if !nulls.can_flush_in_place(self.num_values) {
                return false;
            }
        }
        match &self.body {
            ChunkBody::Fixed(f) => {
                can_slots_fit(self.physical, &f.buf, self.num_values, &meta)
            }
            ChunkBody::String(s) => s.can_flush_in_place(self.num_values, &meta),
            ChunkBody::List(l) => l.can_flush_in_place(self.num_values, &meta),
            ChunkBody::Struct(st) => st.children.iter().all(|c| c.can_flush_in_place()),
        }
    }

    /// Rewrites the chunk into its existing page runs. Checked by
    /// [`ColumnChunk::can_flush_in_place`] beforehand.
    pub fn flush_in_place(&mut self, store: &dyn PageStore) -> Result<()> {
        debug_assert!(self.residency == ResidencyState::InMemory);
        let meta = match &self.metadata {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let num_values = self.num_values;
        if let Some(nulls) = &mut self.nulls {
            nulls.flush_in_place(store, num_values)?;
        }
        let new_meta = match &mut self.body {
            ChunkBody::Fixed(f) => flush_slots_at(
                store,
                self.physical,
                &f.buf[..num_values * f.width],
                num_values,
                &meta,
            )?,
            ChunkBody::String(s) => s.flush_in_place(store, num_values, &meta)?,
            ChunkBody::List(l) => l.flush_in_place(store, num_values, &meta)?,
            ChunkBody::Struct(st) => {
                for child in &mut st.children {
                    child.flush_in_place(store)?;
                }
                ColumnChunkMetadata {
                    num_values: num_values as u64,
                    ..meta
                }
            }
        };
        self.metadata = Some(new_meta);
        Ok(())
    }

    /// Materializes buffers from the page store.
    pub fn load(&mut self, store: &dyn PageStore) -> Result<()> {
        if self.residency == ResidencyState::InMemory {
            return Ok(());
        }
        let meta = match &self.metadata {
            Some(meta) => *meta,
            None => return Err(Error::InvalidState),
        };
        let capacity = self.capacity;
        if let Some(nulls) = &mut self.nulls {
            nulls.load(store, capacity)?;
        }
        let physical = self.physical;
        match &mut self.body {
            ChunkBody::Fixed(f) => {
                f.buf.clear();
                f.buf.resize(capacity * f.width, 0);
                load_slots(store, physical, &meta, &mut f.buf)?;
            }
            ChunkBody::String(s) => s.load(store, &meta)?,
            ChunkBody::List(l) => l.load(store, &meta)?,
            ChunkBody::Struct(st) => {
                for child in &mut st.children {
                    child.load(store)?;
                }
            }
        }
        self.residency = ResidencyState::InMemory;
        Ok(())
    }

    /// Drops in-memory buffers, keeping only metadata.
    pub fn evict(&mut self) {
        debug_assert!(self.metadata.is_some(), "evicting unflushed chunk");
        if let Some(nulls) = &mut self.nulls {
            nulls.evict();
        }
        match &mut self.body {
            ChunkBody::Fixed(f) => f.buf = Vec::new(),
            ChunkBody::String(s) => s.evict(),
            ChunkBody::List(l) => l.evict(),
            ChunkBody::Struct(st) => {
                for child in &mut st.children {
                    child.evict();
                }
            }
        }
        self.residency = ResidencyState::OnDisk;
    }

    /// Bytes held by in-memory buffers, including sub-chunks.
    pub fn in_mem_size(&self) -> usize {
        let nulls = self.nulls.as_ref().map_or(0, |n| n.in_mem_size());
        nulls
            + match &self.body {
                ChunkBody::Fixed(f) => f.buf.len(),
                ChunkBody::String(s) => s.in_mem_size(),
                ChunkBody::List(l) => l.in_mem_size(),
                ChunkBody::Struct(st) => st.children.iter().map(|c| c.in_mem_size()).sum(),
            }
    }

    /// Pages allocated on disk across all streams of this chunk.
    pub fn num_disk_pages(&self) -> u64 {
        let mut runs = Vec::new();
        self.collect_page_runs(&mut runs);
        runs.iter().map(|(_, n)| *n as u64).sum()
    }

    /// Collects every allocated page run for reclamation.
    pub fn collect_page_runs(&self, out: &mut Vec<(PageId, u32)>) {
        let mut push = |meta: Option<&ColumnChunkMetadata>| {
            if let Some(meta) = meta {
                if meta.num_pages > 0 {
                    out.push((meta.page_idx, meta.num_pages));
                }
            }
        };
        push(self.metadata.as_ref());
        push(self.nulls.as_ref().and_then(|n| n.metadata()));
        match &self.body {
            ChunkBody::Fixed(_) => {}
            ChunkBody::String(s) => s.collect_page_runs(out),
            ChunkBody::List(l) => l.collect_page_runs(out),
            ChunkBody::Struct(st) => {
                for child in &st.children {
                    child.collect_page_runs(out);
                }
            }
        }
    }
}

impl Ser<'_> for ColumnChunk {
    fn ser_len(&self) -> usize {
        let null_meta = self.nulls.as_ref().and_then(|n| n.metadata().copied());
        field_tag_len("type")
            + self.ty.ser_len()
            + field_tag_len("nval")
            + mem::size_of::<u64>()
            + field_tag_len("capa")
            + mem::size_of::<u64>()
            + field_tag_len("meta")
            + self.metadata.ser_len()
            + field_tag_len("null")
            + null_meta.ser_len()
            + self.body.ser_extra_len()
    }

    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        debug_assert!(self.metadata.is_some(), "serializing unflushed chunk");
        let null_meta = self.nulls.as_ref().and_then(|n| n.metadata().copied());
        let idx = ser_field_tag(out, start_idx, "type");
        let idx = self.ty.ser(out, idx);
        let idx = ser_field_tag(out, idx, "nval");
        let idx = out.ser_u64(idx, self.num_values as u64);
        let idx = ser_field_tag(out, idx, "capa");
        let idx = out.ser_u64(idx, self.capacity as u64);
        let idx = ser_field_tag(out, idx, "meta");
        let idx = self.metadata.ser(out, idx);
        let idx = ser_field_tag(out, idx, "null");
        let idx = null_meta.ser(out, idx);
        self.body.ser_extra(out, idx)
    }
}

impl Deser for ColumnChunk {
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let idx = expect_field_tag(input, start_idx, "type")?;
        let (idx, ty) = LogicalType::deser(input, idx)?;
        let idx = expect_field_tag(input, idx, "nval")?;
        let (idx, num_values) = input.deser_u64(idx)?;
        let idx = expect_field_tag(input, idx, "capa")?;
        let (idx, capacity) = input.deser_u64(idx)?;
        let idx = expect_field_tag(input, idx, "meta")?;
        let (idx, metadata) = Option::<ColumnChunkMetadata>::deser(input, idx)?;
        let idx = expect_field_tag(input, idx, "null")?;
        let (idx, null_meta) = Option::<ColumnChunkMetadata>::deser(input, idx)?;
        let physical = ty.physical_type();
        let (idx, body) = match physical {
            PhysicalType::String => {
                let (idx, s) = StringChunk::deser_extra(input, idx)?;
                (idx, ChunkBody::String(s))
            }
            PhysicalType::List => {
                let (idx, l) = ListChunk::deser_extra(input, idx)?;
                (idx, ChunkBody::List(l))
            }
            PhysicalType::Struct => {
                let (idx, st) = StructChunk::deser_extra(input, idx)?;
                if st.children.len() != ty.struct_fields().len() {
                    return Err(Error::InvalidFormat);
                }
                (idx, ChunkBody::Struct(st))
            }
            _ => {
                let idx = expect_field_tag(input, idx, "ctab")?;
                let (idx, common_table) = input.deser_u64(idx)?;
                (idx, ChunkBody::Fixed(FixedChunk::from_metadata(physical, common_table)))
            }
        };
        let nulls = null_meta.map(NullChunk::from_metadata);
        Ok((
            idx,
            ColumnChunk {
                ty,
                physical,
                num_values: num_values as usize,
                capacity: capacity as usize,
                residency: ResidencyState::OnDisk,
                metadata,
                nulls,
                body,
            },
        ))
    }
}
