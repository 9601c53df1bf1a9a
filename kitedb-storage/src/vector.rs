use crate::bitmap::{Bitmap, BitmapTrueIndexIter};
use kitedb_datatype::{InternalId, LogicalType, PhysicalType};

/// Number of rows a full vector carries, and the granularity of
/// version tracking inside a node group.
pub const VECTOR_CAPACITY: usize = 2048;

/// Width of one vector slot. InternalId keeps its table id in memory
/// and collapses to the 8-byte offset only on disk.
#[inline]
pub fn vector_fixed_len(ty: PhysicalType) -> usize {
    match ty {
        PhysicalType::InternalId => InternalId::STORE_LEN,
        _ => match ty.fixed_len() {
            Some(w) => w,
            None => 0,
        },
    }
}

/// One list value: a span into the flattened child vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListEntry {
    pub offset: u64,
    pub len: u32,
}

enum VectorData {
    Fixed {
        width: usize,
        buf: Vec<u8>,
    },
    String {
        /// (heap offset, byte length) per row.
        views: Vec<(u32, u32)>,
        heap: Vec<u8>,
    },
    List {
        entries: Vec<ListEntry>,
        child: Box<ValueVector>,
    },
    Struct {
        children: Vec<ValueVector>,
    },
}

/// Columnar batch of values exchanged between the storage layer and
/// its callers. Nested types carry child vectors; list children are
/// flattened and may exceed [`VECTOR_CAPACITY`].
pub struct ValueVector {
    ty: LogicalType,
    physical: PhysicalType,
    len: usize,
    /// Bit set means the row is null. Bits beyond len stay zero.
    nulls: Vec<u64>,
    data: VectorData,
}

impl ValueVector {
    pub fn new(ty: &LogicalType) -> Self {
        let physical = ty.physical_type();
        let data = match ty {
            LogicalType::String => VectorData::String {
                views: Vec::new(),
                heap: Vec::new(),
            },
            LogicalType::List(child) | LogicalType::Array(child, _) => VectorData::List {
                entries: Vec::new(),
                child: Box::new(ValueVector::new(child)),
            },
            LogicalType::Struct(fields) => VectorData::Struct {
                children: fields.iter().map(|f| ValueVector::new(&f.ty)).collect(),
            },
            _ => VectorData::Fixed {
                width: vector_fixed_len(physical),
                buf: Vec::new(),
            },
        };
        ValueVector {
            ty: ty.clone(),
            physical,
            len: 0,
            nulls: Vec::new(),
            data,
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
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resize to n rows. New rows come up valid and zeroed.
    pub fn set_len(&mut self, n: usize) {
        self.nulls.resize(n.div_ceil(64), 0);
        if n < self.len {
            // keep bits beyond len zero.
            let words = self.nulls.len();
            self.nulls.bitmap_unset_range(n, words * 64);
        }
        match &mut self.data {
            VectorData::Fixed { width, buf } => buf.resize(n * *width, 0),
            VectorData::String { views, heap } => {
                views.resize(n, (0, 0));
                if n == 0 {
                    heap.clear();
                }
            }
            VectorData::List { entries, child } => {
                entries.resize(n, ListEntry::default());
                if n == 0 {
                    child.set_len(0);
                }
            }
            VectorData::Struct { children } => {
                for child in children {
                    child.set_len(n);
                }
            }
        }
        self.len = n;
    }

    /// Reset to an empty batch, dropping heap content.
    #[inline]
    pub fn reset(&mut self) {
        self.nulls.fill(0);
        self.set_len(0);
    }

    #[inline]
    pub fn is_null(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        self.nulls.bitmap_get(idx)
    }

    #[inline]
    pub fn set_null(&mut self, idx: usize, is_null: bool) {
        debug_assert!(idx < self.len);
        if is_null {
            self.nulls.bitmap_set(idx);
        } else {
            self.nulls.bitmap_unset(idx);
        }
    }

    /// Returns whether any row is null.
    #[inline]
    pub fn may_have_nulls(&self) -> bool {
        self.nulls.bitmap_count_ones(self.len) > 0
    }

    #[inline]
    pub fn fixed_width(&self) -> usize {
        match &self.data {
            VectorData::Fixed { width, .. } => *width,
            _ => unreachable!("fixed width of non-leaf vector"),
        }
    }

    #[inline]
    pub fn fixed_buf(&self) -> &[u8] {
        match &self.data {
            VectorData::Fixed { buf, .. } => buf,
            _ => unreachable!("fixed buffer of non-leaf vector"),
        }
    }

    #[inline]
    pub fn fixed_buf_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            VectorData::Fixed { buf, .. } => buf,
            _ => unreachable!("fixed buffer of non-leaf vector"),
        }
    }

    #[inline]
    pub fn read_fixed(&self, idx: usize) -> &[u8] {
        match &self.data {
            VectorData::Fixed { width, buf } => &buf[idx * width..(idx + 1) * width],
            _ => unreachable!("fixed slot of non-leaf vector"),
        }
    }

    #[inline]
    pub fn write_fixed(&mut self, idx: usize, bytes: &[u8]) {
        match &mut self.data {
            VectorData::Fixed { width, buf } => {
                debug_assert!(bytes.len() == *width);
                buf[idx * *width..(idx + 1) * *width].copy_from_slice(bytes);
            }
            _ => unreachable!("fixed slot of non-leaf vector"),
        }
    }

    #[inline]
    pub fn set_i64(&mut self, idx: usize, v: i64) {
        self.write_fixed(idx, &v.to_le_bytes());
    }

    #[inline]
    pub fn get_i64(&self, idx: usize) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.read_fixed(idx));
        i64::from_le_bytes(b)
    }

    #[inline]
    pub fn set_u64(&mut self, idx: usize, v: u64) {
        self.write_fixed(idx, &v.to_le_bytes());
    }

    #[inline]
    pub fn get_u64(&self, idx: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.read_fixed(idx));
        u64::from_le_bytes(b)
    }

    #[inline]
    pub fn set_u32(&mut self, idx: usize, v: u32) {
        self.write_fixed(idx, &v.to_le_bytes());
    }

    #[inline]
    pub fn get_u32(&self, idx: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.read_fixed(idx));
        u32::from_le_bytes(b)
    }

    #[inline]
    pub fn set_f64(&mut self, idx: usize, v: f64) {
        self.write_fixed(idx, &v.to_le_bytes());
    }

    #[inline]
    pub fn get_f64(&self, idx: usize) -> f64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.read_fixed(idx));
        f64::from_le_bytes(b)
    }

    #[inline]
    pub fn set_bool(&mut self, idx: usize, v: bool) {
        self.write_fixed(idx, &[v as u8]);
    }

    #[inline]
    pub fn get_bool(&self, idx: usize) -> bool {
        self.read_fixed(idx)[0] != 0
    }

    #[inline]
    pub fn set_internal_id(&mut self, idx: usize, id: InternalId) {
        let mut bytes = [0u8; InternalId::STORE_LEN];
        id.write_to(&mut bytes);
        self.write_fixed(idx, &bytes);
    }

    #[inline]
    pub fn get_internal_id(&self, idx: usize) -> InternalId {
        InternalId::read_from(self.read_fixed(idx))
    }

    #[inline]
    pub fn set_string(&mut self, idx: usize, s: &[u8]) {
        match &mut self.data {
            VectorData::String { views, heap } => {
                views[idx] = (heap.len() as u32, s.len() as u32);
                heap.extend_from_slice(s);
            }
            _ => unreachable!("string slot of non-string vector"),
        }
    }

    #[inline]
    pub fn get_string(&self, idx: usize) -> &[u8] {
        match &self.data {
            VectorData::String { views, heap } => {
                let (offset, len) = views[idx];
                &heap[offset as usize..(offset + len) as usize]
            }
            _ => unreachable!("string slot of non-string vector"),
        }
    }

    /// Reserve child space for a list value at idx, returns the child
    /// start offset. The caller fills child rows [offset, offset+len).
    #[inline]
    pub fn set_list_entry(&mut self, idx: usize, len: u32) -> u64 {
        match &mut self.data {
            VectorData::List { entries, child } => {
                let offset = child.len() as u64;
                child.set_len(offset as usize + len as usize);
                entries[idx] = ListEntry { offset, len };
                offset
            }
            _ => unreachable!("list entry of non-list vector"),
        }
    }

    #[inline]
    pub fn list_entry(&self, idx: usize) -> ListEntry {
        match &self.data {
            VectorData::List { entries, .. } => entries[idx],
            _ => unreachable!("list entry of non-list vector"),
        }
    }

    #[inline]
    pub fn list_child(&self) -> &ValueVector {
        match &self.data {
            VectorData::List { child, .. } => child,
            _ => unreachable!("child of non-list vector"),
        }
    }

    #[inline]
    pub fn list_child_mut(&mut self) -> &mut ValueVector {
        match &mut self.data {
            VectorData::List { child, .. } => child,
            _ => unreachable!("child of non-list vector"),
        }
    }

    #[inline]
    pub fn struct_children(&self) -> &[ValueVector] {
        match &self.data {
            VectorData::Struct { children } => children,
            _ => unreachable!("children of non-struct vector"),
        }
    }

    #[inline]
    pub fn struct_child(&self, i: usize) -> &ValueVector {
        &self.struct_children()[i]
    }

    #[inline]
    pub fn struct_child_mut(&mut self, i: usize) -> &mut ValueVector {
        match &mut self.data {
            VectorData::Struct { children } => &mut children[i],
            _ => unreachable!("children of non-struct vector"),
        }
    }
}

/// Rows of one vector surviving visibility checks.
pub struct SelectionVector {
    bits: Vec<u64>,
    len: usize,
}

impl SelectionVector {
    #[inline]
    pub fn all(len: usize) -> Self {
        let mut bits = vec![0u64; len.div_ceil(64)];
        bits.bitmap_set_range(0, len);
        SelectionVector { bits, len }
    }

    #[inline]
    pub fn none(len: usize) -> Self {
        SelectionVector {
            bits: vec![0u64; len.div_ceil(64)],
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn select(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.bits.bitmap_set(idx);
    }

    #[inline]
    pub fn deselect(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.bits.bitmap_unset(idx);
    }

    #[inline]
    pub fn is_selected(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        self.bits.bitmap_get(idx)
    }

    #[inline]
    pub fn num_selected(&self) -> usize {
        self.bits.bitmap_count_ones(self.len)
    }

    /// Iterate selected row indexes in order.
    #[inline]
    pub fn iter(&self) -> BitmapTrueIndexIter<'_> {
        self.bits.bitmap_true_index_iter(self.len)
    }
}
