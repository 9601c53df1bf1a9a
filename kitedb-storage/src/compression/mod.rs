pub mod bitpacking;

use crate::compression::bitpacking::{pack_values, unpack_values, width_for};
use crate::error::{Error, Result};
use crate::page::PAGE_SIZE;
use crate::serde::{Deser, Ser, Serde};
use kitedb_datatype::{PhysicalType, StorageValue};
use std::cmp::Ordering;
use std::mem;

/// Physical encoding of a persisted chunk.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    /// Values stored as fixed-width slots without transformation.
    Flat = 1,
    /// Frame-of-reference deltas packed at n_bits per value.
    ForBitpacking = 2,
}

impl CompressionKind {
    #[inline]
    pub fn from_u8(v: u8) -> Result<Self> {
        let res = match v {
            1 => CompressionKind::Flat,
            2 => CompressionKind::ForBitpacking,
            _ => return Err(Error::InvalidFormat),
        };
        Ok(res)
    }
}

/// Min/max statistics of a chunk, tracked for leaf types that support them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMax {
    pub min: StorageValue,
    pub max: StorageValue,
}

/// Encoding decision plus statistics for one chunk.
///
/// Statistics are recomputed from full data on each checkpoint, never
/// maintained incrementally, so deletes and overwrites cannot leave
/// them stale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionMeta {
    pub kind: CompressionKind,
    /// Packed bits per value. Only meaningful for ForBitpacking;
    /// 0 encodes a constant chunk that occupies no data pages.
    pub n_bits: u8,
    pub min_max: Option<MinMax>,
}

impl CompressionMeta {
    #[inline]
    pub fn flat() -> Self {
        CompressionMeta {
            kind: CompressionKind::Flat,
            n_bits: 0,
            min_max: None,
        }
    }

    /// Scan len slots and decide the encoding.
    ///
    /// Types without min/max support and floats always stay flat.
    /// Integer families pack when the value range spans fewer bits
    /// than the slot width.
    #[inline]
    pub fn analyze(ty: PhysicalType, buf: &[u8], len: usize, enable_compression: bool) -> Self {
        let width = match ty.fixed_len() {
            Some(w) => w,
            None => unreachable!("compression analysis on non-leaf type"),
        };
        if !ty.has_min_max() || len == 0 {
            return CompressionMeta::flat();
        }
        let mut min = StorageValue::from_slot(ty, buf, 0);
        let mut max = min;
        for i in 1..len {
            let v = StorageValue::from_slot(ty, buf, i);
            min = min.min(v);
            max = max.max(v);
        }
        let min_max = Some(MinMax { min, max });
        let packable = !matches!(ty, PhysicalType::Float32 | PhysicalType::Float64);
        if packable && enable_compression {
            let n_bits = width_for(min.to_bits(), max.to_bits());
            if n_bits < width * 8 {
                return CompressionMeta {
                    kind: CompressionKind::ForBitpacking,
                    n_bits: n_bits as u8,
                    min_max,
                };
            }
        }
        CompressionMeta {
            kind: CompressionKind::Flat,
            n_bits: 0,
            min_max,
        }
    }

    /// Returns whether the value can be stored without re-encoding
    /// the chunk.
    ///
    /// A packed chunk accepts any value whose delta from the stored
    /// minimum fits in n_bits, even above the recorded maximum.
    #[inline]
    pub fn can_represent(&self, value: StorageValue) -> bool {
        match self.kind {
            CompressionKind::Flat => true,
            CompressionKind::ForBitpacking => {
                let mm = match &self.min_max {
                    Some(mm) => mm,
                    None => return false,
                };
                if value.compare(&mm.min) == Ordering::Less {
                    return false;
                }
                let delta = value.to_bits().wrapping_sub(mm.min.to_bits());
                64 - delta.leading_zeros() as usize <= self.n_bits as usize
            }
        }
    }

    /// Returns how many values one page can hold for a slot of
    /// given width. u64::MAX marks a constant chunk with no pages.
    #[inline]
    pub fn values_per_page(&self, width: usize) -> u64 {
        match self.kind {
            CompressionKind::Flat => (PAGE_SIZE / width) as u64,
            CompressionKind::ForBitpacking => {
                if self.n_bits == 0 {
                    u64::MAX
                } else {
                    (PAGE_SIZE * 8 / self.n_bits as usize) as u64
                }
            }
        }
    }

    /// Returns number of pages needed to persist num_values slots.
    #[inline]
    pub fn num_pages_for(&self, num_values: u64, width: usize) -> u64 {
        if num_values == 0 {
            return 0;
        }
        let vpp = self.values_per_page(width);
        if vpp == u64::MAX {
            0
        } else {
            num_values.div_ceil(vpp)
        }
    }
}

/// Pack slots [start, end) of a fixed-width buffer into one page image.
/// Out must be zero-filled for packed encodings.
#[inline]
pub fn pack_slots(
    ty: PhysicalType,
    meta: &CompressionMeta,
    src: &[u8],
    start: usize,
    end: usize,
    out: &mut [u8],
) {
    let width = match ty.fixed_len() {
        Some(w) => w,
        None => unreachable!("packing slots of non-leaf type"),
    };
    match meta.kind {
        CompressionKind::Flat => {
            let bytes = &src[start * width..end * width];
            out[..bytes.len()].copy_from_slice(bytes);
        }
        CompressionKind::ForBitpacking => {
            let min = match &meta.min_max {
                Some(mm) => mm.min.to_bits(),
                None => unreachable!("packed chunk without statistics"),
            };
            // widening preserves deltas in the wrapping u64 domain,
            // so one path serves all integer families.
            let vals: Vec<u64> = (start..end)
                .map(|i| StorageValue::from_slot(ty, src, i).to_bits())
                .collect();
            pack_values(&vals, min, meta.n_bits as usize, out);
        }
    }
}

///// Inverse of [`pack_slots`]: fill slots [start, end) from a page image.
#[inline]
pub fn unpack_slots(
    ty: PhysicalType,
    meta: &CompressionMeta,
    packed: &[u8],
    dst: &mut [u8],
    start: usize,
    end: usize,
) {
    let width = match ty.fixed_len() {
        Some(w) => w,
        None => unreachable!("unpacking slots of non-leaf type"),
    };
    match meta.kind {
        CompressionKind::Flat => {
            let n_bytes = (end - start) * width;
            dst[start * width..end * width].copy_from_slice(&packed[..n_bytes]);
        }
        CompressionKind::ForBitpacking => {
            let min = match &meta.min_max {
                Some(mm) => mm.min.to_bits(),
                None => unreachable!("packed chunk without statistics"),
            };
            let mut vals = vec![0u64; end - start];
            unpack_values(packed, min, meta.n_bits as usize, &mut vals);
            for (i, bits) in vals.iter().enumerate() {
                let slot = &mut dst[(start + i) * width..(start + i + 1) * width];
                slot.copy_from_slice(&bits.to_le_bytes()[..width]);
            }
        }
    }
}

impl Ser<'_> for StorageValue {
    #[inline]
    fn ser_len(&self) -> usize {
        mem::size_of::<u8>() + mem::size_of::<u64>()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let tag = match self {
            StorageValue::Bool(_) => 1u8,
            StorageValue::Int64(_) => 2,
            StorageValue::UInt64(_) => 3,
            StorageValue::Float64(_) => 4,
        };
        let idx = out.ser_u8(start_idx, tag);
        out.ser_u64(idx, self.to_bits())
    }
}

impl Deser for StorageValue {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, tag) = input.deser_u8(start_idx)?;
        let (idx, bits) = input.deser_u64(idx)?;
        let res = match tag {
            1 => StorageValue::Bool(bits != 0),
            2 => StorageValue::Int64(bits as i64),
            3 => StorageValue::UInt64(bits),
            4 => StorageValue::Float64(f64::from_bits(bits)),
            _ => return Err(Error::InvalidFormat),
        };
        Ok((idx, res))
    }
}

impl Ser<'_> for MinMax {
    #[inline]
    fn ser_len(&self) -> usize {
        self.min.ser_len() + self.max.ser_len()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let idx = self.min.ser(out, start_idx);
        self.max.ser(out, idx)
    }
}

impl Deser for MinMax {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, min) = StorageValue::deser(input, start_idx)?;
        let (idx, max) = StorageValue::deser(input, idx)?;
        Ok((idx, MinMax { min, max }))
    }
}

impl Ser<'_> for CompressionMeta {
    #[inline]
    fn ser_len(&self) -> usize {
        mem::size_of::<u8>() * 2 + self.min_max.ser_len()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let idx = out.ser_u8(start_idx, self.kind as u8);
        let idx = out.ser_u8(idx, self.n_bits);
        self.min_max.ser(out, idx)
    }
}

impl Deser for CompressionMeta {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, kind) = input.deser_u8(start_idx)?;
        let kind = CompressionKind::from_u8(kind)?;
        let (idx, n_bits) = input.deser_u8(idx)?;
        let (idx, min_max) = Option::<MinMax>::deser(input, idx)?;
        Ok((
            idx,
            CompressionMeta {
                kind,
                n_bits,
                min_max,
            },
        ))
    }
}
