use crate::compression::bitpacking::*;
use crate::error::{Error, Result};
use kitedb_datatype::{LogicalType, StructField};
use semistr::SemiStr;
use std::mem;

/// Byte-level serialization of little-endian scalars.
///
/// All methods take a start index and return the index one past the
/// written/read bytes, so calls chain naturally.
pub trait Serde {
    /// Writes a u64 in little-endian order.
    fn ser_u64(&mut self, idx: usize, val: u64) -> usize;

    /// Writes an i64 in little-endian order.
    fn ser_i64(&mut self, idx: usize, val: i64) -> usize;

    /// Writes a u32 in little-endian order.
    fn ser_u32(&mut self, idx: usize, val: u32) -> usize;

    /// Writes a u16 in little-endian order.
    fn ser_u16(&mut self, idx: usize, val: u16) -> usize;

    /// Writes a single byte.
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize;

    /// Writes a bool as one byte.
    #[inline]
    fn ser_bool(&mut self, idx: usize, val: bool) -> usize {
        self.ser_u8(idx, if val { 1 } else { 0 })
    }

    /// Copies a byte slice into the buffer.
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize;

    /// Copies a fixed-size byte array into the buffer.
    fn ser_byte_array<const N: usize>(&mut self, idx: usize, val: &[u8; N]) -> usize;

    /// Hands out a mutable window for the caller to fill directly.
    fn ser_mut(&mut self, idx: usize, len: usize) -> (usize, &mut [u8]);

    /// Total buffer size in bytes.
    fn size(&self) -> usize;

    /// Reads a little-endian u64.
    fn deser_u64(&self, idx: usize) -> Result<(usize, u64)>;

    /// Reads a little-endian i64.
    fn deser_i64(&self, idx: usize) -> Result<(usize, i64)>;

    /// Reads a little-endian u32.
    fn deser_u32(&self, idx: usize) -> Result<(usize, u32)>;

    /// Reads a little-endian u16.
    fn deser_u16(&self, idx: usize) -> Result<(usize, u16)>;

    /// Reads a single byte.
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)>;

    /// Reads a bool stored as one byte.
    #[inline]
    fn deser_bool(&self, idx: usize) -> Result<(usize, bool)> {
        self.deser_u8(idx).map(|(i, r)| (i, r != 0))
    }

    /// Borrows len bytes from the buffer.
    fn deser_byte_slice(&self, idx: usize, len: usize) -> Result<(usize, &[u8])>;

    /// Reads a fixed-size byte array by copy.
    fn deser_byte_array<const N: usize>(&self, idx: usize) -> Result<(usize, [u8; N])>;

    /// Borrows a raw window for the caller to parse directly.
    fn deser(&self, idx: usize, len: usize) -> Result<(usize, &[u8])>;
}

macro_rules! impl_serde_num {
    ($ser_fn:ident, $deser_fn:ident, $ty:ty) => {
        #[inline]
        fn $ser_fn(&mut self, idx: usize, val: $ty) -> usize {
            debug_assert!(idx + mem::size_of::<$ty>() <= self.len());
            self[idx..idx + mem::size_of::<$ty>()].copy_from_slice(&val.to_le_bytes());
            idx + mem::size_of::<$ty>()
        }

        #[inline]
        fn $deser_fn(&self, idx: usize) -> Result<(usize, $ty)> {
            debug_assert!(idx + mem::size_of::<$ty>() <= self.len());
            let val = <$ty>::from_le_bytes(self[idx..idx + mem::size_of::<$ty>()].try_into()?);
            Ok((idx + mem::size_of::<$ty>(), val))
        }
    };
}

impl Serde for [u8] {
    impl_serde_num!(ser_u64, deser_u64, u64);
    impl_serde_num!(ser_i64, deser_i64, i64);
    impl_serde_num!(ser_u32, deser_u32, u32);
    impl_serde_num!(ser_u16, deser_u16, u16);

    #[inline]
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize {
        debug_assert!(idx < self.len());
        self[idx] = val;
        idx + 1
    }

    #[inline]
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)> {
        debug_assert!(idx < self.len());
        Ok((idx + 1, self[idx]))
    }

    #[inline]
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize {
        let end = idx + val.len();
        debug_assert!(end <= self.len());
        self[idx..end].copy_from_slice(val);
        end
    }

    #[inline]
    fn ser_byte_array<const N: usize>(&mut self, idx: usize, val: &[u8; N]) -> usize {
        self.ser_byte_slice(idx, val)
    }

    #[inline]
    fn ser_mut(&mut self, idx: usize, len: usize) -> (usize, &mut [u8]) {
        let end = idx + len;
        debug_assert!(end <= self.len());
        (end, &mut self[idx..end])
    }

    #[inline]
    fn size(&self) -> usize {
        self.len()
    }

    #[inline]
    fn deser_byte_slice(&self, idx: usize, len: usize) -> Result<(usize, &[u8])> {
        let end = idx + len;
        debug_assert!(end <= self.len());
        Ok((end, &self[idx..end]))
    }

    #[inline]
    fn deser_byte_array<const N: usize>(&self, idx: usize) -> Result<(usize, [u8; N])> {
        let (end, bytes) = self.deser_byte_slice(idx, N)?;
        Ok((end, bytes.try_into()?))
    }

    #[inline]
    fn deser(&self, idx: usize, len: usize) -> Result<(usize, &[u8])> {
        self.deser_byte_slice(idx, len)
    }
}

/// Serialization into a pre-sized buffer.
///
/// Callers ask for `ser_len` first, reserve exactly that many bytes,
/// then `ser` writes without any bounds decisions of its own.
pub trait Ser<'a> {
    /// Exact number of bytes `ser` will write.
    fn ser_len(&self) -> usize;

    /// Writes self at start_idx. The buffer is already big enough.
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize;
}

/// Deserialization producing an owned value, so the parsed result can
/// outlive the input buffer.
pub trait Deser: Sized {
    /// Parses one value starting at start_idx.
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)>;
}

macro_rules! impl_ser_deser_num {
    ($ty:ty, $ser_fn:ident, $deser_fn:ident) => {
        impl Ser<'_> for $ty {
            #[inline]
            fn ser_len(&self) -> usize {
                mem::size_of::<$ty>()
            }

            #[inline]
            fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
                out.$ser_fn(start_idx, *self)
            }
        }

        impl Deser for $ty {
            #[inline]
            fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
                input.$deser_fn(start_idx)
            }
        }
    };
}

impl_ser_deser_num!(u64, ser_u64, deser_u64);
impl_ser_deser_num!(i64, ser_i64, deser_i64);
impl_ser_deser_num!(u32, ser_u32, deser_u32);
impl_ser_deser_num!(u16, ser_u16, deser_u16);
impl_ser_deser_num!(u8, ser_u8, deser_u8);
impl_ser_deser_num!(bool, ser_bool, deser_bool);

impl<const N: usize> Ser<'_> for [u8; N] {
    #[inline]
    fn ser_len(&self) -> usize {
        N
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        out.ser_byte_array(start_idx, self)
    }
}

impl<const N: usize> Deser for [u8; N] {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        input.deser_byte_array(start_idx)
    }
}

// Sequences carry a u64 element count ahead of the elements.
impl<'a, T: Ser<'a>> Ser<'a> for [T] {
    #[inline]
    fn ser_len(&self) -> usize {
        self.iter()
            .map(|v| v.ser_len())
            .sum::<usize>()
            + mem::size_of::<u64>()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let mut idx = out.ser_u64(start_idx, self.len() as u64);
        for v in self {
            idx = v.ser(out, idx);
        }
        idx
    }
}

impl<T: Deser> Deser for Vec<T> {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (mut idx, len) = input.deser_u64(start_idx)?;
        let mut vec = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let (next, val) = T::deser(input, idx)?;
            idx = next;
            vec.push(val);
        }
        Ok((idx, vec))
    }
}

// Options carry a one-byte presence flag ahead of the payload.
impl<'a, T: Ser<'a>> Ser<'a> for Option<T> {
    #[inline]
    fn ser_len(&self) -> usize {
        mem::size_of::<u8>() + self.as_ref().map_or(0, |v| v.ser_len())
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        match self {
            Some(v) => {
                let idx = true.ser(out, start_idx);
                v.ser(out, idx)
            }
            None => false.ser(out, start_idx),
        }
    }
}

impl<T: Deser> Deser for Option<T> {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, present) = input.deser_bool(start_idx)?;
        if !present {
            return Ok((idx, None));
        }
        let (idx, v) = T::deser(input, idx)?;
        Ok((idx, Some(v)))
    }
}

impl<'a, T: Ser<'a>> Ser<'a> for Box<T> {
    #[inline]
    fn ser_len(&self) -> usize {
        (**self).ser_len()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        (**self).ser(out, start_idx)
    }
}

impl<T: Deser> Deser for Box<T> {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, v) = T::deser(input, start_idx)?;
        Ok((idx, Box::new(v)))
    }
}

impl Ser<'_> for SemiStr {
    #[inline]
    fn ser_len(&self) -> usize {
        mem::size_of::<u32>() + self.len()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let idx = out.ser_u32(start_idx, self.len() as u32);
        out.ser_byte_slice(idx, self.as_bytes())
    }
}

impl Deser for SemiStr {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, len) = input.deser_u32(start_idx)?;
        let (idx, bytes) = input.deser_byte_slice(idx, len as usize)?;
        // column names must come back as valid utf-8
        Ok((idx, SemiStr::new(str::from_utf8(bytes)?)))
    }
}

// Nested types append their child types after the leading id byte,
// so one stream round-trips arbitrarily deep schemas.
impl Ser<'_> for LogicalType {
    #[inline]
    fn ser_len(&self) -> usize {
        mem::size_of::<u8>()
            + match self {
                LogicalType::List(child) => child.ser_len(),
                LogicalType::Array(child, _) => child.ser_len() + mem::size_of::<u64>(),
                LogicalType::Struct(fields) => fields[..].ser_len(),
                _ => 0,
            }
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        match self {
            LogicalType::List(child) => {
                let idx = out.ser_u8(start_idx, 16);
                child.ser(out, idx)
            }
            LogicalType::Array(child, n) => {
                let idx = out.ser_u8(start_idx, 18);
                let idx = child.ser(out, idx);
                out.ser_u64(idx, *n)
            }
            LogicalType::Struct(fields) => {
                let idx = out.ser_u8(start_idx, 17);
                fields[..].ser(out, idx)
            }
            _ => out.ser_u8(start_idx, self.physical_type() as u8),
        }
    }
}

impl Deser for LogicalType {
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, tag) = input.deser_u8(start_idx)?;
        let res = match tag {
            1 => LogicalType::Bool,
            2 => LogicalType::Int8,
            3 => LogicalType::Int16,
            4 => LogicalType::Int32,
            5 => LogicalType::Int64,
            6 => LogicalType::Int128,
            7 => LogicalType::UInt8,
            8 => LogicalType::UInt16,
            9 => LogicalType::UInt32,
            10 => LogicalType::UInt64,
            11 => LogicalType::Float32,
            12 => LogicalType::Float64,
            13 => LogicalType::Interval,
            14 => LogicalType::InternalId,
            15 => LogicalType::String,
            16 => {
                let (idx, child) = LogicalType::deser(input, idx)?;
                return Ok((idx, LogicalType::list(child)));
            }
            17 => {
                let (idx, fields) = Vec::<StructField>::deser(input, idx)?;
                return Ok((idx, LogicalType::Struct(fields)));
            }
            18 => {
                let (idx, child) = LogicalType::deser(input, idx)?;
                let (idx, n) = input.deser_u64(idx)?;
                return Ok((idx, LogicalType::array(child, n)));
            }
            _ => return Err(Error::InvalidFormat),
        };
        Ok((idx, res))
    }
}

impl Ser<'_> for StructField {
    #[inline]
    fn ser_len(&self) -> usize {
        self.name.ser_len() + self.ty.ser_len()
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let idx = self.name.ser(out, start_idx);
        self.ty.ser(out, idx)
    }
}

impl Deser for StructField {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, name) = SemiStr::deser(input, start_idx)?;
        let (idx, ty) = LogicalType::deser(input, idx)?;
        Ok((idx, StructField { name, ty }))
    }
}

/// Returns serialized length of a field tag.
#[inline]
pub fn field_tag_len(tag: &'static str) -> usize {
    mem::size_of::<u8>() + tag.len()
}

/// Writes a short ascii tag ahead of a field.
///
/// Tags cost a few bytes per persisted struct but make corrupted files
/// diagnosable: a reader that drifts out of sync fails on the next tag
/// instead of reinterpreting garbage.
#[inline]
pub fn ser_field_tag<S: Serde + ?Sized>(out: &mut S, idx: usize, tag: &'static str) -> usize {
    debug_assert!(!tag.is_empty() && tag.len() <= u8::MAX as usize);
    let idx = out.ser_u8(idx, tag.len() as u8);
    out.ser_byte_slice(idx, tag.as_bytes())
}

/// Consumes a field tag, failing if it does not match the expected one.
#[inline]
pub fn expect_field_tag<S: Serde + ?Sized>(
    input: &S,
    idx: usize,
    tag: &'static str,
) -> Result<usize> {
    let (idx, len) = input.deser_u8(idx)?;
    if len as usize != tag.len() {
        return Err(Error::FieldTagMismatch(tag));
    }
    let (idx, bytes) = input.deser_byte_slice(idx, len as usize)?;
    if bytes != tag.as_bytes() {
        return Err(Error::FieldTagMismatch(tag));
    }
    Ok(idx)
}

/// Frame-of-reference bitpacking serializer.
///
/// Layout:
///
/// ```text
/// | field  | bytes          |
/// |--------|----------------|
/// | n_bits | 1              |
/// | len    | 8              |
/// | min    | sizeof(T)      |
/// | packed | (n_bits*len)/8 |
/// ```
///
/// Empty input stops after len. With n_bits 0 every value equals min
/// and the packed section is empty. When packing would not save any
/// space `new` returns None and the caller must store values another
/// way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForBitpackingSer<'a, T> {
    data: &'a [T],
    info: (usize, T),
}

impl<'a, T: BitPackable + Ord> ForBitpackingSer<'a, T> {
    #[inline]
    pub fn new(data: &'a [T]) -> Option<Self> {
        prepare_for_bitpacking(data).map(|info| ForBitpackingSer { data, info })
    }
}

impl<'a, T: BitPackable + Ord + Ser<'a>> Ser<'a> for ForBitpackingSer<'a, T> {
    #[inline]
    fn ser_len(&self) -> usize {
        let (n_bits, _) = self.info;
        mem::size_of::<u8>()
            + mem::size_of::<u64>()
            + if self.data.is_empty() {
                0
            } else {
                mem::size_of::<T>() + (n_bits * self.data.len()).div_ceil(8)
            }
    }

    #[inline]
    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let (n_bits, min) = self.info;
        let idx = out.ser_u8(start_idx, n_bits as u8);
        let idx = out.ser_u64(idx, self.data.len() as u64);
        if self.data.is_empty() {
            return idx;
        }
        let idx = min.ser(out, idx);
        let packed_len = (n_bits * self.data.len()).div_ceil(8);
        let (idx, to_pack) = out.ser_mut(idx, packed_len);
        pack_values(self.data, min, n_bits, to_pack);
        idx
    }
}

/// Inverse of [`ForBitpackingSer`], producing owned values.
pub struct ForBitpackingDeser<T>(pub Vec<T>);

impl<T: BitPackable + Deser> Deser for ForBitpackingDeser<T> {
    #[inline]
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (idx, n_bits) = input.deser_u8(start_idx)?;
        let (idx, n_elems) = input.deser_u64(idx)?;
        if n_elems == 0 {
            return Ok((idx, ForBitpackingDeser(Vec::new())));
        }
        if n_bits as usize > T::BITS {
            return Err(Error::InvalidCompressedData);
        }
        let (idx, min) = T::deser(input, idx)?;
        let n_bytes = (n_elems as usize * n_bits as usize).div_ceil(8);
        if idx + n_bytes > input.size() {
            return Err(Error::InvalidCompressedData);
        }
        let (idx, packed) = input.deser(idx, n_bytes)?;
        let mut data = vec![T::ZERO; n_elems as usize];
        unpack_values(packed, min, n_bits as usize, &mut data);
        Ok((idx, ForBitpackingDeser(data)))
    }
}
