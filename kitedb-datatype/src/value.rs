use crate::types::PhysicalType;
use std::cmp::Ordering;

/// Single value lifted out of a chunk slot, used for min/max statistics.
///
/// Narrow integers widen to 64-bit so one variant covers each family.
/// Only types with [`PhysicalType::has_min_max`] can be represented.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageValue {
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
}

impl StorageValue {
    /// Reads the value at slot `idx` of a fixed-width chunk buffer.
    #[inline]
    pub fn from_slot(ty: PhysicalType, buf: &[u8], idx: usize) -> Self {
        macro_rules! read {
            ($t:ty, $n:literal) => {{
                let start = idx * $n;
                <$t>::from_le_bytes(buf[start..start + $n].try_into().unwrap())
            }};
        }
        match ty {
            PhysicalType::Bool => StorageValue::Bool(read!(u8, 1) != 0),
            PhysicalType::Int8 => StorageValue::Int64(read!(i8, 1) as i64),
            PhysicalType::Int16 => StorageValue::Int64(read!(i16, 2) as i64),
            PhysicalType::Int32 => StorageValue::Int64(read!(i32, 4) as i64),
            PhysicalType::Int64 => StorageValue::Int64(read!(i64, 8)),
            PhysicalType::UInt8 => StorageValue::UInt64(read!(u8, 1) as u64),
            PhysicalType::UInt16 => StorageValue::UInt64(read!(u16, 2) as u64),
            PhysicalType::UInt32 => StorageValue::UInt64(read!(u32, 4) as u64),
            PhysicalType::UInt64 | PhysicalType::InternalId => StorageValue::UInt64(read!(u64, 8)),
            PhysicalType::Float32 => StorageValue::Float64(read!(f32, 4) as f64),
            PhysicalType::Float64 => StorageValue::Float64(read!(f64, 8)),
            PhysicalType::Int128
            | PhysicalType::Interval
            | PhysicalType::String
            | PhysicalType::List
            | PhysicalType::Struct => unreachable!("statistics on unsupported type"),
        }
    }

    /// Total order between two values of the same variant.
    /// Floats compare via total order so NaN does not poison statistics.
    #[inline]
    pub fn compare(&self, other: &StorageValue) -> Ordering {
        match (self, other) {
            (StorageValue::Bool(a), StorageValue::Bool(b)) => a.cmp(b),
            (StorageValue::Int64(a), StorageValue::Int64(b)) => a.cmp(b),
            (StorageValue::UInt64(a), StorageValue::UInt64(b)) => a.cmp(b),
            (StorageValue::Float64(a), StorageValue::Float64(b)) => a.total_cmp(b),
            _ => unreachable!("comparing values of different kinds"),
        }
    }

    #[inline]
    pub fn min(self, other: StorageValue) -> StorageValue {
        if self.compare(&other) == Ordering::Greater {
            other
        } else {
            self
        }
    }

    #[inline]
    pub fn max(self, other: StorageValue) -> StorageValue {
        if self.compare(&other) == Ordering::Less {
            other
        } else {
            self
        }
    }

    /// Raw 64-bit image for persistence. Pairs with [`StorageValue::from_bits`].
    #[inline]
    pub fn to_bits(self) -> u64 {
        match self {
            StorageValue::Bool(v) => v as u64,
            StorageValue::Int64(v) => v as u64,
            StorageValue::UInt64(v) => v,
            StorageValue::Float64(v) => v.to_bits(),
        }
    }

    /// Rebuilds the value from its 64-bit image, variant chosen by type.
    #[inline]
    pub fn from_bits(ty: PhysicalType, bits: u64) -> Self {
        match ty {
            PhysicalType::Bool => StorageValue::Bool(bits != 0),
            PhysicalType::Int8 | PhysicalType::Int16 | PhysicalType::Int32 | PhysicalType::Int64 => {
                StorageValue::Int64(bits as i64)
            }
            PhysicalType::UInt8
            | PhysicalType::UInt16
            | PhysicalType::UInt32
            | PhysicalType::UInt64
            | PhysicalType::InternalId => StorageValue::UInt64(bits),
            PhysicalType::Float32 | PhysicalType::Float64 => {
                StorageValue::Float64(f64::from_bits(bits))
            }
            PhysicalType::Int128
            | PhysicalType::Interval
            | PhysicalType::String
            | PhysicalType::List
            | PhysicalType::Struct => unreachable!("statistics on unsupported type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slot_widening() {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&(-5i32).to_le_bytes());
        buf[4..8].copy_from_slice(&7i32.to_le_bytes());
        assert_eq!(
            StorageValue::from_slot(PhysicalType::Int32, &buf, 0),
            StorageValue::Int64(-5)
        );
        assert_eq!(
            StorageValue::from_slot(PhysicalType::Int32, &buf, 1),
            StorageValue::Int64(7)
        );

        let mut buf = vec![0u8; 8];
        buf[0..4].copy_from_slice(&1.5f32.to_le_bytes());
        assert_eq!(
            StorageValue::from_slot(PhysicalType::Float32, &buf, 0),
            StorageValue::Float64(1.5)
        );
    }

    #[test]
    fn test_min_max() {
        let a = StorageValue::Int64(-3);
        let b = StorageValue::Int64(10);
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);

        let nan = StorageValue::Float64(f64::NAN);
        let one = StorageValue::Float64(1.0);
        // NaN sorts above all finite values in total order.
        assert_eq!(nan.max(one).to_bits(), nan.to_bits());
    }

    #[test]
    fn test_bits_roundtrip() {
        let vals = [
            (PhysicalType::Bool, StorageValue::Bool(true)),
            (PhysicalType::Int64, StorageValue::Int64(-42)),
            (PhysicalType::UInt64, StorageValue::UInt64(u64::MAX)),
            (PhysicalType::Float64, StorageValue::Float64(-0.25)),
        ];
        for (ty, v) in vals {
            assert_eq!(StorageValue::from_bits(ty, v.to_bits()), v);
        }
    }
}
