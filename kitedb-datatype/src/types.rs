use crate::error::{Error, Result};
use semistr::SemiStr;
use std::mem;

/// Identifier of a table in the catalog.
pub type TableId = u64;

/// Marks a table id not assigned yet.
pub const INVALID_TABLE_ID: TableId = !0;

/// Physical representation of column values inside a chunk buffer.
///
/// Leaf types own a fixed-width slot per value. String, List and Struct
/// carry no payload of their own; their data lives in sub-chunks.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalType {
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Int128 = 6,
    UInt8 = 7,
    UInt16 = 8,
    UInt32 = 9,
    UInt64 = 10,
    Float32 = 11,
    Float64 = 12,
    Interval = 13,
    InternalId = 14,
    String = 15,
    List = 16,
    Struct = 17,
}

impl PhysicalType {
    /// Decode from the persisted type id.
    #[inline]
    pub fn from_u8(v: u8) -> Result<Self> {
        let res = match v {
            1 => PhysicalType::Bool,
            2 => PhysicalType::Int8,
            3 => PhysicalType::Int16,
            4 => PhysicalType::Int32,
            5 => PhysicalType::Int64,
            6 => PhysicalType::Int128,
            7 => PhysicalType::UInt8,
            8 => PhysicalType::UInt16,
            9 => PhysicalType::UInt32,
            10 => PhysicalType::UInt64,
            11 => PhysicalType::Float32,
            12 => PhysicalType::Float64,
            13 => PhysicalType::Interval,
            14 => PhysicalType::InternalId,
            15 => PhysicalType::String,
            16 => PhysicalType::List,
            17 => PhysicalType::Struct,
            _ => return Err(Error::InvalidTypeId),
        };
        Ok(res)
    }

    /// Returns slot width in bytes inside a chunk buffer.
    /// None for types without an own payload.
    #[inline]
    pub fn fixed_len(self) -> Option<usize> {
        let res = match self {
            PhysicalType::Bool | PhysicalType::Int8 | PhysicalType::UInt8 => 1,
            PhysicalType::Int16 | PhysicalType::UInt16 => 2,
            PhysicalType::Int32 | PhysicalType::UInt32 | PhysicalType::Float32 => 4,
            PhysicalType::Int64
            | PhysicalType::UInt64
            | PhysicalType::Float64
            | PhysicalType::InternalId => 8,
            PhysicalType::Int128 | PhysicalType::Interval => 16,
            PhysicalType::String | PhysicalType::List | PhysicalType::Struct => return None,
        };
        Some(res)
    }

    /// Returns whether min/max statistics are tracked for this type.
    ///
    /// Struct has no own payload to compare. Interval and Int128 have no
    /// comparable single-word representation and are exempted.
    #[inline]
    pub fn has_min_max(self) -> bool {
        !matches!(
            self,
            PhysicalType::Struct
                | PhysicalType::Interval
                | PhysicalType::Int128
                | PhysicalType::String
                | PhysicalType::List
        )
    }

    /// Returns whether the type is composed of sub-chunks.
    #[inline]
    pub fn is_nested(self) -> bool {
        matches!(self, PhysicalType::List | PhysicalType::Struct)
    }
}

/// One field of a struct type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub name: SemiStr,
    pub ty: LogicalType,
}

impl StructField {
    #[inline]
    pub fn new(name: &str, ty: LogicalType) -> Self {
        StructField {
            name: SemiStr::new(name),
            ty,
        }
    }
}

/// Logical column type, including nested child types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Interval,
    InternalId,
    String,
    List(Box<LogicalType>),
    /// Fixed-length list. Shares the list storage layout.
    Array(Box<LogicalType>, u64),
    Struct(Vec<StructField>),
}

impl LogicalType {
    #[inline]
    pub fn list(child: LogicalType) -> Self {
        LogicalType::List(Box::new(child))
    }

    #[inline]
    pub fn array(child: LogicalType, num_elements: u64) -> Self {
        LogicalType::Array(Box::new(child), num_elements)
    }

    #[inline]
    pub fn physical_type(&self) -> PhysicalType {
        match self {
            LogicalType::Bool => PhysicalType::Bool,
            LogicalType::Int8 => PhysicalType::Int8,
            LogicalType::Int16 => PhysicalType::Int16,
            LogicalType::Int32 => PhysicalType::Int32,
            LogicalType::Int64 => PhysicalType::Int64,
            LogicalType::Int128 => PhysicalType::Int128,
            LogicalType::UInt8 => PhysicalType::UInt8,
            LogicalType::UInt16 => PhysicalType::UInt16,
            LogicalType::UInt32 => PhysicalType::UInt32,
            LogicalType::UInt64 => PhysicalType::UInt64,
            LogicalType::Float32 => PhysicalType::Float32,
            LogicalType::Float64 => PhysicalType::Float64,
            LogicalType::Interval => PhysicalType::Interval,
            LogicalType::InternalId => PhysicalType::InternalId,
            LogicalType::String => PhysicalType::String,
            LogicalType::List(_) | LogicalType::Array(..) => PhysicalType::List,
            LogicalType::Struct(_) => PhysicalType::Struct,
        }
    }

    /// Returns element type of a list or array.
    #[inline]
    pub fn child_type(&self) -> &LogicalType {
        match self {
            LogicalType::List(child) | LogicalType::Array(child, _) => child,
            _ => unreachable!("child type of non-list type"),
        }
    }

    /// Returns field list of a struct.
    #[inline]
    pub fn struct_fields(&self) -> &[StructField] {
        match self {
            LogicalType::Struct(fields) => fields,
            _ => unreachable!("fields of non-struct type"),
        }
    }

    /// Returns fixed element count of an array.
    #[inline]
    pub fn array_num_elements(&self) -> u64 {
        match self {
            LogicalType::Array(_, n) => *n,
            _ => unreachable!("element count of non-array type"),
        }
    }
}

/// Time interval with mixed granularity, stored as a 16-byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl Interval {
    pub const STORE_LEN: usize = 16;

    #[inline]
    pub fn new(months: i32, days: i32, micros: i64) -> Self {
        Interval {
            months,
            days,
            micros,
        }
    }

    #[inline]
    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::STORE_LEN);
        out[0..4].copy_from_slice(&self.months.to_le_bytes());
        out[4..8].copy_from_slice(&self.days.to_le_bytes());
        out[8..16].copy_from_slice(&self.micros.to_le_bytes());
    }

    #[inline]
    pub fn read_from(src: &[u8]) -> Self {
        debug_assert!(src.len() >= Self::STORE_LEN);
        Interval {
            months: i32::from_le_bytes(src[0..4].try_into().unwrap()),
            days: i32::from_le_bytes(src[4..8].try_into().unwrap()),
            micros: i64::from_le_bytes(src[8..16].try_into().unwrap()),
        }
    }
}

/// Node identifier: table plus row offset within the table.
///
/// Chunks persist only the offset; the table id is shared per column
/// and recombined when scanning into vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InternalId {
    pub table: TableId,
    pub offset: u64,
}

impl InternalId {
    pub const STORE_LEN: usize = 16;

    #[inline]
    pub fn new(table: TableId, offset: u64) -> Self {
        InternalId { table, offset }
    }

    #[inline]
    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::STORE_LEN);
        out[0..8].copy_from_slice(&self.table.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
    }

    #[inline]
    pub fn read_from(src: &[u8]) -> Self {
        debug_assert!(src.len() >= Self::STORE_LEN);
        InternalId {
            table: u64::from_le_bytes(src[0..8].try_into().unwrap()),
            offset: u64::from_le_bytes(src[8..16].try_into().unwrap()),
        }
    }
}

const _: () = assert!(mem::size_of::<Interval>() == Interval::STORE_LEN);
const _: () = assert!(mem::size_of::<InternalId>() == InternalId::STORE_LEN);
