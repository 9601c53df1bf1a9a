//! Struct chunk: one child chunk per field, driven in lockstep.
//!
//! Every operation fans out to all children in field order. The
//! struct level itself stores nothing beyond the shared null mask
//! kept by the owning chunk.

use crate::chunk::ColumnChunk;
use crate::error::Result;
use crate::serde::{expect_field_tag, field_tag_len, ser_field_tag, Deser, Ser, Serde};
use crate::vector::ValueVector;
use kitedb_datatype::StructField;

pub struct StructChunk {
    pub(crate) children: Vec<ColumnChunk>,
}

impl StructChunk {
    pub fn new(fields: &[StructField], capacity: usize) -> Self {
        StructChunk {
            children: fields
                .iter()
                .map(|f| ColumnChunk::new(&f.ty, capacity, true))
                .collect(),
        }
    }

    #[inline]
    pub fn children(&self) -> &[ColumnChunk] {
        &self.children
    }

    pub fn append_row(&mut self, vector: &ValueVector, idx: usize) -> Result<()> {
        for (f, child) in self.children.iter_mut().enumerate() {
            child.append_one(vector.struct_child(f), idx)?;
        }
        Ok(())
    }

    pub fn write_row(&mut self, row: usize, vector: &ValueVector, idx: usize) -> Result<()> {
        for (f, child) in self.children.iter_mut().enumerate() {
            child.write_value(row, vector.struct_child(f), idx)?;
        }
        Ok(())
    }

    pub fn copy_rows_from(
        &mut self,
        dst_row: usize,
        src: &StructChunk,
        src_row: usize,
        num_rows: usize,
    ) -> Result<()> {
        debug_assert!(self.children.len() == src.children.len());
        for (child, src_child) in self.children.iter_mut().zip(&src.children) {
            child.write_chunk(dst_row, src_child, src_row, num_rows)?;
        }
        Ok(())
    }

    pub fn scan(
        &self,
        start: usize,
        count: usize,
        out: &mut ValueVector,
        out_start: usize,
    ) -> Result<()> {
        for (f, child) in self.children.iter().enumerate() {
            child.scan(start, count, out.struct_child_mut(f), out_start)?;
        }
        Ok(())
    }

    pub fn ser_extra_len(&self) -> usize {
        field_tag_len("chld") + self.children.ser_len()
    }

    pub fn ser_extra<S: Serde + ?Sized>(&self, out: &mut S, idx: usize) -> usize {
        let idx = ser_field_tag(out, idx, "chld");
        self.children.ser(out, idx)
    }

    pub fn deser_extra<S: Serde + ?Sized>(input: &S, idx: usize) -> Result<(usize, Self)> {
        let idx = expect_field_tag(input, idx, "chld")?;
        let (idx, children) = Vec::<ColumnChunk>::deser(input, idx)?;
        Ok((idx, StructChunk { children }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ResidencyState;
    use crate::page::MemPageStore;
    use kitedb_datatype::LogicalType;

    fn person_type() -> LogicalType {
        LogicalType::Struct(vec![
            StructField::new("id", LogicalType::Int64),
            StructField::new("name", LogicalType::String),
        ])
    }

    fn person_vector(rows: &[Option<(Option<i64>, Option<&str>)>]) -> ValueVector {
        let mut vec = ValueVector::new(&person_type());
        vec.set_len(rows.len());
        for (i, row) in rows.iter().enumerate() {
            match row {
                Some((id, name)) => {
                    match id {
                        Some(id) => vec.struct_child_mut(0).set_i64(i, *id),
                        None => vec.struct_child_mut(0).set_null(i, true),
                    }
                    match name {
                        Some(name) => vec.struct_child_mut(1).set_string(i, name.as_bytes()),
                        None => vec.struct_child_mut(1).set_null(i, true),
                    }
                }
                None => {
                    vec.set_null(i, true);
                    vec.struct_child_mut(0).set_null(i, true);
                    vec.struct_child_mut(1).set_null(i, true);
                }
            }
        }
        vec
    }

    #[test]
    fn test_struct_chunk_append_scan() {
        let mut chunk = ColumnChunk::new(&person_type(), 2048, true);
        let rows = [
            Some((Some(1), Some("ada"))),
            Some((Some(2), None)),
            None,
            Some((None, Some("alan"))),
        ];
        chunk.append_all(&person_vector(&rows)).unwrap();
        assert_eq!(chunk.num_values(), 4);

        let mut out = ValueVector::new(&person_type());
        out.set_len(4);
        chunk.scan(0, 4, &mut out, 0).unwrap();
        assert_eq!(out.struct_child(0).get_i64(0), 1);
        assert_eq!(out.struct_child(1).get_string(0), b"ada");
        assert!(out.struct_child(1).is_null(1));
        assert!(out.is_null(2));
        assert!(out.struct_child(0).is_null(3));
        assert_eq!(out.struct_child(1).get_string(3), b"alan");
    }

    #[test]
    fn test_struct_write_fans_out() {
        let mut chunk = ColumnChunk::new(&person_type(), 2048, true);
        chunk
            .append_all(&person_vector(&[
                Some((Some(1), Some("a"))),
                Some((Some(2), Some("b"))),
            ]))
            .unwrap();

        let upd = person_vector(&[Some((Some(20), Some("bb")))]);
        chunk.write_value(1, &upd, 0).unwrap();
        // a write past the count materializes nulls in every child.
        chunk.write_value(4, &upd, 0).unwrap();
        assert_eq!(chunk.num_values(), 5);
        assert!(chunk.is_null(2));
        assert!(chunk.is_null(3));

        let mut out = ValueVector::new(&person_type());
        out.set_len(5);
        chunk.scan(0, 5, &mut out, 0).unwrap();
        assert_eq!(out.struct_child(0).get_i64(1), 20);
        assert_eq!(out.struct_child(1).get_string(1), b"bb");
        assert!(out.struct_child(0).is_null(3));
        assert_eq!(out.struct_child(0).get_i64(4), 20);
        assert_eq!(out.struct_child(1).get_string(4), b"bb");
    }

    #[test]
    fn test_struct_chunk_flush_load() {
        let store = MemPageStore::new(8, 64);
        let mut chunk = ColumnChunk::new(&person_type(), 2048, true);
        let rows: Vec<Option<(Option<i64>, Option<&str>)>> = (0..300)
            .map(|i| {
                if i % 17 == 0 {
                    None
                } else {
                    Some((Some(i as i64), Some(if i % 2 == 0 { "even" } else { "odd" })))
                }
            })
            .collect();
        chunk.append_all(&person_vector(&rows)).unwrap();
        chunk.finalize().unwrap();
        chunk.flush(&store, true).unwrap();
        // the struct level itself occupies no pages.
        assert_eq!(chunk.metadata().unwrap().num_pages, 0);

        let mut buf = vec![0u8; chunk.ser_len()];
        let idx = chunk.ser(&mut buf[..], 0);
        assert_eq!(idx, buf.len());
        let (_, mut restored) = ColumnChunk::deser(&buf[..], 0).unwrap();
        assert_eq!(restored.residency(), ResidencyState::OnDisk);
        restored.load(&store).unwrap();

        let mut out = ValueVector::new(&person_type());
        out.set_len(300);
        restored.scan(0, 300, &mut out, 0).unwrap();
        for (i, row) in rows.iter().enumerate() {
            match row {
                None => assert!(out.is_null(i)),
                Some((id, name)) => {
                    assert_eq!(out.struct_child(0).get_i64(i), id.unwrap());
                    assert_eq!(out.struct_child(1).get_string(i), name.unwrap().as_bytes());
                }
            }
        }
    }
}
